//! The per-process runtime owning every locally hosted agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use agency_journal::{FileJournal, Journal, JournalKeeper, MemoryJournal, Recorder, SyncMode};
use agency_types::AgentId;
use tracing::{debug, info, warn};

use crate::agent::AgencyAgent;
use crate::config::{AgencyConfig, KeeperKind};
use crate::error::{AgencyError, AgencyResult};
use crate::medium::AgentMedium;
use crate::messaging::Messaging;
use crate::retrying::RetryPolicy;
use crate::time::{Clock, Scheduler};

pub struct Agency {
    config: AgencyConfig,
    scheduler: Arc<Scheduler>,
    messaging: Arc<dyn Messaging>,
    keeper: Option<Arc<dyn JournalKeeper>>,
    agents: BTreeMap<AgentId, AgencyAgent>,
    next_base: u64,
}

impl Agency {
    /// Builds an agency whose journal keeper follows `config.journal`.
    pub fn new(
        config: AgencyConfig,
        clock: Arc<dyn Clock>,
        messaging: Arc<dyn Messaging>,
    ) -> AgencyResult<Self> {
        let keeper: Option<Arc<dyn JournalKeeper>> = if config.journal.enabled {
            match config.journal.keeper {
                KeeperKind::Memory => Some(Arc::new(MemoryJournal::new())),
                KeeperKind::File => Some(Arc::new(FileJournal::open(
                    &config.journal.path,
                    SyncMode::Flush,
                )?)),
            }
        } else {
            None
        };
        Ok(Self::with_keeper(config, clock, messaging, keeper))
    }

    pub fn with_keeper(
        config: AgencyConfig,
        clock: Arc<dyn Clock>,
        messaging: Arc<dyn Messaging>,
        keeper: Option<Arc<dyn JournalKeeper>>,
    ) -> Self {
        Self {
            config,
            scheduler: Arc::new(Scheduler::new(clock)),
            messaging,
            keeper,
            agents: BTreeMap::new(),
            next_base: 1,
        }
    }

    pub fn config(&self) -> &AgencyConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn messaging(&self) -> &Arc<dyn Messaging> {
        &self.messaging
    }

    pub fn keeper(&self) -> Option<&Arc<dyn JournalKeeper>> {
        self.keeper.as_ref()
    }

    pub fn now(&self) -> f64 {
        self.scheduler.clock().now()
    }

    /// Due time of the earliest pending timeout.
    pub fn next_timer(&self) -> Option<f64> {
        self.scheduler.next_due()
    }

    /// Starts an agent whose recorder base is the next free index.
    pub fn start_agent(&mut self, agent_id: impl Into<AgentId>) -> AgencyResult<&mut AgencyAgent> {
        let base = self.next_base;
        self.start_agent_with_base(agent_id, vec![base])
    }

    /// Starts an agent with an explicit recorder base. An agent built with
    /// the base of a recorded one hands out the same journal ids, which is
    /// what replaying its entries needs.
    pub fn start_agent_with_base(
        &mut self,
        agent_id: impl Into<AgentId>,
        base: Vec<u64>,
    ) -> AgencyResult<&mut AgencyAgent> {
        let agent_id = agent_id.into();
        if self.agents.contains_key(&agent_id) {
            return Err(AgencyError::DuplicateAgent(agent_id));
        }
        if let Some(first) = base.first() {
            self.next_base = self.next_base.max(first + 1);
        }
        let journal = match &self.keeper {
            Some(keeper) => Journal::recording(agent_id.as_str(), keeper.clone()),
            None => Journal::off(agent_id.as_str()),
        };
        let medium = AgentMedium::new(
            agent_id.clone(),
            &self.config.messaging.shard,
            self.config.messaging.default_timeout,
            self.scheduler.clone(),
            self.messaging.clone(),
            journal,
        );
        let agent = AgencyAgent::new(
            Arc::new(medium),
            Recorder::root(base),
            RetryPolicy::from(&self.config.retry),
        );
        Ok(self.agents.entry(agent_id).or_insert(agent))
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<&AgencyAgent> {
        self.agents.get(agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: &AgentId) -> Option<&mut AgencyAgent> {
        self.agents.get_mut(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    /// Delivers queued messages and fires due timeouts until there is
    /// nothing left to do. Returns the number of dispatches.
    pub fn run_pending(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            let mut progressed = false;
            for (agent_id, agent) in self.agents.iter_mut() {
                if agent.is_terminated() {
                    continue;
                }
                while let Some(msg) = self.messaging.next_message(agent_id) {
                    progressed = true;
                    dispatched += 1;
                    if let Err(e) = agent.on_message(msg) {
                        warn!(agent_id = %agent_id, error = %e, "Failed to handle message");
                    }
                }
            }
            while let Some(call) = self.scheduler.pop_due() {
                progressed = true;
                dispatched += 1;
                match self.agents.get_mut(&call.agent_id) {
                    Some(agent) if !agent.is_terminated() => {
                        let agent_id = call.agent_id.clone();
                        if let Err(e) = agent.on_timeout(call) {
                            warn!(agent_id = %agent_id, error = %e, "Failed to handle timeout");
                        }
                    }
                    _ => debug!(agent_id = %call.agent_id, "Timeout for a gone agent, ignoring"),
                }
            }
            if !progressed {
                break;
            }
        }
        dispatched
    }

    /// Terminates every agent. Completion handles of their protocols all
    /// resolve.
    pub fn shutdown(&mut self) {
        info!(agents = self.agents.len(), "Shutting down agency");
        for agent in self.agents.values_mut() {
            agent.terminate();
        }
    }
}

impl std::fmt::Debug for Agency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agency")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("pending_timers", &self.scheduler.pending())
            .field("journal", &self.keeper.is_some())
            .finish()
    }
}
