//! Message transport.
//!
//! Agents receive messages through bindings: a binding routes a key inside
//! a shard to an agent. Each agent binds its own id; public interests also
//! bind their protocol id so broadcasts reach them.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use agency_types::{AgentId, Message, Recipient};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::MessagingError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub agent_id: AgentId,
    pub key: String,
    pub shard: String,
}

pub trait Messaging: Send + Sync {
    fn create_binding(&self, agent_id: &AgentId, key: &str, shard: &str) -> Binding;

    fn revoke(&self, binding: &Binding);

    /// Delivers a copy of `message` to every agent bound to any of the
    /// recipients. Returns the number of deliveries.
    fn post(&self, recipients: &[Recipient], message: &Message) -> Result<usize, MessagingError>;

    /// Next queued message for `agent_id`.
    fn next_message(&self, agent_id: &AgentId) -> Option<Message>;

    /// Signalled whenever a message is queued.
    fn notifier(&self) -> Arc<Notify>;
}

#[derive(Default)]
struct EmuState {
    bindings: HashMap<(String, String), BTreeSet<AgentId>>,
    queues: HashMap<AgentId, VecDeque<Message>>,
    closed: bool,
}

/// In-process broker with one FIFO queue per agent.
pub struct EmuMessaging {
    state: Mutex<EmuState>,
    notify: Arc<Notify>,
}

impl EmuMessaging {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmuState::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of messages waiting for `agent_id`.
    pub fn queued(&self, agent_id: &AgentId) -> usize {
        self.lock().queues.get(agent_id).map_or(0, VecDeque::len)
    }

    pub fn has_queued(&self) -> bool {
        self.lock().queues.values().any(|q| !q.is_empty())
    }

    /// Refuses further posts.
    pub fn close(&self) {
        self.lock().closed = true;
    }
}

impl Default for EmuMessaging {
    fn default() -> Self {
        Self::new()
    }
}

impl Messaging for EmuMessaging {
    fn create_binding(&self, agent_id: &AgentId, key: &str, shard: &str) -> Binding {
        let binding = Binding {
            agent_id: agent_id.clone(),
            key: key.to_string(),
            shard: shard.to_string(),
        };
        let mut state = self.lock();
        state
            .bindings
            .entry((shard.to_string(), key.to_string()))
            .or_default()
            .insert(agent_id.clone());
        state.queues.entry(agent_id.clone()).or_default();
        debug!(agent_id = %agent_id, key, shard, "Binding created");
        binding
    }

    fn revoke(&self, binding: &Binding) {
        let mut state = self.lock();
        let route = (binding.shard.clone(), binding.key.clone());
        if let Some(agents) = state.bindings.get_mut(&route) {
            agents.remove(&binding.agent_id);
            if agents.is_empty() {
                state.bindings.remove(&route);
            }
        }
    }

    fn post(&self, recipients: &[Recipient], message: &Message) -> Result<usize, MessagingError> {
        let mut state = self.lock();
        if state.closed {
            return Err(MessagingError::Closed);
        }

        let mut delivered = 0;
        for recipient in recipients {
            let route = (recipient.route.clone(), recipient.key.clone());
            let agents: Vec<AgentId> = match state.bindings.get(&route) {
                Some(agents) => agents.iter().cloned().collect(),
                None => {
                    warn!(recipient = %recipient, kind = %message.kind(), "No binding for recipient, message dropped");
                    continue;
                }
            };
            for agent_id in agents {
                let mut copy = message.clone();
                if copy.message_id.is_none() {
                    copy.message_id = Some(uuid::Uuid::new_v4().to_string());
                }
                state.queues.entry(agent_id).or_default().push_back(copy);
                delivered += 1;
            }
        }
        drop(state);

        if delivered > 0 {
            self.notify.notify_one();
        }
        Ok(delivered)
    }

    fn next_message(&self, agent_id: &AgentId) -> Option<Message> {
        self.lock().queues.get_mut(agent_id)?.pop_front()
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
