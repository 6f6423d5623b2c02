//! The agent-side surface protocols act through.
//!
//! Every operation with an effect outside the protocol goes through the
//! agent's journal as a named side effect, so a recorded call can be
//! replayed without repeating it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agency_journal::Journal;
use agency_types::{AgentId, Message, Recipient, SessionId};
use serde_json::Value;
use tracing::warn;

use crate::messaging::Messaging;
use crate::time::{CallId, DelayedCall, TimeSource};

/// Work a protocol asks its agent to do once the current call settles.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    /// Start a protocol, optionally as the child of a live one.
    Initiate {
        protocol_id: String,
        recipients: Vec<Recipient>,
        args: Value,
        parent: Option<SessionId>,
    },
    /// Fire a protocol's pending timeout immediately.
    ExpireNow { session_id: SessionId },
}

pub struct AgentMedium {
    agent_id: AgentId,
    recipient: Recipient,
    default_timeout: f64,
    time: Arc<dyn TimeSource>,
    messaging: Arc<dyn Messaging>,
    journal: Mutex<Journal>,
    commands: Mutex<VecDeque<AgentCommand>>,
}

impl AgentMedium {
    pub fn new(
        agent_id: AgentId,
        shard: &str,
        default_timeout: f64,
        time: Arc<dyn TimeSource>,
        messaging: Arc<dyn Messaging>,
        journal: Journal,
    ) -> Self {
        let recipient = Recipient::agent(&agent_id, shard);
        Self {
            agent_id,
            recipient,
            default_timeout,
            time,
            messaging,
            journal: Mutex::new(journal),
            commands: Mutex::new(VecDeque::new()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Address replies to this agent are sent to.
    pub fn recipient(&self) -> &Recipient {
        &self.recipient
    }

    pub fn shard(&self) -> &str {
        &self.recipient.route
    }

    pub fn default_timeout(&self) -> f64 {
        self.default_timeout
    }

    pub fn messaging(&self) -> &Arc<dyn Messaging> {
        &self.messaging
    }

    pub fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_time(&self) -> f64 {
        self.journal()
            .side_effect("AgencyAgent.get_time", &(), || self.time.get_time())
    }

    /// Posts `msg` to `recipients`. Returns the number of deliveries.
    pub fn send_msg(&self, recipients: &[Recipient], msg: &Message) -> u64 {
        self.journal()
            .side_effect("AgencyAgent.send_msg", &(recipients, msg), || {
                match self.messaging.post(recipients, msg) {
                    Ok(delivered) => delivered as u64,
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, error = %e, "Failed to post message");
                        0
                    }
                }
            })
    }

    /// Schedules a timeout for `session_id`. The timeout continues the
    /// fiber of the current recorded call.
    pub fn call_later(&self, delay: f64, session_id: &SessionId, generation: u64) -> CallId {
        let mut journal = self.journal();
        let call = DelayedCall {
            agent_id: self.agent_id.clone(),
            session_id: session_id.clone(),
            generation,
            fiber: journal.current_fiber().map(|fiber| fiber.nested()),
        };
        journal.side_effect(
            "AgencyAgent.call_later",
            &(delay, session_id.as_str(), generation),
            || self.time.call_later(delay, call),
        )
    }

    pub fn cancel_delayed_call(&self, id: CallId) -> bool {
        self.journal()
            .side_effect("AgencyAgent.cancel_delayed_call", &id, || self.time.cancel(id))
    }

    pub fn new_session_id(&self) -> SessionId {
        self.journal()
            .side_effect("AgencyAgent.new_session_id", &(), SessionId::new)
    }

    pub fn new_traversal_id(&self) -> String {
        self.journal().side_effect("AgencyAgent.new_traversal_id", &(), || {
            uuid::Uuid::new_v4().to_string()
        })
    }

    pub fn push_command(&self, command: AgentCommand) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(command);
    }

    pub fn take_commands(&self) -> VecDeque<AgentCommand> {
        std::mem::take(&mut *self.commands.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for AgentMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMedium")
            .field("agent_id", &self.agent_id)
            .field("recipient", &self.recipient)
            .finish()
    }
}
