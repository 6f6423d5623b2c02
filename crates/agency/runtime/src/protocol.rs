//! The protocol abstraction shared by every role an agent can host.
//!
//! A live protocol is a boxed [`AgencyProtocol`] owned by its agent and
//! keyed by session id. Protocols never call back into the agent: they act
//! through their [`ProtocolCore`], which wraps the shared [`AgentMedium`],
//! and they report completion by finishing the core exactly once.

use std::any::Any;
use std::sync::Arc;

use agency_journal::JournalId;
use agency_types::{Message, PayloadKind, ProtocolType, Recipient, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::medium::AgentMedium;

/// Terminal cause of a protocol that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolFailure {
    #[error("initiator finished in state {state} without a result")]
    InitiatorFailed { state: String },

    #[error("protocol expired before it could complete")]
    Expired,

    #[error("gave up after {attempts} attempts")]
    GaveUp { attempts: u32 },

    #[error("agent terminated")]
    AgentTerminated,

    #[error("{0}")]
    Remote(String),
}

impl ProtocolFailure {
    /// Failures that are part of an orderly teardown. Callers swallow these
    /// and propagate the rest.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ProtocolFailure::InitiatorFailed { .. }
                | ProtocolFailure::Expired
                | ProtocolFailure::AgentTerminated
        )
    }

    pub fn initiator_failed(state: impl std::fmt::Debug) -> Self {
        ProtocolFailure::InitiatorFailed {
            state: format!("{state:?}").to_lowercase(),
        }
    }
}

pub type ProtocolResult = Result<Value, ProtocolFailure>;

/// What a factory needs to build a protocol for an agent.
#[derive(Debug, Clone)]
pub struct ProtocolContext {
    pub medium: Arc<AgentMedium>,
    pub session_id: SessionId,
    pub journal_id: JournalId,
}

/// State every role carries: its identity, its way out to the agent and
/// its single result slot.
#[derive(Debug)]
pub struct ProtocolCore {
    medium: Arc<AgentMedium>,
    session_id: SessionId,
    journal_id: JournalId,
    protocol_id: String,
    result: Option<ProtocolResult>,
    finished: bool,
}

impl ProtocolCore {
    pub fn new(ctx: ProtocolContext, protocol_id: impl Into<String>) -> Self {
        Self {
            medium: ctx.medium,
            session_id: ctx.session_id,
            journal_id: ctx.journal_id,
            protocol_id: protocol_id.into(),
            result: None,
            finished: false,
        }
    }

    pub fn medium(&self) -> &AgentMedium {
        &self.medium
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn get_time(&self) -> f64 {
        self.medium.get_time()
    }

    /// Stamps `msg` as sent by this session and posts it.
    ///
    /// An explicit `expiration` wins; otherwise the message keeps its own
    /// expiration time, or gets one `default_timeout` from now.
    pub fn send(
        &self,
        recipients: &[Recipient],
        mut msg: Message,
        remote: Option<&SessionId>,
        expiration: Option<f64>,
    ) -> Message {
        msg.reply_to = Some(self.medium.recipient().clone());
        self.post(recipients, msg, remote, expiration)
    }

    /// Like [`send`](Self::send) but keeps the message's `reply_to`, so the
    /// answer goes to whoever the dialog is handed over to.
    pub fn handover(
        &self,
        recipients: &[Recipient],
        mut msg: Message,
        remote: Option<&SessionId>,
        expiration: Option<f64>,
    ) -> Message {
        if msg.reply_to.is_none() {
            msg.reply_to = Some(self.medium.recipient().clone());
        }
        self.post(recipients, msg, remote, expiration)
    }

    fn post(
        &self,
        recipients: &[Recipient],
        mut msg: Message,
        remote: Option<&SessionId>,
        expiration: Option<f64>,
    ) -> Message {
        msg.sender_id = Some(self.session_id.clone());
        msg.receiver_id = remote.cloned();
        msg.protocol_id = self.protocol_id.clone();
        msg.expiration_time = match (expiration, msg.expiration_time) {
            (Some(at), _) => Some(at),
            (None, Some(at)) => Some(at),
            (None, None) => Some(self.get_time() + self.medium.default_timeout()),
        };
        self.medium.send_msg(recipients, &msg);
        msg
    }

    /// Records the protocol's result. Only the first call wins.
    pub fn finish(&mut self, result: ProtocolResult) -> bool {
        if self.finished {
            debug!(
                session_id = %self.session_id,
                "Protocol already finished, dropping result"
            );
            return false;
        }
        debug!(
            session_id = %self.session_id,
            protocol_id = %self.protocol_id,
            success = result.is_ok(),
            "Protocol finished"
        );
        self.finished = true;
        self.result = Some(result);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn take_result(&mut self) -> Option<ProtocolResult> {
        self.result.take()
    }
}

/// A live protocol role hosted by an agent.
pub trait AgencyProtocol: Send {
    fn core(&self) -> &ProtocolCore;

    fn core_mut(&mut self) -> &mut ProtocolCore;

    /// Snapshot of the role's current state, for inspection.
    fn state_name(&self) -> String;

    fn initiate(&mut self);

    fn on_message(&mut self, msg: Message);

    /// A timeout armed as `generation` fired.
    fn on_timeout(&mut self, generation: u64);

    /// Fires the pending timeout now. Returns false when none was pending.
    fn expire_now(&mut self) -> bool;

    fn on_child_started(&mut self, _child: &SessionId) {}

    fn on_child_finished(&mut self, _child: &SessionId, _result: &ProtocolResult) {}

    /// Finalizes from outside, e.g. when the agent terminates.
    fn abort(&mut self, failure: ProtocolFailure) {
        self.core_mut().finish(Err(failure));
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn session_id(&self) -> &SessionId {
        self.core().session_id()
    }

    fn protocol_id(&self) -> &str {
        self.core().protocol_id()
    }

    fn journal_id(&self) -> &JournalId {
        self.core().journal_id()
    }

    fn is_finished(&self) -> bool {
        self.core().is_finished()
    }

    fn take_result(&mut self) -> Option<ProtocolResult> {
        self.core_mut().take_result()
    }
}

/// Builds the initiating side of a protocol.
pub trait InitiatorFactory: Send + Sync {
    fn protocol_id(&self) -> &str;

    fn protocol_type(&self) -> ProtocolType;

    fn build(
        &self,
        ctx: ProtocolContext,
        recipients: Vec<Recipient>,
        args: Value,
    ) -> Box<dyn AgencyProtocol>;
}

/// Builds the interested side of a protocol when its first message
/// arrives.
pub trait InterestFactory: Send + Sync {
    fn protocol_id(&self) -> &str;

    fn protocol_type(&self) -> ProtocolType;

    /// Kind of the message that opens a conversation.
    fn initiator(&self) -> PayloadKind;

    fn build(&self, ctx: ProtocolContext, msg: &Message) -> Box<dyn AgencyProtocol>;
}

/// One-way messages of a notification interest.
pub trait NotificationHandler: Send {
    fn notified(&mut self, medium: &AgentMedium, msg: &Message);
}

/// Completion handle of an initiated protocol.
#[derive(Debug)]
pub struct ProtocolHandle {
    pub session_id: SessionId,
    pub protocol_id: String,
    receiver: Option<oneshot::Receiver<ProtocolResult>>,
}

impl ProtocolHandle {
    pub fn new(
        session_id: SessionId,
        protocol_id: impl Into<String>,
        receiver: oneshot::Receiver<ProtocolResult>,
    ) -> Self {
        Self {
            session_id,
            protocol_id: protocol_id.into(),
            receiver: Some(receiver),
        }
    }

    /// The result, once the protocol finished. Yields it a single time.
    pub fn try_result(&mut self) -> Option<ProtocolResult> {
        let receiver = self.receiver.as_mut()?;
        let result = match receiver.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(ProtocolFailure::AgentTerminated),
        };
        self.receiver = None;
        Some(result)
    }

    pub async fn wait(self) -> ProtocolResult {
        match self.receiver {
            Some(receiver) => receiver
                .await
                .unwrap_or(Err(ProtocolFailure::AgentTerminated)),
            None => Err(ProtocolFailure::AgentTerminated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_types::ContractState;

    #[test]
    fn test_expected_failures() {
        assert!(ProtocolFailure::Expired.is_expected());
        assert!(ProtocolFailure::AgentTerminated.is_expected());
        assert!(ProtocolFailure::initiator_failed(ContractState::Wtf).is_expected());
        assert!(!ProtocolFailure::GaveUp { attempts: 3 }.is_expected());
        assert!(!ProtocolFailure::Remote("boom".into()).is_expected());
    }

    #[test]
    fn test_initiator_failed_names_state() {
        assert_eq!(
            ProtocolFailure::initiator_failed(ContractState::Cancelled),
            ProtocolFailure::InitiatorFailed {
                state: "cancelled".to_string()
            }
        );
    }

    #[test]
    fn test_handle_yields_result_once() {
        let (tx, rx) = oneshot::channel();
        let mut handle = ProtocolHandle::new(SessionId::from("s1"), "p", rx);
        assert!(handle.try_result().is_none());
        tx.send(Ok(Value::from(3))).unwrap();
        assert_eq!(handle.try_result(), Some(Ok(Value::from(3))));
        assert!(handle.try_result().is_none());
    }

    #[test]
    fn test_dropped_sender_reads_as_terminated() {
        let (tx, rx) = oneshot::channel::<ProtocolResult>();
        let mut handle = ProtocolHandle::new(SessionId::from("s1"), "p", rx);
        drop(tx);
        assert_eq!(
            handle.try_result(),
            Some(Err(ProtocolFailure::AgentTerminated))
        );
    }
}
