use agency_journal::JournalError;
use agency_serialization::SerializationError;
use agency_types::{AgentId, ProtocolType, SessionId};
use thiserror::Error;

/// Errors from agency and agent operations.
#[derive(Error, Debug)]
pub enum AgencyError {
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("agent already started: {0}")]
    DuplicateAgent(AgentId),

    #[error("agent {0} is terminated")]
    Terminated(AgentId),

    #[error("interest already registered for {protocol_type} protocol {protocol_id}")]
    DuplicateInterest {
        protocol_type: ProtocolType,
        protocol_id: String,
    },

    #[error("no initiator factory for protocol {0}")]
    UnknownFactory(String),

    #[error("no live protocol with session {0}")]
    UnknownSession(SessionId),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Errors from the messaging layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("no binding for {0}")]
    NoRoute(String),

    #[error("messaging is closed")]
    Closed,
}

pub type AgencyResult<T> = Result<T, AgencyError>;
