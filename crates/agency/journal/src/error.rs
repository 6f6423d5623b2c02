use agency_serialization::SerializationError;
use thiserror::Error;

use crate::id::JournalId;

/// Errors from journal recording, replay and storage.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("recorded call {entry_id} entered while {active} is still running")]
    ReentrantCall { entry_id: String, active: String },

    #[error("no recorded call is running")]
    NotInCall,

    #[error("replay of {instance_id} failed: {reason}")]
    Replay { instance_id: JournalId, reason: String },
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Encoding(e.to_string())
    }
}
