use thiserror::Error;

use crate::capabilities::Capability;

/// Errors raised by a single serialization or unserialization call.
///
/// None of these leave state behind: every conversion works on its own
/// scratch tables, so the next call starts clean.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SerializationError {
    #[error("type not supported: {0}")]
    TypeNotSupported(String),

    #[error("capability not supported by codec: {0:?}")]
    CapabilityNotSupported(Capability),

    #[error("value of type {0} is not serializable and has no external identifier")]
    NotSerializable(String),

    #[error("unknown type during unserialization: {0}")]
    UnknownType(String),

    #[error("unknown external reference {type_name}:{ident}")]
    UnknownExternal { type_name: String, ident: String },

    #[error("reference {0} could not be resolved")]
    UnresolvedReference(u32),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("node {0} does not belong to this graph")]
    InvalidNode(usize),

    #[error("cycle found while converting to a plain tree")]
    Cycle,

    #[error("restore failed: expected {expected}, got {found}")]
    Mismatch { expected: String, found: String },

    #[error("json error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for SerializationError {
    fn from(e: serde_json::Error) -> Self {
        SerializationError::Json(e.to_string())
    }
}
