//! Table of process-local objects that are embedded by identifier only.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a live object kept out of serialized payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId {
    pub type_name: String,
    pub ident: String,
}

impl ExternalId {
    pub fn new(type_name: impl Into<String>, ident: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ident: ident.into(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_name, self.ident)
    }
}

/// Caller-supplied externalizer table keyed by `(type-name, identity)`.
///
/// The serializer embeds only the identifier of objects found here, and
/// the unserializer resolves identifiers back through the same table.
#[derive(Debug, Clone, Default)]
pub struct Externalizer {
    known: HashSet<ExternalId>,
}

impl Externalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: ExternalId) {
        self.known.insert(id);
    }

    pub fn remove(&mut self, id: &ExternalId) -> bool {
        self.known.remove(id)
    }

    pub fn contains(&self, id: &ExternalId) -> bool {
        self.known.contains(id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
