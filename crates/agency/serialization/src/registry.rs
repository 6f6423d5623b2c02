//! Explicit registry of restorable instance types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::SerializationError;
use crate::graph::{Graph, NodeId};

/// Knows how to finish restoring one instance type.
pub trait Restorator: Send + Sync {
    fn type_name(&self) -> &str;

    /// Called after the whole graph is rebuilt, in reverse creation order.
    fn restored(&self, _graph: &Graph, _node: NodeId) -> Result<(), SerializationError> {
        Ok(())
    }
}

/// Restorator that only marks a type name as known.
#[derive(Debug, Clone)]
pub struct KnownType(pub String);

impl Restorator for KnownType {
    fn type_name(&self) -> &str {
        &self.0
    }
}

/// Registry passed to every unserializer.
///
/// In strict mode an instance of an unregistered type is an error; a
/// permissive registry keeps such instances as plain graph nodes.
#[derive(Clone, Default)]
pub struct Registry {
    restorators: HashMap<String, Arc<dyn Restorator>>,
    permissive: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissive() -> Self {
        Self {
            restorators: HashMap::new(),
            permissive: true,
        }
    }

    pub fn register(&mut self, restorator: Arc<dyn Restorator>) {
        self.restorators
            .insert(restorator.type_name().to_string(), restorator);
    }

    pub fn register_type(&mut self, type_name: impl Into<String>) {
        self.register(Arc::new(KnownType(type_name.into())));
    }

    pub fn lookup(&self, type_name: &str) -> Option<&Arc<dyn Restorator>> {
        self.restorators.get(type_name)
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    pub(crate) fn check(&self, type_name: &str) -> Result<(), SerializationError> {
        if self.permissive || self.restorators.contains_key(type_name) {
            Ok(())
        } else {
            Err(SerializationError::UnknownType(type_name.to_string()))
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.restorators.keys().collect();
        names.sort();
        f.debug_struct("Registry")
            .field("types", &names)
            .field("permissive", &self.permissive)
            .finish()
    }
}
