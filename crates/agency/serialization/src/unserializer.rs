//! Rebuilds a value graph from codec data.
//!
//! Containers are allocated empty before their elements are unpacked, so
//! a reference id is bound as soon as its container exists. A dereference
//! whose reference is not bound yet (dict entries may come back in a
//! different order than they were written) leaves a placeholder in its
//! slot and is retried after the walk. Instance hooks run last.

use std::collections::HashMap;

use tracing::debug;

use crate::capabilities::Capability;
use crate::error::SerializationError;
use crate::externalizer::Externalizer;
use crate::graph::{Graph, NodeId, Value};
use crate::registry::Registry;
use crate::tree::{Codec, Tree};

/// Passes over the delayed slots before giving up.
pub const MAX_DELAYED_PASSES: usize = 3;

pub struct Unserializer<'r, C: Codec> {
    codec: C,
    registry: &'r Registry,
    externalizer: Option<&'r Externalizer>,
}

impl<'r, C: Codec> Unserializer<'r, C> {
    pub fn new(codec: C, registry: &'r Registry) -> Self {
        Self {
            codec,
            registry,
            externalizer: None,
        }
    }

    pub fn with_externalizer(mut self, externalizer: &'r Externalizer) -> Self {
        self.externalizer = Some(externalizer);
        self
    }

    /// Unpacks codec data into a fresh graph and returns it with its root.
    pub fn convert(&self, data: &C::Output) -> Result<(Graph, NodeId), SerializationError> {
        let tree = self.codec.unpack(data)?;
        self.unflatten(&tree)
    }

    pub fn unflatten(&self, tree: &Tree) -> Result<(Graph, NodeId), SerializationError> {
        let mut rebuild = Rebuild {
            graph: Graph::new(),
            refs: HashMap::new(),
            pending: Vec::new(),
            instances: Vec::new(),
            placeholder: None,
            registry: self.registry,
            externalizer: self.externalizer,
        };
        let root = match rebuild.unpack(tree)? {
            Resolved::Node(id) => id,
            Resolved::Delayed(refid) => return Err(SerializationError::UnresolvedReference(refid)),
        };
        rebuild.resolve_pending()?;
        rebuild.run_hooks()?;
        Ok((rebuild.graph, root))
    }
}

enum Resolved {
    Node(NodeId),
    Delayed(u32),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Item(NodeId, usize),
    Key(NodeId, usize),
    Val(NodeId, usize),
    State(NodeId),
}

struct Rebuild<'r> {
    graph: Graph,
    refs: HashMap<u32, NodeId>,
    pending: Vec<(Slot, u32)>,
    instances: Vec<NodeId>,
    placeholder: Option<NodeId>,
    registry: &'r Registry,
    externalizer: Option<&'r Externalizer>,
}

impl Rebuild<'_> {
    fn unpack(&mut self, tree: &Tree) -> Result<Resolved, SerializationError> {
        let id = match tree {
            Tree::None => self.graph.add(Value::None),
            Tree::Bool(b) => self.graph.add(Value::Bool(*b)),
            Tree::Int(i) => self.graph.add(Value::Int(*i)),
            Tree::Float(f) => self.graph.add(Value::Float(*f)),
            Tree::Str(s) => self.graph.add(Value::Str(s.clone())),
            Tree::Bytes(b) => self.graph.add(Value::Bytes(b.clone())),
            Tree::Type(name) => self.graph.add(Value::Type(name.clone())),
            Tree::Enum { type_name, variant } => {
                self.registry.check(type_name)?;
                self.graph.add(Value::Enum {
                    type_name: type_name.clone(),
                    variant: variant.clone(),
                })
            }
            Tree::External(ext) => {
                if !self.externalizer.is_some_and(|table| table.contains(ext)) {
                    return Err(SerializationError::UnknownExternal {
                        type_name: ext.type_name.clone(),
                        ident: ext.ident.clone(),
                    });
                }
                self.graph.add(Value::External(ext.clone()))
            }
            Tree::Function(_) => {
                return Err(SerializationError::CapabilityNotSupported(
                    Capability::FunctionValues,
                ))
            }
            Tree::Dereference(refid) => {
                return Ok(match self.refs.get(refid) {
                    Some(id) => Resolved::Node(*id),
                    None => Resolved::Delayed(*refid),
                })
            }
            Tree::Reference { refid, value } => {
                if self.refs.contains_key(refid) {
                    return Err(SerializationError::InvalidData(format!(
                        "reference {refid} defined twice"
                    )));
                }
                return match value.as_ref() {
                    Tree::Reference { .. } | Tree::Dereference(_) => Err(
                        SerializationError::InvalidData(format!("reference {refid} wraps a reference")),
                    ),
                    inner => self.unpack_container(inner, Some(*refid)).map(Resolved::Node),
                };
            }
            container => return self.unpack_container(container, None).map(Resolved::Node),
        };
        Ok(Resolved::Node(id))
    }

    fn unpack_container(&mut self, tree: &Tree, refid: Option<u32>) -> Result<NodeId, SerializationError> {
        let node = match tree {
            Tree::Tuple(_) => self.graph.add(Value::Tuple(Vec::new())),
            Tree::List(_) => self.graph.add(Value::List(Vec::new())),
            Tree::Set(_) => self.graph.add(Value::Set(Vec::new())),
            Tree::Dict(_) => self.graph.add(Value::Dict(Vec::new())),
            Tree::Instance { type_name, .. } => {
                self.registry.check(type_name)?;
                let placeholder = self.placeholder();
                let node = self.graph.add(Value::Instance {
                    type_name: type_name.clone(),
                    state: placeholder,
                });
                self.instances.push(node);
                node
            }
            plain => {
                let id = match self.unpack(plain)? {
                    Resolved::Node(id) => id,
                    Resolved::Delayed(r) => return Err(SerializationError::UnresolvedReference(r)),
                };
                if let Some(refid) = refid {
                    self.refs.insert(refid, id);
                }
                return Ok(id);
            }
        };
        if let Some(refid) = refid {
            self.refs.insert(refid, node);
        }

        match tree {
            Tree::Tuple(items) | Tree::List(items) | Tree::Set(items) => {
                for (index, item) in items.iter().enumerate() {
                    let child = self.place(Slot::Item(node, index), item)?;
                    self.graph.push(node, child)?;
                }
            }
            Tree::Dict(pairs) => {
                for (index, (key, value)) in pairs.iter().enumerate() {
                    let k = self.place(Slot::Key(node, index), key)?;
                    let v = self.place(Slot::Val(node, index), value)?;
                    self.graph.insert(node, k, v)?;
                }
            }
            Tree::Instance { state, .. } => {
                let child = self.place(Slot::State(node), state)?;
                self.fill(Slot::State(node), child);
            }
            _ => {}
        }
        Ok(node)
    }

    fn place(&mut self, slot: Slot, tree: &Tree) -> Result<NodeId, SerializationError> {
        match self.unpack(tree)? {
            Resolved::Node(id) => Ok(id),
            Resolved::Delayed(refid) => {
                self.pending.push((slot, refid));
                Ok(self.placeholder())
            }
        }
    }

    fn placeholder(&mut self) -> NodeId {
        match self.placeholder {
            Some(id) => id,
            None => {
                let id = self.graph.add(Value::None);
                self.placeholder = Some(id);
                id
            }
        }
    }

    fn fill(&mut self, slot: Slot, target: NodeId) {
        let (node, index) = match slot {
            Slot::Item(node, index) | Slot::Key(node, index) | Slot::Val(node, index) => (node, index),
            Slot::State(node) => (node, 0),
        };
        match (slot, self.graph.get_mut(node)) {
            (Slot::Item(..), Some(Value::Tuple(items)))
            | (Slot::Item(..), Some(Value::List(items)))
            | (Slot::Item(..), Some(Value::Set(items))) => {
                if let Some(item) = items.get_mut(index) {
                    *item = target;
                }
            }
            (Slot::Key(..), Some(Value::Dict(pairs))) => {
                if let Some(pair) = pairs.get_mut(index) {
                    pair.0 = target;
                }
            }
            (Slot::Val(..), Some(Value::Dict(pairs))) => {
                if let Some(pair) = pairs.get_mut(index) {
                    pair.1 = target;
                }
            }
            (Slot::State(_), Some(Value::Instance { state, .. })) => *state = target,
            _ => {}
        }
    }

    fn resolve_pending(&mut self) -> Result<(), SerializationError> {
        for pass in 0..MAX_DELAYED_PASSES {
            if self.pending.is_empty() {
                return Ok(());
            }
            debug!(pass, pending = self.pending.len(), "retrying delayed dereferences");
            let waiting = std::mem::take(&mut self.pending);
            for (slot, refid) in waiting {
                match self.refs.get(&refid).copied() {
                    Some(target) => self.fill(slot, target),
                    None => self.pending.push((slot, refid)),
                }
            }
        }
        match self.pending.first() {
            Some((_, refid)) => Err(SerializationError::UnresolvedReference(*refid)),
            None => Ok(()),
        }
    }

    fn run_hooks(&self) -> Result<(), SerializationError> {
        for node in self.instances.iter().rev() {
            if let Value::Instance { type_name, .. } = self.graph.value(*node)? {
                if let Some(restorator) = self.registry.lookup(type_name) {
                    restorator.restored(&self.graph, *node)?;
                }
            }
        }
        Ok(())
    }
}
