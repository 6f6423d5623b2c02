//! Two-phase flattening of a value graph.
//!
//! The first pass walks the graph from the root and records every tracked
//! node that is reached more than once, handing out reference ids in the
//! order the repeats are found. The second pass walks the same way and
//! emits a [`Tree::Reference`] on the first visit of such a node and a
//! [`Tree::Dereference`] on every later one.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::capabilities::{Capabilities, Capability};
use crate::error::SerializationError;
use crate::externalizer::Externalizer;
use crate::graph::{Graph, NodeId, Value};
use crate::tree::{pack, Codec, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Convert,
    Freeze,
}

/// Serializer bound to one codec.
///
/// All identity bookkeeping lives in a scratch state built for each
/// `convert`/`freeze` call and dropped on return, on success and on error.
pub struct Serializer<C: Codec> {
    codec: C,
    externalizer: Option<Externalizer>,
}

impl<C: Codec> Serializer<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            externalizer: None,
        }
    }

    pub fn with_externalizer(mut self, externalizer: Externalizer) -> Self {
        self.externalizer = Some(externalizer);
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Serializes for transmission or storage.
    pub fn convert(&self, graph: &Graph, root: NodeId) -> Result<C::Output, SerializationError> {
        let tree = self.flatten(graph, root, Mode::Convert)?;
        pack(&self.codec, &tree)
    }

    /// Serializes for snapshots; functions are encoded by name and
    /// unknown externals by their identifier text.
    pub fn freeze(&self, graph: &Graph, root: NodeId) -> Result<C::Output, SerializationError> {
        let tree = self.flatten(graph, root, Mode::Freeze)?;
        pack(&self.codec, &tree)
    }

    /// Runs only the flattening phase.
    pub fn flatten_tree(&self, graph: &Graph, root: NodeId) -> Result<Tree, SerializationError> {
        self.flatten(graph, root, Mode::Convert)
    }

    fn flatten(&self, graph: &Graph, root: NodeId, mode: Mode) -> Result<Tree, SerializationError> {
        let mut pass = Flattener {
            graph,
            caps: self.codec.capabilities(),
            mode,
            externalizer: self.externalizer.as_ref(),
            seen: HashSet::new(),
            refids: HashMap::new(),
            emitted: HashSet::new(),
        };
        pass.scan(root)?;
        if !pass.refids.is_empty() {
            pass.require(Capability::CircularReferences)?;
        }
        trace!(refs = pass.refids.len(), "flattening value graph");
        pass.emit(root)
    }
}

struct Flattener<'a> {
    graph: &'a Graph,
    caps: Capabilities,
    mode: Mode,
    externalizer: Option<&'a Externalizer>,
    seen: HashSet<NodeId>,
    refids: HashMap<NodeId, u32>,
    emitted: HashSet<NodeId>,
}

impl Flattener<'_> {
    fn scan(&mut self, id: NodeId) -> Result<(), SerializationError> {
        let value = self.graph.value(id)?;
        if !value.is_tracked() {
            return Ok(());
        }
        if !self.seen.insert(id) {
            let next = self.refids.len() as u32 + 1;
            self.refids.entry(id).or_insert(next);
            return Ok(());
        }
        for child in self.graph.children(id)? {
            self.scan(child)?;
        }
        Ok(())
    }

    fn require(&self, capability: Capability) -> Result<(), SerializationError> {
        if self.caps.contains(capability) {
            Ok(())
        } else {
            Err(SerializationError::CapabilityNotSupported(capability))
        }
    }

    fn emit(&mut self, id: NodeId) -> Result<Tree, SerializationError> {
        if let Some(&refid) = self.refids.get(&id) {
            if !self.emitted.insert(id) {
                return Ok(Tree::Dereference(refid));
            }
            let value = self.emit_value(id)?;
            return Ok(Tree::Reference {
                refid,
                value: Box::new(value),
            });
        }
        self.emit_value(id)
    }

    fn emit_all(&mut self, items: &[NodeId]) -> Result<Vec<Tree>, SerializationError> {
        items.iter().map(|item| self.emit(*item)).collect()
    }

    fn emit_value(&mut self, id: NodeId) -> Result<Tree, SerializationError> {
        let graph = self.graph;
        match graph.value(id)? {
            Value::None => {
                self.require(Capability::NoneValues)?;
                Ok(Tree::None)
            }
            Value::Bool(b) => {
                self.require(Capability::BoolValues)?;
                Ok(Tree::Bool(*b))
            }
            Value::Int(i) => {
                self.require(Capability::IntValues)?;
                Ok(Tree::Int(*i))
            }
            Value::Float(f) => {
                self.require(Capability::FloatValues)?;
                Ok(Tree::Float(*f))
            }
            Value::Str(s) => {
                self.require(Capability::StrValues)?;
                Ok(Tree::Str(s.clone()))
            }
            Value::Bytes(b) => {
                self.require(Capability::BytesValues)?;
                Ok(Tree::Bytes(b.clone()))
            }
            Value::Tuple(items) => {
                self.require(Capability::TupleValues)?;
                Ok(Tree::Tuple(self.emit_all(items)?))
            }
            Value::List(items) => {
                self.require(Capability::ListValues)?;
                Ok(Tree::List(self.emit_all(items)?))
            }
            Value::Set(items) => {
                self.require(Capability::SetValues)?;
                Ok(Tree::Set(self.emit_all(items)?))
            }
            Value::Dict(pairs) => {
                self.require(Capability::DictValues)?;
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    match graph.value(*k)? {
                        Value::Str(_) => self.require(Capability::StrKeys)?,
                        _ => self.require(Capability::NonStrKeys)?,
                    }
                    out.push((self.emit(*k)?, self.emit(*v)?));
                }
                Ok(Tree::Dict(out))
            }
            Value::Type(name) => {
                self.require(Capability::TypeValues)?;
                Ok(Tree::Type(name.clone()))
            }
            Value::Enum { type_name, variant } => {
                self.require(Capability::EnumValues)?;
                Ok(Tree::Enum {
                    type_name: type_name.clone(),
                    variant: variant.clone(),
                })
            }
            Value::Instance { type_name, state } => {
                self.require(Capability::InstanceValues)?;
                Ok(Tree::Instance {
                    type_name: type_name.clone(),
                    state: Box::new(self.emit(*state)?),
                })
            }
            Value::External(ext) => {
                let known = self.externalizer.is_some_and(|table| table.contains(ext));
                match (known, self.mode) {
                    (true, _) => {
                        self.require(Capability::ExternalValues)?;
                        Ok(Tree::External(ext.clone()))
                    }
                    (false, Mode::Freeze) => Ok(Tree::Str(ext.to_string())),
                    (false, Mode::Convert) => {
                        Err(SerializationError::NotSerializable(ext.type_name.clone()))
                    }
                }
            }
            Value::Function(name) => match self.mode {
                Mode::Freeze => Ok(Tree::Function(name.clone())),
                Mode::Convert => Err(SerializationError::CapabilityNotSupported(
                    Capability::FunctionValues,
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::externalizer::ExternalId;
    use crate::tree::TreeCodec;

    #[test]
    fn test_dangling_node_is_an_error() {
        let mut graph = Graph::new();
        let list = graph.list(vec![NodeId(7)]);

        let err = Serializer::new(TreeCodec).convert(&graph, list).unwrap_err();
        assert!(matches!(err, SerializationError::InvalidNode(7)));
        let err = Serializer::new(TreeCodec).convert(&graph, NodeId(42)).unwrap_err();
        assert!(matches!(err, SerializationError::InvalidNode(42)));
    }

    #[test]
    fn test_self_referential_list_flattens_to_reference() {
        let mut graph = Graph::new();
        let list = graph.list(vec![]);
        graph.push(list, list).unwrap();

        let tree = Serializer::new(TreeCodec).convert(&graph, list).unwrap();
        assert_eq!(
            tree,
            Tree::Reference {
                refid: 1,
                value: Box::new(Tree::List(vec![Tree::Dereference(1)])),
            }
        );
    }

    #[test]
    fn test_shared_child_referenced_once_then_dereferenced() {
        let mut graph = Graph::new();
        let one = graph.int(1);
        let shared = graph.list(vec![one]);
        let root = graph.tuple(vec![shared, shared, shared]);

        let tree = Serializer::new(TreeCodec).convert(&graph, root).unwrap();
        let Tree::Tuple(items) = tree else {
            panic!("expected tuple");
        };
        assert!(matches!(items[0], Tree::Reference { refid: 1, .. }));
        assert_eq!(items[1], Tree::Dereference(1));
        assert_eq!(items[2], Tree::Dereference(1));
    }

    #[test]
    fn test_function_requires_freeze() {
        let mut graph = Graph::new();
        let fun = graph.add(Value::Function("agency.on_message".to_string()));
        let serializer = Serializer::new(TreeCodec);

        assert_eq!(
            serializer.convert(&graph, fun),
            Err(SerializationError::CapabilityNotSupported(Capability::FunctionValues))
        );
        assert_eq!(
            serializer.freeze(&graph, fun).unwrap(),
            Tree::Function("agency.on_message".to_string())
        );
    }

    #[test]
    fn test_external_embedded_by_identifier() {
        let mut graph = Graph::new();
        let keeper = ExternalId::new("JournalKeeper", "main");
        let ext = graph.add(Value::External(keeper.clone()));
        let root = graph.list(vec![ext]);

        assert_eq!(
            Serializer::new(TreeCodec).convert(&graph, root),
            Err(SerializationError::NotSerializable("JournalKeeper".to_string()))
        );

        let mut table = Externalizer::new();
        table.add(keeper.clone());
        let tree = Serializer::new(TreeCodec)
            .with_externalizer(table)
            .convert(&graph, root)
            .unwrap();
        assert_eq!(tree, Tree::List(vec![Tree::External(keeper)]));
    }

    #[test]
    fn test_failed_conversion_does_not_leak_into_next() {
        let serializer = Serializer::new(TreeCodec);

        let mut bad = Graph::new();
        let shared = bad.list(vec![]);
        let fun = bad.add(Value::Function("f".to_string()));
        bad.push(shared, fun).unwrap();
        let root = bad.list(vec![shared, shared]);
        assert!(serializer.convert(&bad, root).is_err());

        let mut good = Graph::new();
        let shared = good.list(vec![]);
        let root = good.list(vec![shared, shared]);
        let tree = serializer.convert(&good, root).unwrap();
        let Tree::List(items) = tree else {
            panic!("expected list");
        };
        assert!(matches!(items[0], Tree::Reference { refid: 1, .. }));
        assert_eq!(items[1], Tree::Dereference(1));
    }
}
