//! Bridge between typed Rust values and value graphs.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;
use crate::graph::{Graph, NodeId, Value};
use crate::registry::Registry;
use crate::serializer::Serializer;
use crate::tree::{Tree, TreeCodec};
use crate::unserializer::Unserializer;

/// Writes a value into a graph.
pub trait Snapshot {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError>;
}

/// Reads a value back out of a graph.
pub trait Restore: Sized {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError>;
}

fn mismatch(expected: &str, found: &Value) -> SerializationError {
    SerializationError::Mismatch {
        expected: expected.to_string(),
        found: found.kind().to_string(),
    }
}

/// Snapshots any serde value through its JSON form.
pub fn snapshot_serde<T: Serialize + ?Sized>(
    value: &T,
    graph: &mut Graph,
) -> Result<NodeId, SerializationError> {
    let json = serde_json::to_value(value)?;
    Ok(graph.from_json(&json))
}

/// Restores any serde value through its JSON form.
pub fn restore_serde<T: DeserializeOwned>(graph: &Graph, node: NodeId) -> Result<T, SerializationError> {
    let json = graph.to_json(node)?;
    Ok(serde_json::from_value(json)?)
}

/// Freezes a value into a flattened tree.
pub fn freeze<T: Snapshot + ?Sized>(value: &T) -> Result<Tree, SerializationError> {
    let mut graph = Graph::new();
    let root = value.snapshot(&mut graph)?;
    Serializer::new(TreeCodec).freeze(&graph, root)
}

/// Restores a value from a flattened tree.
pub fn thaw<T: Restore>(tree: &Tree, registry: &Registry) -> Result<T, SerializationError> {
    let (graph, root) = Unserializer::new(TreeCodec, registry).unflatten(tree)?;
    T::restore(&graph, root)
}

/// Implements [`Snapshot`] and [`Restore`] for serde types.
#[macro_export]
macro_rules! impl_snapshot_via_serde {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Snapshot for $ty {
                fn snapshot(
                    &self,
                    graph: &mut $crate::Graph,
                ) -> ::std::result::Result<$crate::NodeId, $crate::SerializationError> {
                    $crate::snapshot_serde(self, graph)
                }
            }

            impl $crate::Restore for $ty {
                fn restore(
                    graph: &$crate::Graph,
                    node: $crate::NodeId,
                ) -> ::std::result::Result<Self, $crate::SerializationError> {
                    $crate::restore_serde(graph, node)
                }
            }
        )+
    };
}

impl Snapshot for () {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.none())
    }
}

impl Restore for () {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::None => Ok(()),
            other => Err(mismatch("none", other)),
        }
    }
}

impl Snapshot for bool {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.bool(*self))
    }
}

impl Restore for bool {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl Snapshot for i64 {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.int(*self))
    }
}

impl Restore for i64 {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::Int(i) => Ok(*i),
            other => Err(mismatch("int", other)),
        }
    }
}

impl Snapshot for u64 {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        let value = i64::try_from(*self)
            .map_err(|_| SerializationError::TypeNotSupported(format!("u64 {self}")))?;
        Ok(graph.int(value))
    }
}

impl Restore for u64 {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        let value = i64::restore(graph, node)?;
        u64::try_from(value).map_err(|_| SerializationError::Mismatch {
            expected: "unsigned int".to_string(),
            found: value.to_string(),
        })
    }
}

impl Snapshot for f64 {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.float(*self))
    }
}

impl Restore for f64 {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(mismatch("float", other)),
        }
    }
}

impl Snapshot for str {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.str(self))
    }
}

impl Snapshot for String {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.str(self.clone()))
    }
}

impl Restore for String {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::Str(s) => Ok(s.clone()),
            other => Err(mismatch("str", other)),
        }
    }
}

impl<T: Snapshot> Snapshot for Option<T> {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        match self {
            Some(value) => value.snapshot(graph),
            None => Ok(graph.none()),
        }
    }
}

impl<T: Restore> Restore for Option<T> {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::None => Ok(None),
            _ => T::restore(graph, node).map(Some),
        }
    }
}

impl<T: Snapshot> Snapshot for [T] {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        let mut items = Vec::with_capacity(self.len());
        for item in self {
            items.push(item.snapshot(graph)?);
        }
        Ok(graph.list(items))
    }
}

impl<T: Snapshot> Snapshot for Vec<T> {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        self.as_slice().snapshot(graph)
    }
}

impl<T: Restore> Restore for Vec<T> {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                items.iter().map(|item| T::restore(graph, *item)).collect()
            }
            other => Err(mismatch("list", other)),
        }
    }
}

impl<V: Snapshot> Snapshot for BTreeMap<String, V> {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        let mut pairs = Vec::with_capacity(self.len());
        for (key, value) in self {
            let k = graph.str(key.clone());
            pairs.push((k, value.snapshot(graph)?));
        }
        Ok(graph.dict(pairs))
    }
}

impl<V: Restore> Restore for BTreeMap<String, V> {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        match graph.value(node)? {
            Value::Dict(pairs) => pairs
                .iter()
                .map(|(k, v)| Ok((String::restore(graph, *k)?, V::restore(graph, *v)?)))
                .collect(),
            other => Err(mismatch("dict", other)),
        }
    }
}

impl Snapshot for serde_json::Value {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        Ok(graph.from_json(self))
    }
}

impl Restore for serde_json::Value {
    fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
        graph.to_json(node)
    }
}

macro_rules! tuple_impls {
    ($(($($name:ident : $idx:tt),+)),+ $(,)?) => {
        $(
            impl<$($name: Snapshot),+> Snapshot for ($($name,)+) {
                fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
                    let items = vec![$(self.$idx.snapshot(graph)?),+];
                    Ok(graph.tuple(items))
                }
            }

            impl<$($name: Restore),+> Restore for ($($name,)+) {
                fn restore(graph: &Graph, node: NodeId) -> Result<Self, SerializationError> {
                    match graph.value(node)? {
                        Value::Tuple(items) | Value::List(items) => {
                            let expected = [$($idx),+].len();
                            if items.len() != expected {
                                return Err(SerializationError::Mismatch {
                                    expected: format!("{expected}-tuple"),
                                    found: format!("{}-tuple", items.len()),
                                });
                            }
                            Ok(($($name::restore(graph, items[$idx])?,)+))
                        }
                        other => Err(mismatch("tuple", other)),
                    }
                }
            }
        )+
    };
}

tuple_impls! {
    (A: 0),
    (A: 0, B: 1),
    (A: 0, B: 1, C: 2),
    (A: 0, B: 1, C: 2, D: 3),
}

impl<T: Snapshot + ?Sized> Snapshot for &T {
    fn snapshot(&self, graph: &mut Graph) -> Result<NodeId, SerializationError> {
        (**self).snapshot(graph)
    }
}
