//! Arena of value nodes.
//!
//! Containers refer to their elements by [`NodeId`], so one node can be
//! shared by several containers and a container can contain itself. Node
//! identity is the arena index.

use std::collections::HashMap;

use crate::error::SerializationError;
use crate::externalizer::ExternalId;

/// Index of a node inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Content of one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<NodeId>),
    List(Vec<NodeId>),
    Set(Vec<NodeId>),
    Dict(Vec<(NodeId, NodeId)>),
    Type(String),
    Enum { type_name: String, variant: String },
    Instance { type_name: String, state: NodeId },
    External(ExternalId),
    Function(String),
}

impl Value {
    /// Containers and instances are tracked by identity; everything else
    /// is a plain value.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            Value::Tuple(_) | Value::List(_) | Value::Set(_) | Value::Dict(_) | Value::Instance { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Type(_) => "type",
            Value::Enum { .. } => "enum",
            Value::Instance { .. } => "instance",
            Value::External(_) => "external",
            Value::Function(_) => "function",
        }
    }

    fn children(&self) -> Vec<NodeId> {
        match self {
            Value::Tuple(items) | Value::List(items) | Value::Set(items) => items.clone(),
            Value::Dict(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            Value::Instance { state, .. } => vec![*state],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Value>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Value) -> NodeId {
        self.nodes.push(value);
        NodeId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> Option<&Value> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Value> {
        self.nodes.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn value(&self, id: NodeId) -> Result<&Value, SerializationError> {
        self.get(id).ok_or(SerializationError::InvalidNode(id.0))
    }

    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, SerializationError> {
        Ok(self.value(id)?.children())
    }

    pub fn none(&mut self) -> NodeId {
        self.add(Value::None)
    }

    pub fn bool(&mut self, value: bool) -> NodeId {
        self.add(Value::Bool(value))
    }

    pub fn int(&mut self, value: i64) -> NodeId {
        self.add(Value::Int(value))
    }

    pub fn float(&mut self, value: f64) -> NodeId {
        self.add(Value::Float(value))
    }

    pub fn str(&mut self, value: impl Into<String>) -> NodeId {
        self.add(Value::Str(value.into()))
    }

    pub fn list(&mut self, items: Vec<NodeId>) -> NodeId {
        self.add(Value::List(items))
    }

    pub fn tuple(&mut self, items: Vec<NodeId>) -> NodeId {
        self.add(Value::Tuple(items))
    }

    pub fn dict(&mut self, pairs: Vec<(NodeId, NodeId)>) -> NodeId {
        self.add(Value::Dict(pairs))
    }

    pub fn instance(&mut self, type_name: impl Into<String>, state: NodeId) -> NodeId {
        self.add(Value::Instance {
            type_name: type_name.into(),
            state,
        })
    }

    /// Appends `item` to a tuple, list or set node.
    pub fn push(&mut self, container: NodeId, item: NodeId) -> Result<(), SerializationError> {
        match self.nodes.get_mut(container.0) {
            Some(Value::Tuple(items)) | Some(Value::List(items)) | Some(Value::Set(items)) => {
                items.push(item);
                Ok(())
            }
            Some(other) => Err(SerializationError::Mismatch {
                expected: "sequence".to_string(),
                found: other.kind().to_string(),
            }),
            None => Err(SerializationError::InvalidNode(container.0)),
        }
    }

    /// Inserts a pair into a dict node.
    pub fn insert(
        &mut self,
        dict: NodeId,
        key: NodeId,
        value: NodeId,
    ) -> Result<(), SerializationError> {
        match self.nodes.get_mut(dict.0) {
            Some(Value::Dict(pairs)) => {
                pairs.push((key, value));
                Ok(())
            }
            Some(other) => Err(SerializationError::Mismatch {
                expected: "dict".to_string(),
                found: other.kind().to_string(),
            }),
            None => Err(SerializationError::InvalidNode(dict.0)),
        }
    }

    /// Looks a string key up in a dict node.
    pub fn lookup(&self, dict: NodeId, key: &str) -> Result<Option<NodeId>, SerializationError> {
        match self.value(dict)? {
            Value::Dict(pairs) => Ok(pairs.iter().find_map(|(k, v)| match self.get(*k) {
                Some(Value::Str(s)) if s == key => Some(*v),
                _ => None,
            })),
            other => Err(SerializationError::Mismatch {
                expected: "dict".to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    /// Builds nodes from a JSON document. The result is always acyclic.
    pub fn from_json(&mut self, value: &serde_json::Value) -> NodeId {
        match value {
            serde_json::Value::Null => self.none(),
            serde_json::Value::Bool(b) => self.bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => self.int(i),
                None => self.float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => self.str(s.clone()),
            serde_json::Value::Array(items) => {
                let ids = items.iter().map(|item| self.from_json(item)).collect();
                self.list(ids)
            }
            serde_json::Value::Object(map) => {
                let pairs = map
                    .iter()
                    .map(|(k, v)| {
                        let key = self.str(k.clone());
                        let value = self.from_json(v);
                        (key, value)
                    })
                    .collect();
                self.dict(pairs)
            }
        }
    }

    /// Converts the subtree under `root` to a JSON document.
    ///
    /// Fails on cycles, non-string dict keys and values JSON cannot hold.
    pub fn to_json(&self, root: NodeId) -> Result<serde_json::Value, SerializationError> {
        let mut path = Vec::new();
        self.to_json_inner(root, &mut path)
    }

    fn to_json_inner(
        &self,
        id: NodeId,
        path: &mut Vec<NodeId>,
    ) -> Result<serde_json::Value, SerializationError> {
        let value = self.value(id)?;
        if value.is_tracked() {
            if path.contains(&id) {
                return Err(SerializationError::Cycle);
            }
            path.push(id);
        }
        let json = match value {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| SerializationError::TypeNotSupported(format!("float {f}")))?,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Tuple(items) | Value::List(items) | Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.to_json_inner(*item, path)?);
                }
                serde_json::Value::Array(out)
            }
            Value::Dict(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    let key = match self.value(*k)? {
                        Value::Str(s) => s.clone(),
                        other => {
                            return Err(SerializationError::TypeNotSupported(format!(
                                "{} dict key",
                                other.kind()
                            )))
                        }
                    };
                    map.insert(key, self.to_json_inner(*v, path)?);
                }
                serde_json::Value::Object(map)
            }
            other => {
                return Err(SerializationError::TypeNotSupported(
                    other.kind().to_string(),
                ))
            }
        };
        if value.is_tracked() {
            path.pop();
        }
        Ok(json)
    }

    pub(crate) fn set(&mut self, id: NodeId, value: Value) {
        if let Some(slot) = self.nodes.get_mut(id.0) {
            *slot = value;
        }
    }
}

/// Structural equality that also respects sharing.
///
/// Two tracked nodes that are the same node in `a` must map to the same
/// node in `b` (and the other way round), so a self-referential list only
/// equals another self-referential list. Dict entries are matched by key,
/// not position, since codecs are free to reorder them.
pub fn safe_equal(a: &Graph, root_a: NodeId, b: &Graph, root_b: NodeId) -> bool {
    let mut matcher = Matcher {
        a,
        b,
        forward: HashMap::new(),
        backward: HashMap::new(),
    };
    matcher.equal(root_a, root_b)
}

struct Matcher<'g> {
    a: &'g Graph,
    b: &'g Graph,
    forward: HashMap<NodeId, NodeId>,
    backward: HashMap<NodeId, NodeId>,
}

impl Matcher<'_> {
    fn equal(&mut self, x: NodeId, y: NodeId) -> bool {
        let (Some(vx), Some(vy)) = (self.a.get(x), self.b.get(y)) else {
            return false;
        };
        if vx.is_tracked() || vy.is_tracked() {
            match (self.forward.get(&x), self.backward.get(&y)) {
                (Some(mx), Some(my)) => return *mx == y && *my == x,
                (None, None) => {
                    self.forward.insert(x, y);
                    self.backward.insert(y, x);
                }
                _ => return false,
            }
        }
        match (vx, vy) {
            (Value::Tuple(ix), Value::Tuple(iy))
            | (Value::List(ix), Value::List(iy))
            | (Value::Set(ix), Value::Set(iy)) => {
                ix.len() == iy.len() && ix.iter().zip(iy).all(|(p, q)| self.equal(*p, *q))
            }
            (Value::Dict(px), Value::Dict(py)) => {
                if px.len() != py.len() {
                    return false;
                }
                for (kx, vx) in px {
                    let Some((ky, vy)) = py.iter().find(|(ky, _)| self.same_key(*kx, *ky)) else {
                        return false;
                    };
                    if !self.equal(*kx, *ky) || !self.equal(*vx, *vy) {
                        return false;
                    }
                }
                true
            }
            (
                Value::Instance {
                    type_name: tx,
                    state: sx,
                },
                Value::Instance {
                    type_name: ty,
                    state: sy,
                },
            ) => tx == ty && self.equal(*sx, *sy),
            (Value::Float(fx), Value::Float(fy)) => fx == fy || (fx.is_nan() && fy.is_nan()),
            (px, py) => px == py,
        }
    }

    fn same_key(&self, x: NodeId, y: NodeId) -> bool {
        match (self.a.get(x), self.b.get(y)) {
            (Some(Value::Tuple(ix)), Some(Value::Tuple(iy))) => {
                ix.len() == iy.len() && ix.iter().zip(iy).all(|(p, q)| self.same_key(*p, *q))
            }
            (Some(vx), Some(vy)) if !vx.is_tracked() => vx == vy,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip_through_graph() {
        let doc = serde_json::json!({"a": [1, 2.5, "x"], "b": null, "c": {"d": true}});
        let mut graph = Graph::new();
        let root = graph.from_json(&doc);
        assert_eq!(graph.to_json(root).unwrap(), doc);
    }

    #[test]
    fn test_to_json_rejects_cycles() {
        let mut graph = Graph::new();
        let list = graph.list(vec![]);
        graph.push(list, list).unwrap();
        assert_eq!(graph.to_json(list), Err(SerializationError::Cycle));
    }

    #[test]
    fn test_safe_equal_distinguishes_sharing() {
        // [x, x] with a shared inner list
        let mut shared = Graph::new();
        let inner = shared.list(vec![]);
        let one = shared.int(1);
        shared.push(inner, one).unwrap();
        let outer = shared.list(vec![inner, inner]);

        // [x, y] with two equal but distinct inner lists
        let mut split = Graph::new();
        let one = split.int(1);
        let first = split.list(vec![one]);
        let one = split.int(1);
        let second = split.list(vec![one]);
        let outer_split = split.list(vec![first, second]);

        assert!(safe_equal(&shared, outer, &shared, outer));
        assert!(!safe_equal(&shared, outer, &split, outer_split));
    }

    #[test]
    fn test_safe_equal_ignores_dict_order() {
        let mut a = Graph::new();
        let (k1, v1, k2, v2) = (a.str("x"), a.int(1), a.str("y"), a.int(2));
        let da = a.dict(vec![(k1, v1), (k2, v2)]);

        let mut b = Graph::new();
        let (k2, v2, k1, v1) = (b.str("y"), b.int(2), b.str("x"), b.int(1));
        let db = b.dict(vec![(k2, v2), (k1, v1)]);

        assert!(safe_equal(&a, da, &b, db));
    }

    #[test]
    fn test_missing_node_is_reported() {
        let mut graph = Graph::new();
        graph.int(1);
        assert!(graph.get(NodeId(3)).is_none());
        assert!(matches!(graph.value(NodeId(3)), Err(SerializationError::InvalidNode(3))));
        assert!(matches!(graph.children(NodeId(3)), Err(SerializationError::InvalidNode(3))));
    }

    #[test]
    fn test_lookup_finds_string_key() {
        let mut graph = Graph::new();
        let doc = serde_json::json!({"name": "agent"});
        let root = graph.from_json(&doc);
        let found = graph.lookup(root, "name").unwrap().unwrap();
        assert_eq!(graph.value(found).unwrap(), &Value::Str("agent".to_string()));
        assert!(graph.lookup(root, "missing").unwrap().is_none());
    }
}
