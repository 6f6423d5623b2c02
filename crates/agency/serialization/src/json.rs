//! JSON codec.
//!
//! Lists map to arrays and dicts with string keys to objects. Everything
//! else is an array headed by a dotted marker (`".tuple"`, `".set"`,
//! `".ref"`, ...). Instances are objects carrying a `".type"` key; their
//! state is merged in when it is a string-keyed dict, otherwise it sits
//! under `".state"`.

use serde_json::{Map, Value as Json};

use crate::capabilities::{Capabilities, Capability};
use crate::error::SerializationError;
use crate::externalizer::ExternalId;
use crate::tree::{Codec, Tree};

const TUPLE_ATOM: &str = ".tuple";
const SET_ATOM: &str = ".set";
const BYTES_ATOM: &str = ".bytes";
const ENUM_ATOM: &str = ".enum";
const TYPE_ATOM: &str = ".type";
const STATE_ATOM: &str = ".state";
const EXTERNAL_ATOM: &str = ".ext";
const REFERENCE_ATOM: &str = ".ref";
const DEREFERENCE_ATOM: &str = ".deref";
const FUNCTION_ATOM: &str = ".function";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    force_unicode: bool,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stringifies non-string dict keys instead of refusing them.
    /// Such keys come back as strings.
    pub fn force_unicode(mut self) -> Self {
        self.force_unicode = true;
        self
    }

    pub fn to_text(&self, value: &Json) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(value)?)
    }

    pub fn from_text(&self, text: &str) -> Result<Json, SerializationError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn tagged(atom: &str, mut rest: Vec<Json>) -> Json {
    rest.insert(0, Json::String(atom.to_string()));
    Json::Array(rest)
}

impl Codec for JsonCodec {
    type Output = Json;

    fn capabilities(&self) -> Capabilities {
        if self.force_unicode {
            Capabilities::all()
        } else {
            Capabilities::all().without(Capability::NonStrKeys)
        }
    }

    fn pack_none(&self) -> Result<Json, SerializationError> {
        Ok(Json::Null)
    }

    fn pack_bool(&self, value: bool) -> Result<Json, SerializationError> {
        Ok(Json::Bool(value))
    }

    fn pack_int(&self, value: i64) -> Result<Json, SerializationError> {
        Ok(Json::from(value))
    }

    fn pack_float(&self, value: f64) -> Result<Json, SerializationError> {
        serde_json::Number::from_f64(value)
            .map(Json::Number)
            .ok_or_else(|| SerializationError::TypeNotSupported(format!("float {value}")))
    }

    fn pack_str(&self, value: &str) -> Result<Json, SerializationError> {
        Ok(Json::String(value.to_string()))
    }

    fn pack_bytes(&self, value: &[u8]) -> Result<Json, SerializationError> {
        Ok(tagged(BYTES_ATOM, vec![Json::String(hex::encode(value))]))
    }

    fn pack_tuple(&self, items: Vec<Json>) -> Result<Json, SerializationError> {
        Ok(tagged(TUPLE_ATOM, items))
    }

    fn pack_list(&self, items: Vec<Json>) -> Result<Json, SerializationError> {
        Ok(Json::Array(items))
    }

    fn pack_set(&self, items: Vec<Json>) -> Result<Json, SerializationError> {
        Ok(tagged(SET_ATOM, items))
    }

    fn pack_dict(&self, items: Vec<(Json, Json)>) -> Result<Json, SerializationError> {
        let mut map = Map::new();
        for (key, value) in items {
            let key = match key {
                Json::String(s) => s,
                other if self.force_unicode => other.to_string(),
                _ => return Err(SerializationError::CapabilityNotSupported(Capability::NonStrKeys)),
            };
            map.insert(key, value);
        }
        Ok(Json::Object(map))
    }

    fn pack_type(&self, name: &str) -> Result<Json, SerializationError> {
        Ok(tagged(TYPE_ATOM, vec![Json::String(name.to_string())]))
    }

    fn pack_enum(&self, type_name: &str, variant: &str) -> Result<Json, SerializationError> {
        Ok(tagged(ENUM_ATOM, vec![Json::String(format!("{type_name}.{variant}"))]))
    }

    fn pack_instance(&self, type_name: &str, state: Json) -> Result<Json, SerializationError> {
        let mut map = Map::new();
        map.insert(TYPE_ATOM.to_string(), Json::String(type_name.to_string()));
        match state {
            Json::Object(fields) if !fields.contains_key(TYPE_ATOM) && !fields.contains_key(STATE_ATOM) => {
                map.extend(fields);
            }
            other => {
                map.insert(STATE_ATOM.to_string(), other);
            }
        }
        Ok(Json::Object(map))
    }

    fn pack_external(&self, id: &ExternalId) -> Result<Json, SerializationError> {
        Ok(tagged(
            EXTERNAL_ATOM,
            vec![Json::String(id.type_name.clone()), Json::String(id.ident.clone())],
        ))
    }

    fn pack_reference(&self, refid: u32, value: Json) -> Result<Json, SerializationError> {
        Ok(tagged(REFERENCE_ATOM, vec![Json::from(refid), value]))
    }

    fn pack_dereference(&self, refid: u32) -> Result<Json, SerializationError> {
        Ok(tagged(DEREFERENCE_ATOM, vec![Json::from(refid)]))
    }

    fn pack_function(&self, name: &str) -> Result<Json, SerializationError> {
        Ok(tagged(FUNCTION_ATOM, vec![Json::String(name.to_string())]))
    }

    fn unpack(&self, data: &Json) -> Result<Tree, SerializationError> {
        match data {
            Json::Null => Ok(Tree::None),
            Json::Bool(b) => Ok(Tree::Bool(*b)),
            Json::Number(n) => Ok(match n.as_i64() {
                Some(i) => Tree::Int(i),
                None => Tree::Float(n.as_f64().unwrap_or(f64::NAN)),
            }),
            Json::String(s) => Ok(Tree::Str(s.clone())),
            Json::Array(items) => self.unpack_array(items),
            Json::Object(map) => self.unpack_object(map),
        }
    }
}

impl JsonCodec {
    fn unpack_all(&self, items: &[Json]) -> Result<Vec<Tree>, SerializationError> {
        items.iter().map(|item| self.unpack(item)).collect()
    }

    fn unpack_array(&self, items: &[Json]) -> Result<Tree, SerializationError> {
        let Some(Json::String(head)) = items.first() else {
            return Ok(Tree::List(self.unpack_all(items)?));
        };
        let rest = &items[1..];
        match head.as_str() {
            TUPLE_ATOM => Ok(Tree::Tuple(self.unpack_all(rest)?)),
            SET_ATOM => Ok(Tree::Set(self.unpack_all(rest)?)),
            BYTES_ATOM => {
                let text = expect_str(rest.first(), BYTES_ATOM)?;
                hex::decode(text)
                    .map(Tree::Bytes)
                    .map_err(|e| SerializationError::InvalidData(e.to_string()))
            }
            TYPE_ATOM => Ok(Tree::Type(expect_str(rest.first(), TYPE_ATOM)?.to_string())),
            ENUM_ATOM => {
                let text = expect_str(rest.first(), ENUM_ATOM)?;
                let (type_name, variant) = text.rsplit_once('.').ok_or_else(|| {
                    SerializationError::InvalidData(format!("malformed enum {text}"))
                })?;
                Ok(Tree::Enum {
                    type_name: type_name.to_string(),
                    variant: variant.to_string(),
                })
            }
            EXTERNAL_ATOM => Ok(Tree::External(ExternalId::new(
                expect_str(rest.first(), EXTERNAL_ATOM)?,
                expect_str(rest.get(1), EXTERNAL_ATOM)?,
            ))),
            REFERENCE_ATOM => {
                let refid = expect_refid(rest.first())?;
                let value = rest.get(1).ok_or_else(|| {
                    SerializationError::InvalidData("reference without value".to_string())
                })?;
                Ok(Tree::Reference {
                    refid,
                    value: Box::new(self.unpack(value)?),
                })
            }
            DEREFERENCE_ATOM => Ok(Tree::Dereference(expect_refid(rest.first())?)),
            FUNCTION_ATOM => Ok(Tree::Function(expect_str(rest.first(), FUNCTION_ATOM)?.to_string())),
            _ => Ok(Tree::List(self.unpack_all(items)?)),
        }
    }

    fn unpack_object(&self, map: &Map<String, Json>) -> Result<Tree, SerializationError> {
        let Some(type_name) = map.get(TYPE_ATOM) else {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, value) in map {
                pairs.push((Tree::Str(key.clone()), self.unpack(value)?));
            }
            return Ok(Tree::Dict(pairs));
        };
        let type_name = expect_str(Some(type_name), TYPE_ATOM)?.to_string();
        let state = match map.get(STATE_ATOM) {
            Some(state) => self.unpack(state)?,
            None => {
                let mut pairs = Vec::with_capacity(map.len());
                for (key, value) in map.iter().filter(|(k, _)| k.as_str() != TYPE_ATOM) {
                    pairs.push((Tree::Str(key.clone()), self.unpack(value)?));
                }
                Tree::Dict(pairs)
            }
        };
        Ok(Tree::Instance {
            type_name,
            state: Box::new(state),
        })
    }
}

fn expect_str<'a>(value: Option<&'a Json>, atom: &str) -> Result<&'a str, SerializationError> {
    value
        .and_then(Json::as_str)
        .ok_or_else(|| SerializationError::InvalidData(format!("{atom} expects a string")))
}

fn expect_refid(value: Option<&Json>) -> Result<u32, SerializationError> {
    value
        .and_then(Json::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| SerializationError::InvalidData("reference id expected".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{safe_equal, Graph, Value};
    use crate::registry::Registry;
    use crate::serializer::Serializer;
    use crate::unserializer::Unserializer;

    fn roundtrip(graph: &Graph, root: crate::graph::NodeId, registry: &Registry) -> (Graph, crate::graph::NodeId) {
        let codec = JsonCodec::new();
        let packed = Serializer::new(codec).convert(graph, root).unwrap();
        let text = codec.to_text(&packed).unwrap();
        let parsed = codec.from_text(&text).unwrap();
        Unserializer::new(codec, registry).convert(&parsed).unwrap()
    }

    #[test]
    fn test_json_layout_of_containers() {
        let mut graph = Graph::new();
        let (one, two) = (graph.int(1), graph.int(2));
        let tuple = graph.tuple(vec![one, two]);
        let key = graph.str("pair");
        let root = graph.dict(vec![(key, tuple)]);

        let packed = Serializer::new(JsonCodec::new()).convert(&graph, root).unwrap();
        assert_eq!(packed, serde_json::json!({"pair": [".tuple", 1, 2]}));
    }

    #[test]
    fn test_shared_value_survives_key_reordering() {
        // "z" is written first and carries the reference; JSON objects come
        // back sorted so the dereference under "a" is read first
        let mut graph = Graph::new();
        let one = graph.int(1);
        let shared = graph.list(vec![one]);
        let (z, a) = (graph.str("z"), graph.str("a"));
        let root = graph.dict(vec![(z, shared), (a, shared)]);

        let registry = Registry::new();
        let (restored, rroot) = roundtrip(&graph, root, &registry);
        assert!(safe_equal(&graph, root, &restored, rroot));
        assert_eq!(
            restored.lookup(rroot, "a").unwrap(),
            restored.lookup(rroot, "z").unwrap()
        );
    }

    #[test]
    fn test_instance_state_merged_into_object() {
        let mut graph = Graph::new();
        let doc = serde_json::json!({"cost": 3});
        let state = graph.from_json(&doc);
        let root = graph.instance("Bid", state);

        let packed = Serializer::new(JsonCodec::new()).convert(&graph, root).unwrap();
        assert_eq!(packed, serde_json::json!({".type": "Bid", "cost": 3}));

        let mut registry = Registry::new();
        registry.register_type("Bid");
        let (restored, rroot) = roundtrip(&graph, root, &registry);
        assert!(safe_equal(&graph, root, &restored, rroot));
    }

    #[test]
    fn test_non_string_keys_need_force_unicode() {
        let mut graph = Graph::new();
        let (key, value) = (graph.int(4), graph.str("four"));
        let root = graph.dict(vec![(key, value)]);

        assert_eq!(
            Serializer::new(JsonCodec::new()).convert(&graph, root),
            Err(SerializationError::CapabilityNotSupported(Capability::NonStrKeys))
        );
        let packed = Serializer::new(JsonCodec::new().force_unicode())
            .convert(&graph, root)
            .unwrap();
        assert_eq!(packed, serde_json::json!({"4": "four"}));
    }

    #[test]
    fn test_bytes_and_enum_roundtrip() {
        let mut graph = Graph::new();
        let bytes = graph.add(Value::Bytes(vec![0xde, 0xad]));
        let state = graph.add(Value::Enum {
            type_name: "ContractState".into(),
            variant: "granted".into(),
        });
        let root = graph.list(vec![bytes, state]);

        let mut registry = Registry::new();
        registry.register_type("ContractState");
        let (restored, rroot) = roundtrip(&graph, root, &registry);
        assert!(safe_equal(&graph, root, &restored, rroot));
    }
}
