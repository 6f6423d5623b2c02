//! S-expression codec.
//!
//! Compound values are lists headed by a keyword symbol:
//! `(list 1 2)`, `(dictionary ("k" 1))`, `(reference 1 (list ...))`.
//! Instances are headed by their type name as a string instead, so a
//! type can never be mistaken for a keyword.

use std::fmt;

use crate::capabilities::Capabilities;
use crate::error::SerializationError;
use crate::externalizer::ExternalId;
use crate::tree::{Codec, Tree};

#[derive(Debug, Clone, PartialEq)]
pub enum Sexp {
    Symbol(String),
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<Sexp>),
}

impl Sexp {
    fn symbol(name: &str) -> Sexp {
        Sexp::Symbol(name.to_string())
    }

    fn keyword(name: &str, mut rest: Vec<Sexp>) -> Sexp {
        rest.insert(0, Sexp::symbol(name));
        Sexp::List(rest)
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Symbol(s) => write!(f, "{s}"),
            Sexp::Str(s) => write!(f, "{s:?}"),
            Sexp::Int(i) => write!(f, "{i}"),
            Sexp::Float(x) => write!(f, "{x:?}"),
            Sexp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SexpCodec;

impl Codec for SexpCodec {
    type Output = Sexp;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn pack_none(&self) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("None", vec![]))
    }

    fn pack_bool(&self, value: bool) -> Result<Sexp, SerializationError> {
        let text = if value { "true" } else { "false" };
        Ok(Sexp::keyword("boolean", vec![Sexp::symbol(text)]))
    }

    fn pack_int(&self, value: i64) -> Result<Sexp, SerializationError> {
        Ok(Sexp::Int(value))
    }

    fn pack_float(&self, value: f64) -> Result<Sexp, SerializationError> {
        Ok(Sexp::Float(value))
    }

    fn pack_str(&self, value: &str) -> Result<Sexp, SerializationError> {
        Ok(Sexp::Str(value.to_string()))
    }

    fn pack_bytes(&self, value: &[u8]) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("bytes", vec![Sexp::Str(hex::encode(value))]))
    }

    fn pack_tuple(&self, items: Vec<Sexp>) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("tuple", items))
    }

    fn pack_list(&self, items: Vec<Sexp>) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("list", items))
    }

    fn pack_set(&self, items: Vec<Sexp>) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("set", items))
    }

    fn pack_dict(&self, items: Vec<(Sexp, Sexp)>) -> Result<Sexp, SerializationError> {
        let pairs = items.into_iter().map(|(k, v)| Sexp::List(vec![k, v])).collect();
        Ok(Sexp::keyword("dictionary", pairs))
    }

    fn pack_type(&self, name: &str) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("class", vec![Sexp::Str(name.to_string())]))
    }

    fn pack_enum(&self, type_name: &str, variant: &str) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword(
            "enum",
            vec![Sexp::Str(type_name.to_string()), Sexp::Str(variant.to_string())],
        ))
    }

    fn pack_instance(&self, type_name: &str, state: Sexp) -> Result<Sexp, SerializationError> {
        Ok(Sexp::List(vec![Sexp::Str(type_name.to_string()), state]))
    }

    fn pack_external(&self, id: &ExternalId) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword(
            "external",
            vec![Sexp::Str(id.type_name.clone()), Sexp::Str(id.ident.clone())],
        ))
    }

    fn pack_reference(&self, refid: u32, value: Sexp) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("reference", vec![Sexp::Int(refid.into()), value]))
    }

    fn pack_dereference(&self, refid: u32) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("dereference", vec![Sexp::Int(refid.into())]))
    }

    fn pack_function(&self, name: &str) -> Result<Sexp, SerializationError> {
        Ok(Sexp::keyword("function", vec![Sexp::Str(name.to_string())]))
    }

    fn unpack(&self, data: &Sexp) -> Result<Tree, SerializationError> {
        match data {
            Sexp::Int(i) => Ok(Tree::Int(*i)),
            Sexp::Float(x) => Ok(Tree::Float(*x)),
            Sexp::Str(s) => Ok(Tree::Str(s.clone())),
            Sexp::Symbol(s) => Err(SerializationError::InvalidData(format!("bare symbol {s}"))),
            Sexp::List(items) => match items.split_first() {
                Some((Sexp::Symbol(head), rest)) => self.unpack_keyword(head, rest),
                Some((Sexp::Str(type_name), [state])) => Ok(Tree::Instance {
                    type_name: type_name.clone(),
                    state: Box::new(self.unpack(state)?),
                }),
                _ => Err(SerializationError::InvalidData(format!("malformed list {data}"))),
            },
        }
    }
}

impl SexpCodec {
    fn unpack_all(&self, items: &[Sexp]) -> Result<Vec<Tree>, SerializationError> {
        items.iter().map(|item| self.unpack(item)).collect()
    }

    fn unpack_keyword(&self, head: &str, rest: &[Sexp]) -> Result<Tree, SerializationError> {
        match (head, rest) {
            ("None", []) => Ok(Tree::None),
            ("boolean", [Sexp::Symbol(flag)]) => match flag.as_str() {
                "true" => Ok(Tree::Bool(true)),
                "false" => Ok(Tree::Bool(false)),
                other => Err(SerializationError::InvalidData(format!("boolean {other}"))),
            },
            ("bytes", [Sexp::Str(text)]) => hex::decode(text)
                .map(Tree::Bytes)
                .map_err(|e| SerializationError::InvalidData(e.to_string())),
            ("tuple", items) => Ok(Tree::Tuple(self.unpack_all(items)?)),
            ("list", items) => Ok(Tree::List(self.unpack_all(items)?)),
            ("set", items) => Ok(Tree::Set(self.unpack_all(items)?)),
            ("dictionary", pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    match pair {
                        Sexp::List(kv) if kv.len() == 2 => {
                            out.push((self.unpack(&kv[0])?, self.unpack(&kv[1])?));
                        }
                        other => {
                            return Err(SerializationError::InvalidData(format!(
                                "dictionary entry {other}"
                            )))
                        }
                    }
                }
                Ok(Tree::Dict(out))
            }
            ("class", [Sexp::Str(name)]) => Ok(Tree::Type(name.clone())),
            ("enum", [Sexp::Str(type_name), Sexp::Str(variant)]) => Ok(Tree::Enum {
                type_name: type_name.clone(),
                variant: variant.clone(),
            }),
            ("external", [Sexp::Str(type_name), Sexp::Str(ident)]) => {
                Ok(Tree::External(ExternalId::new(type_name.clone(), ident.clone())))
            }
            ("reference", [Sexp::Int(refid), value]) => Ok(Tree::Reference {
                refid: to_refid(*refid)?,
                value: Box::new(self.unpack(value)?),
            }),
            ("dereference", [Sexp::Int(refid)]) => Ok(Tree::Dereference(to_refid(*refid)?)),
            ("function", [Sexp::Str(name)]) => Ok(Tree::Function(name.clone())),
            (other, _) => Err(SerializationError::InvalidData(format!("unknown keyword {other}"))),
        }
    }
}

fn to_refid(value: i64) -> Result<u32, SerializationError> {
    u32::try_from(value).map_err(|_| SerializationError::InvalidData(format!("reference id {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{safe_equal, Graph};
    use crate::registry::Registry;
    use crate::serializer::Serializer;
    use crate::unserializer::Unserializer;

    #[test]
    fn test_sexp_text_rendering() {
        let mut graph = Graph::new();
        let (one, flag, none) = (graph.int(1), graph.bool(true), graph.none());
        let name = graph.str("x");
        let root = graph.list(vec![one, flag, none, name]);

        let packed = Serializer::new(SexpCodec).convert(&graph, root).unwrap();
        assert_eq!(packed.to_string(), r#"(list 1 (boolean true) (None) "x")"#);
    }

    #[test]
    fn test_mutually_referencing_dicts_roundtrip() {
        let mut graph = Graph::new();
        let left = graph.dict(vec![]);
        let right = graph.dict(vec![]);
        let (k_peer, k_back) = (graph.str("peer"), graph.str("back"));
        graph.insert(left, k_peer, right).unwrap();
        graph.insert(right, k_back, left).unwrap();
        let root = graph.list(vec![left, right]);

        let packed = Serializer::new(SexpCodec).convert(&graph, root).unwrap();
        let registry = Registry::new();
        let (restored, rroot) = Unserializer::new(SexpCodec, &registry).convert(&packed).unwrap();
        assert!(safe_equal(&graph, root, &restored, rroot));
    }

    #[test]
    fn test_instance_headed_by_type_string() {
        let mut graph = Graph::new();
        let state = graph.int(5);
        let root = graph.instance("list", state);

        let packed = Serializer::new(SexpCodec).convert(&graph, root).unwrap();
        assert_eq!(packed.to_string(), r#"("list" 5)"#);

        let mut registry = Registry::new();
        registry.register_type("list");
        let (restored, rroot) = Unserializer::new(SexpCodec, &registry).convert(&packed).unwrap();
        assert!(safe_equal(&graph, root, &restored, rroot));
    }
}
