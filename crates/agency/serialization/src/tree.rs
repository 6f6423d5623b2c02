//! Flattened reference tree and the codec seam.
//!
//! The serializer turns a graph into a [`Tree`] in which shared nodes are
//! wrapped once in [`Tree::Reference`] and then named by
//! [`Tree::Dereference`]. A [`Codec`] packs that tree bottom-up into its
//! own representation and unpacks it again.

use serde::{Deserialize, Serialize};

use crate::capabilities::Capabilities;
use crate::error::SerializationError;
use crate::externalizer::ExternalId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Tree {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Tree>),
    List(Vec<Tree>),
    Set(Vec<Tree>),
    Dict(Vec<(Tree, Tree)>),
    Type(String),
    Enum { type_name: String, variant: String },
    Instance { type_name: String, state: Box<Tree> },
    External(ExternalId),
    Reference { refid: u32, value: Box<Tree> },
    Dereference(u32),
    Function(String),
}

impl Tree {
    pub fn kind(&self) -> &'static str {
        match self {
            Tree::None => "none",
            Tree::Bool(_) => "bool",
            Tree::Int(_) => "int",
            Tree::Float(_) => "float",
            Tree::Str(_) => "str",
            Tree::Bytes(_) => "bytes",
            Tree::Tuple(_) => "tuple",
            Tree::List(_) => "list",
            Tree::Set(_) => "set",
            Tree::Dict(_) => "dict",
            Tree::Type(_) => "type",
            Tree::Enum { .. } => "enum",
            Tree::Instance { .. } => "instance",
            Tree::External(_) => "external",
            Tree::Reference { .. } => "reference",
            Tree::Dereference(_) => "dereference",
            Tree::Function(_) => "function",
        }
    }
}

/// Per-node packer functions of a codec.
///
/// Every container packer receives its children already packed.
pub trait Codec {
    type Output;

    fn capabilities(&self) -> Capabilities;

    fn pack_none(&self) -> Result<Self::Output, SerializationError>;
    fn pack_bool(&self, value: bool) -> Result<Self::Output, SerializationError>;
    fn pack_int(&self, value: i64) -> Result<Self::Output, SerializationError>;
    fn pack_float(&self, value: f64) -> Result<Self::Output, SerializationError>;
    fn pack_str(&self, value: &str) -> Result<Self::Output, SerializationError>;
    fn pack_bytes(&self, value: &[u8]) -> Result<Self::Output, SerializationError>;
    fn pack_tuple(&self, items: Vec<Self::Output>) -> Result<Self::Output, SerializationError>;
    fn pack_list(&self, items: Vec<Self::Output>) -> Result<Self::Output, SerializationError>;
    fn pack_set(&self, items: Vec<Self::Output>) -> Result<Self::Output, SerializationError>;
    fn pack_dict(
        &self,
        items: Vec<(Self::Output, Self::Output)>,
    ) -> Result<Self::Output, SerializationError>;
    fn pack_type(&self, name: &str) -> Result<Self::Output, SerializationError>;
    fn pack_enum(&self, type_name: &str, variant: &str) -> Result<Self::Output, SerializationError>;
    fn pack_instance(
        &self,
        type_name: &str,
        state: Self::Output,
    ) -> Result<Self::Output, SerializationError>;
    fn pack_external(&self, id: &ExternalId) -> Result<Self::Output, SerializationError>;
    fn pack_reference(
        &self,
        refid: u32,
        value: Self::Output,
    ) -> Result<Self::Output, SerializationError>;
    fn pack_dereference(&self, refid: u32) -> Result<Self::Output, SerializationError>;
    fn pack_function(&self, name: &str) -> Result<Self::Output, SerializationError>;

    /// Reads codec data back into the flattened tree form.
    fn unpack(&self, data: &Self::Output) -> Result<Tree, SerializationError>;
}

/// Packs a flattened tree bottom-up with `codec`.
pub fn pack<C: Codec + ?Sized>(codec: &C, tree: &Tree) -> Result<C::Output, SerializationError> {
    match tree {
        Tree::None => codec.pack_none(),
        Tree::Bool(b) => codec.pack_bool(*b),
        Tree::Int(i) => codec.pack_int(*i),
        Tree::Float(f) => codec.pack_float(*f),
        Tree::Str(s) => codec.pack_str(s),
        Tree::Bytes(b) => codec.pack_bytes(b),
        Tree::Tuple(items) => codec.pack_tuple(pack_all(codec, items)?),
        Tree::List(items) => codec.pack_list(pack_all(codec, items)?),
        Tree::Set(items) => codec.pack_set(pack_all(codec, items)?),
        Tree::Dict(pairs) => {
            let mut packed = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                packed.push((pack(codec, k)?, pack(codec, v)?));
            }
            codec.pack_dict(packed)
        }
        Tree::Type(name) => codec.pack_type(name),
        Tree::Enum { type_name, variant } => codec.pack_enum(type_name, variant),
        Tree::Instance { type_name, state } => {
            let state = pack(codec, state)?;
            codec.pack_instance(type_name, state)
        }
        Tree::External(id) => codec.pack_external(id),
        Tree::Reference { refid, value } => {
            let value = pack(codec, value)?;
            codec.pack_reference(*refid, value)
        }
        Tree::Dereference(refid) => codec.pack_dereference(*refid),
        Tree::Function(name) => codec.pack_function(name),
    }
}

fn pack_all<C: Codec + ?Sized>(codec: &C, items: &[Tree]) -> Result<Vec<C::Output>, SerializationError> {
    items.iter().map(|item| pack(codec, item)).collect()
}

/// Codec whose output is the flattened tree itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeCodec;

impl Codec for TreeCodec {
    type Output = Tree;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn pack_none(&self) -> Result<Tree, SerializationError> {
        Ok(Tree::None)
    }

    fn pack_bool(&self, value: bool) -> Result<Tree, SerializationError> {
        Ok(Tree::Bool(value))
    }

    fn pack_int(&self, value: i64) -> Result<Tree, SerializationError> {
        Ok(Tree::Int(value))
    }

    fn pack_float(&self, value: f64) -> Result<Tree, SerializationError> {
        Ok(Tree::Float(value))
    }

    fn pack_str(&self, value: &str) -> Result<Tree, SerializationError> {
        Ok(Tree::Str(value.to_string()))
    }

    fn pack_bytes(&self, value: &[u8]) -> Result<Tree, SerializationError> {
        Ok(Tree::Bytes(value.to_vec()))
    }

    fn pack_tuple(&self, items: Vec<Tree>) -> Result<Tree, SerializationError> {
        Ok(Tree::Tuple(items))
    }

    fn pack_list(&self, items: Vec<Tree>) -> Result<Tree, SerializationError> {
        Ok(Tree::List(items))
    }

    fn pack_set(&self, items: Vec<Tree>) -> Result<Tree, SerializationError> {
        Ok(Tree::Set(items))
    }

    fn pack_dict(&self, items: Vec<(Tree, Tree)>) -> Result<Tree, SerializationError> {
        Ok(Tree::Dict(items))
    }

    fn pack_type(&self, name: &str) -> Result<Tree, SerializationError> {
        Ok(Tree::Type(name.to_string()))
    }

    fn pack_enum(&self, type_name: &str, variant: &str) -> Result<Tree, SerializationError> {
        Ok(Tree::Enum {
            type_name: type_name.to_string(),
            variant: variant.to_string(),
        })
    }

    fn pack_instance(&self, type_name: &str, state: Tree) -> Result<Tree, SerializationError> {
        Ok(Tree::Instance {
            type_name: type_name.to_string(),
            state: Box::new(state),
        })
    }

    fn pack_external(&self, id: &ExternalId) -> Result<Tree, SerializationError> {
        Ok(Tree::External(id.clone()))
    }

    fn pack_reference(&self, refid: u32, value: Tree) -> Result<Tree, SerializationError> {
        Ok(Tree::Reference {
            refid,
            value: Box::new(value),
        })
    }

    fn pack_dereference(&self, refid: u32) -> Result<Tree, SerializationError> {
        Ok(Tree::Dereference(refid))
    }

    fn pack_function(&self, name: &str) -> Result<Tree, SerializationError> {
        Ok(Tree::Function(name.to_string()))
    }

    fn unpack(&self, data: &Tree) -> Result<Tree, SerializationError> {
        Ok(data.clone())
    }
}
