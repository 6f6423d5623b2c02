//! # Agency Serialization
//!
//! Cycle-safe serialization of value graphs.
//!
//! A [`Graph`] is an arena of nodes in which containers point at their
//! elements by [`NodeId`], so shared and self-referential structures are
//! expressed directly. The [`Serializer`] flattens a graph into a
//! [`Tree`] with explicit reference/dereference markers and packs it with
//! a [`Codec`]; the [`Unserializer`] reverses this, resolving references
//! that appear out of order.
//!
//! Three codecs share the same reference algorithm:
//!
//! - [`TreeCodec`]: the flattened tree itself
//! - [`JsonCodec`]: `serde_json` documents
//! - [`SexpCodec`]: s-expression lists

pub mod capabilities;
pub mod error;
pub mod externalizer;
pub mod graph;
pub mod json;
pub mod registry;
pub mod serializer;
pub mod sexp;
pub mod snapshot;
pub mod tree;
pub mod unserializer;

pub use capabilities::{Capabilities, Capability};
pub use error::SerializationError;
pub use externalizer::{ExternalId, Externalizer};
pub use graph::{safe_equal, Graph, NodeId, Value};
pub use json::JsonCodec;
pub use registry::{KnownType, Registry, Restorator};
pub use serializer::Serializer;
pub use sexp::{Sexp, SexpCodec};
pub use snapshot::{freeze, restore_serde, snapshot_serde, thaw, Restore, Snapshot};
pub use tree::{pack, Codec, Tree, TreeCodec};
pub use unserializer::{Unserializer, MAX_DELAYED_PASSES};
