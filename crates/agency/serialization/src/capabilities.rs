use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A kind of value or structural feature a codec can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    NoneValues,
    BoolValues,
    IntValues,
    FloatValues,
    StrValues,
    BytesValues,
    TupleValues,
    ListValues,
    SetValues,
    DictValues,
    TypeValues,
    EnumValues,
    InstanceValues,
    ExternalValues,
    FunctionValues,
    StrKeys,
    NonStrKeys,
    CircularReferences,
}

impl Capability {
    pub const ALL: [Capability; 18] = [
        Capability::NoneValues,
        Capability::BoolValues,
        Capability::IntValues,
        Capability::FloatValues,
        Capability::StrValues,
        Capability::BytesValues,
        Capability::TupleValues,
        Capability::ListValues,
        Capability::SetValues,
        Capability::DictValues,
        Capability::TypeValues,
        Capability::EnumValues,
        Capability::InstanceValues,
        Capability::ExternalValues,
        Capability::FunctionValues,
        Capability::StrKeys,
        Capability::NonStrKeys,
        Capability::CircularReferences,
    ];
}

/// Set of capabilities declared by a codec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn all() -> Self {
        Self(Capability::ALL.iter().copied().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.0.remove(&capability);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_removes_single_capability() {
        let caps = Capabilities::all().without(Capability::NonStrKeys);
        assert!(!caps.contains(Capability::NonStrKeys));
        assert!(caps.contains(Capability::StrKeys));
        assert_eq!(caps.iter().count(), Capability::ALL.len() - 1);
    }
}
