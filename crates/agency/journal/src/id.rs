//! Hierarchical recorder identifiers.

use serde::{Deserialize, Serialize};

/// Identity of a recorded object: the path of child indexes from its
/// recorder root, prefixed by the root's base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JournalId(pub Vec<u64>);

impl JournalId {
    pub fn new(parts: impl Into<Vec<u64>>) -> Self {
        Self(parts.into())
    }

    pub fn child(&self, index: u64) -> Self {
        let mut parts = self.0.clone();
        parts.push(index);
        Self(parts)
    }

    pub fn parent(&self) -> Option<Self> {
        match self.0.split_last() {
            Some((_, rest)) if !rest.is_empty() => Some(Self(rest.to_vec())),
            _ => None,
        }
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for JournalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// A recorder allocates identities to the objects it creates.
///
/// Children are numbered from 1 in creation order, so two recorders with
/// the same base that create objects in the same order hand out the same
/// identities. Replay depends on this.
#[derive(Debug, Clone)]
pub struct Recorder {
    id: JournalId,
    next_child: u64,
}

impl Recorder {
    /// Root recorder with the given base, e.g. the index of an agent.
    pub fn root(base: impl Into<Vec<u64>>) -> Self {
        Self {
            id: JournalId::new(base),
            next_child: 0,
        }
    }

    pub fn journal_id(&self) -> &JournalId {
        &self.id
    }

    /// Allocates the identity of the next child.
    pub fn next_child_id(&mut self) -> JournalId {
        self.next_child += 1;
        self.id.child(self.next_child)
    }

    /// Allocates a child identity and returns a recorder rooted there.
    pub fn spawn_child(&mut self) -> Recorder {
        Recorder {
            id: self.next_child_id(),
            next_child: 0,
        }
    }

    pub fn children_allocated(&self) -> u64 {
        self.next_child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_numbered_in_creation_order() {
        let mut root = Recorder::root(vec![7]);
        assert_eq!(root.next_child_id(), JournalId::new(vec![7, 1]));
        let mut nested = root.spawn_child();
        assert_eq!(nested.journal_id(), &JournalId::new(vec![7, 2]));
        assert_eq!(nested.next_child_id(), JournalId::new(vec![7, 2, 1]));
        assert_eq!(root.children_allocated(), 2);
    }

    #[test]
    fn test_same_base_same_ids() {
        let mut a = Recorder::root(vec![1]);
        let mut b = Recorder::root(vec![1]);
        for _ in 0..3 {
            assert_eq!(a.next_child_id(), b.next_child_id());
        }
    }

    #[test]
    fn test_display_and_parent() {
        let id = JournalId::new(vec![1, 4, 2]);
        assert_eq!(id.to_string(), "(1, 4, 2)");
        assert_eq!(id.parent(), Some(JournalId::new(vec![1, 4])));
        assert_eq!(JournalId::new(vec![1]).parent(), None);
    }
}
