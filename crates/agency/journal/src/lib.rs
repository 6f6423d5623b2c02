//! # Agency Journal
//!
//! Recording and deterministic replay of recorded calls.
//!
//! Every stateful object that takes part in recording gets a hierarchical
//! [`JournalId`] from its [`Recorder`]. A recorded call on such an object
//! captures its input, each side effect it performs and its output into a
//! [`JournalEntry`]; entries are kept by a [`JournalKeeper`]. Replaying an
//! entry against a freshly built object with the same identity re-runs the
//! call with the recorded side effect results substituted.

pub mod context;
pub mod entry;
pub mod error;
pub mod file;
pub mod id;
pub mod keeper;
pub mod registry;

pub use context::{FiberContext, Journal, JournalMode};
pub use entry::{JournalEntry, SideEffect};
pub use error::JournalError;
pub use file::{FileJournal, IntegrityReport, SyncMode};
pub use id::{JournalId, Recorder};
pub use keeper::{JournalKeeper, MemoryJournal};
pub use registry::{RecorderRegistry, RECORDER_TYPE};

agency_serialization::impl_snapshot_via_serde!(JournalId);

#[cfg(test)]
mod tests {
    use super::*;
    use agency_serialization::{Externalizer, Graph, Serializer, Tree, TreeCodec, Value};
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_registered_recorder_is_externalized() {
        let keeper = MemoryJournal::new();
        let id = JournalId::new(vec![3, 1]);
        keeper.register(&id);

        let mut externalizer = Externalizer::new();
        let ext = keeper.identify(&id).unwrap();
        externalizer.add(ext.clone());

        let mut graph = Graph::new();
        let node = graph.add(Value::External(ext.clone()));
        let root = graph.list(vec![node]);
        let tree = Serializer::new(TreeCodec)
            .with_externalizer(externalizer)
            .convert(&graph, root)
            .unwrap();
        assert_eq!(tree, Tree::List(vec![Tree::External(ext)]));

        keeper.clear_registry();
        assert!(keeper.identify(&id).is_none());
    }

    proptest! {
        #[test]
        fn prop_recorder_ids_unique_and_parented(spawns in proptest::collection::vec(0usize..4, 1..40)) {
            let mut recorders = vec![Recorder::root(vec![9])];
            let mut seen = HashSet::new();
            for pick in spawns {
                let index = pick % recorders.len();
                let parent = recorders[index].journal_id().clone();
                let child = recorders[index].spawn_child();
                prop_assert_eq!(child.journal_id().parent(), Some(parent));
                prop_assert!(seen.insert(child.journal_id().clone()));
                recorders.push(child);
            }
        }
    }
}
