//! Which recorders are live, tracked by epoch.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use agency_serialization::ExternalId;

use crate::id::JournalId;

/// Type name under which registered recorders are externalized.
pub const RECORDER_TYPE: &str = "recorder";

#[derive(Debug, Default)]
struct RegistryState {
    epoch: u64,
    ids: HashMap<JournalId, u64>,
}

/// Maps journal ids to the epoch they were registered in. Clearing starts
/// a new epoch and forgets every recorder of the previous one.
#[derive(Debug, Default)]
pub struct RecorderRegistry {
    state: Mutex<RegistryState>,
}

impl RecorderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id` in the current epoch and returns that epoch.
    pub fn register(&self, id: &JournalId) -> u64 {
        let mut state = self.lock();
        let epoch = state.epoch;
        state.ids.insert(id.clone(), epoch);
        epoch
    }

    pub fn unregister(&self, id: &JournalId) -> bool {
        self.lock().ids.remove(id).is_some()
    }

    pub fn epoch_of(&self, id: &JournalId) -> Option<u64> {
        self.lock().ids.get(id).copied()
    }

    pub fn contains(&self, id: &JournalId) -> bool {
        self.lock().ids.contains_key(id)
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// External identifier of a registered recorder.
    pub fn identify(&self, id: &JournalId) -> Option<ExternalId> {
        self.contains(id)
            .then(|| ExternalId::new(RECORDER_TYPE, id.to_string()))
    }

    /// Evicts every recorder and starts the next epoch.
    pub fn clear(&self) -> u64 {
        let mut state = self.lock();
        state.ids.clear();
        state.epoch += 1;
        state.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_starts_new_epoch() {
        let registry = RecorderRegistry::new();
        let a = JournalId::new(vec![1, 1]);
        assert_eq!(registry.register(&a), 0);
        assert_eq!(
            registry.identify(&a),
            Some(ExternalId::new(RECORDER_TYPE, "(1, 1)"))
        );

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.identify(&a), None);

        let b = JournalId::new(vec![1, 2]);
        assert_eq!(registry.register(&b), 1);
        assert_eq!(registry.epoch_of(&b), Some(1));
        assert!(registry.unregister(&b));
        assert!(!registry.contains(&b));
    }
}
