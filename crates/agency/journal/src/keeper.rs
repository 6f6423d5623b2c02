use std::sync::{Mutex, PoisonError};

use agency_serialization::ExternalId;
use tracing::debug;

use crate::entry::JournalEntry;
use crate::error::JournalError;
use crate::id::JournalId;
use crate::registry::RecorderRegistry;

/// Storage for journal entries, plus the registry of the recorders whose
/// calls it keeps.
pub trait JournalKeeper: Send + Sync {
    fn write_entry(&self, entry: &JournalEntry) -> Result<(), JournalError>;

    /// All entries in write order.
    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError>;

    fn registry(&self) -> &RecorderRegistry;

    fn register(&self, id: &JournalId) -> u64 {
        self.registry().register(id)
    }

    fn identify(&self, id: &JournalId) -> Option<ExternalId> {
        self.registry().identify(id)
    }

    fn clear_registry(&self) -> u64 {
        self.registry().clear()
    }
}

/// Append-only in-memory keeper.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
    registry: RecorderRegistry,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries recorded for one instance, in write order.
    pub fn entries_for(&self, instance_id: &JournalId) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| &e.instance_id == instance_id)
            .cloned()
            .collect()
    }
}

impl JournalKeeper for MemoryJournal {
    fn write_entry(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        debug!(
            instance_id = %entry.instance_id,
            entry_id = %entry.entry_id,
            side_effects = entry.side_effects.len(),
            "Journal entry written"
        );
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn registry(&self) -> &RecorderRegistry {
        &self.registry
    }
}
