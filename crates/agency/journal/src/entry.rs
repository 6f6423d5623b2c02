use agency_serialization::Tree;
use serde::{Deserialize, Serialize};

use crate::id::JournalId;

/// One side effect performed inside a recorded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub function_id: String,
    pub args: Tree,
    pub result: Tree,
}

/// Everything needed to re-execute one recorded call: the identity of the
/// object it ran on, its input, the side effects it performed in order,
/// and the output it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub agent_id: String,
    pub instance_id: JournalId,
    pub entry_id: String,
    pub fiber_id: String,
    pub fiber_depth: u32,
    pub input: Tree,
    pub side_effects: Vec<SideEffect>,
    pub output: Tree,
}

impl JournalEntry {
    pub fn function_ids(&self) -> impl Iterator<Item = &str> {
        self.side_effects.iter().map(|e| e.function_id.as_str())
    }
}
