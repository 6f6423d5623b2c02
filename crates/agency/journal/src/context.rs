//! The recording context of one agent.
//!
//! Every recorded call runs between [`Journal::begin`] and
//! [`Journal::finish`]. Side effects performed in between go through
//! [`Journal::side_effect`], which either runs and records them or, while
//! replaying, substitutes the recorded result without running them.

use std::collections::VecDeque;
use std::sync::Arc;

use agency_serialization::{freeze, thaw, Registry, Restore, Snapshot, Tree};
use tracing::{debug, warn};

use crate::entry::{JournalEntry, SideEffect};
use crate::error::JournalError;
use crate::id::JournalId;
use crate::keeper::JournalKeeper;

/// Logical call chain a recorded call belongs to. Timers armed inside a
/// call continue its fiber one level deeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiberContext {
    pub fiber_id: String,
    pub depth: u32,
}

impl FiberContext {
    pub fn new() -> Self {
        Self {
            fiber_id: uuid::Uuid::new_v4().to_string(),
            depth: 0,
        }
    }

    pub fn nested(&self) -> Self {
        Self {
            fiber_id: self.fiber_id.clone(),
            depth: self.depth + 1,
        }
    }
}

impl Default for FiberContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Off,
    Recording,
    Replaying,
}

struct ReplayCursor {
    effects: VecDeque<SideEffect>,
    output: Tree,
}

struct ActiveCall {
    entry: JournalEntry,
    recording: bool,
    replay: Option<ReplayCursor>,
}

pub struct Journal {
    agent_id: String,
    recording: bool,
    keeper: Option<Arc<dyn JournalKeeper>>,
    registry: Registry,
    active: Option<ActiveCall>,
    pending_replay: Option<JournalEntry>,
    poison: Option<JournalError>,
}

impl Journal {
    /// A journal that records every call into `keeper`.
    pub fn recording(agent_id: impl Into<String>, keeper: Arc<dyn JournalKeeper>) -> Self {
        Self {
            agent_id: agent_id.into(),
            recording: true,
            keeper: Some(keeper),
            registry: Registry::permissive(),
            active: None,
            pending_replay: None,
            poison: None,
        }
    }

    /// A journal that only tracks fibers and never records.
    pub fn off(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            recording: false,
            keeper: None,
            registry: Registry::permissive(),
            active: None,
            pending_replay: None,
            poison: None,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn mode(&self) -> JournalMode {
        let replaying = self.pending_replay.is_some()
            || self.active.as_ref().is_some_and(|call| call.replay.is_some());
        if replaying {
            JournalMode::Replaying
        } else if self.recording {
            JournalMode::Recording
        } else {
            JournalMode::Off
        }
    }

    pub fn keeper(&self) -> Option<&Arc<dyn JournalKeeper>> {
        self.keeper.as_ref()
    }

    pub fn in_call(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_fiber(&self) -> Option<FiberContext> {
        self.active.as_ref().map(|call| FiberContext {
            fiber_id: call.entry.fiber_id.clone(),
            depth: call.entry.fiber_depth,
        })
    }

    /// Arms the next [`begin`](Self::begin) to re-execute `entry`.
    pub fn begin_replay(&mut self, entry: JournalEntry) {
        self.pending_replay = Some(entry);
    }

    pub fn begin<I: Snapshot + ?Sized>(
        &mut self,
        instance_id: &JournalId,
        entry_id: &str,
        input: &I,
        fiber: Option<FiberContext>,
    ) -> Result<(), JournalError> {
        if let Some(active) = &self.active {
            return Err(JournalError::ReentrantCall {
                entry_id: entry_id.to_string(),
                active: active.entry.entry_id.clone(),
            });
        }
        self.poison = None;

        if let Some(recorded) = self.pending_replay.take() {
            let replay_error = |reason: String| JournalError::Replay {
                instance_id: instance_id.clone(),
                reason,
            };
            if &recorded.instance_id != instance_id {
                return Err(replay_error(format!(
                    "entry recorded for {}",
                    recorded.instance_id
                )));
            }
            if recorded.entry_id != entry_id {
                return Err(replay_error(format!(
                    "expected call {}, got {}",
                    recorded.entry_id, entry_id
                )));
            }
            if freeze(input)? != recorded.input {
                return Err(replay_error(format!("input of {entry_id} differs")));
            }
            debug!(
                instance_id = %instance_id,
                entry_id,
                side_effects = recorded.side_effects.len(),
                "Replaying recorded call"
            );
            let cursor = ReplayCursor {
                effects: recorded.side_effects.iter().cloned().collect(),
                output: recorded.output.clone(),
            };
            self.active = Some(ActiveCall {
                entry: recorded,
                recording: false,
                replay: Some(cursor),
            });
            return Ok(());
        }

        let fiber = fiber.unwrap_or_default();
        let input = if self.recording {
            freeze(input)?
        } else {
            Tree::None
        };
        self.active = Some(ActiveCall {
            entry: JournalEntry {
                agent_id: self.agent_id.clone(),
                instance_id: instance_id.clone(),
                entry_id: entry_id.to_string(),
                fiber_id: fiber.fiber_id,
                fiber_depth: fiber.depth,
                input,
                side_effects: Vec::new(),
                output: Tree::None,
            },
            recording: self.recording,
            replay: None,
        });
        Ok(())
    }

    /// Runs `perform` as a side effect of the current call.
    ///
    /// While replaying, `perform` is not run and the recorded result is
    /// returned instead. A replay mismatch poisons the call: the default
    /// value is returned and [`finish`](Self::finish) reports the error.
    pub fn side_effect<A, R, F>(&mut self, function_id: &str, args: &A, perform: F) -> R
    where
        A: Snapshot + ?Sized,
        R: Snapshot + Restore + Default,
        F: FnOnce() -> R,
    {
        let Some(call) = self.active.as_mut() else {
            return perform();
        };

        if let Some(cursor) = call.replay.as_mut() {
            let outcome = match cursor.effects.pop_front() {
                None => Err(format!("unexpected side effect {function_id}")),
                Some(effect) if effect.function_id != function_id => Err(format!(
                    "expected side effect {}, got {}",
                    effect.function_id, function_id
                )),
                Some(effect) => match freeze(args) {
                    Ok(tree) if tree == effect.args => {
                        thaw::<R>(&effect.result, &self.registry).map_err(|e| e.to_string())
                    }
                    Ok(_) => Err(format!("arguments of {function_id} differ")),
                    Err(e) => Err(e.to_string()),
                },
            };
            return match outcome {
                Ok(result) => result,
                Err(reason) => {
                    self.poison_with(reason);
                    R::default()
                }
            };
        }

        let result = perform();
        if call.recording {
            match (freeze(args), freeze(&result)) {
                (Ok(args), Ok(tree)) => call.entry.side_effects.push(SideEffect {
                    function_id: function_id.to_string(),
                    args,
                    result: tree,
                }),
                (Err(e), _) | (_, Err(e)) => {
                    self.poison = self.poison.take().or(Some(JournalError::Serialization(e)))
                }
            }
        }
        result
    }

    /// Closes the current call. Returns the written entry when recording.
    pub fn finish<O: Snapshot + ?Sized>(
        &mut self,
        output: &O,
    ) -> Result<Option<JournalEntry>, JournalError> {
        let call = self.active.take().ok_or(JournalError::NotInCall)?;
        if let Some(err) = self.poison.take() {
            return Err(err);
        }

        let instance_id = call.entry.instance_id.clone();
        if let Some(cursor) = call.replay {
            if !cursor.effects.is_empty() {
                return Err(JournalError::Replay {
                    instance_id,
                    reason: format!("{} recorded side effects not consumed", cursor.effects.len()),
                });
            }
            if freeze(output)? != cursor.output {
                return Err(JournalError::Replay {
                    instance_id,
                    reason: format!("output of {} differs", call.entry.entry_id),
                });
            }
            return Ok(None);
        }

        if !call.recording {
            return Ok(None);
        }
        let mut entry = call.entry;
        entry.output = freeze(output)?;
        if let Some(keeper) = &self.keeper {
            keeper.write_entry(&entry)?;
        }
        Ok(Some(entry))
    }

    /// Drops the current call without writing it.
    pub fn abort(&mut self) -> Option<JournalError> {
        if let Some(call) = self.active.take() {
            warn!(
                instance_id = %call.entry.instance_id,
                entry_id = %call.entry.entry_id,
                "Recorded call aborted"
            );
        }
        self.pending_replay = None;
        self.poison.take()
    }

    fn poison_with(&mut self, reason: String) {
        if self.poison.is_some() {
            return;
        }
        let instance_id = self
            .active
            .as_ref()
            .map(|call| call.entry.instance_id.clone())
            .unwrap_or_default();
        warn!(instance_id = %instance_id, reason = %reason, "Replay diverged");
        self.poison = Some(JournalError::Replay {
            instance_id,
            reason,
        });
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("agent_id", &self.agent_id)
            .field("mode", &self.mode())
            .field("in_call", &self.in_call())
            .finish()
    }
}
