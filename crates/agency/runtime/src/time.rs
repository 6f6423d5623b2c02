//! Clocks and the delayed-call scheduler.
//!
//! Time is expressed in seconds as `f64`. The scheduler keeps due times in
//! whole microseconds so ordering is exact.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use agency_journal::FiberContext;
use agency_types::{AgentId, SessionId};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub trait Clock: Send + Sync {
    /// Seconds since the UNIX epoch, or since the clock's origin.
    fn now(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            micros: AtomicU64::new(to_micros(start)),
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.micros.fetch_add(to_micros(seconds), Ordering::SeqCst);
    }

    pub fn set(&self, seconds: f64) {
        self.micros.store(to_micros(seconds), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        from_micros(self.micros.load(Ordering::SeqCst))
    }
}

/// Clock following tokio's time, so a paused runtime advances it.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: f64,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now())
    }

    pub fn starting_at(base: f64) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> f64 {
        self.base + self.origin.elapsed().as_secs_f64()
    }
}

fn to_micros(seconds: f64) -> u64 {
    if seconds <= 0.0 {
        0
    } else {
        (seconds * 1_000_000.0).round() as u64
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

/// Handle of a scheduled call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

agency_serialization::impl_snapshot_via_serde!(CallId);

/// A timeout addressed to one protocol of one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedCall {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    /// Lets the protocol tell a stale timeout from the live one.
    pub generation: u64,
    /// Fiber of the recorded call that armed the timeout, one level deeper.
    pub fiber: Option<FiberContext>,
}

/// What protocols see of time.
pub trait TimeSource: Send + Sync {
    fn get_time(&self) -> f64;
    fn call_later(&self, delay: f64, call: DelayedCall) -> CallId;
    /// Returns false when the call already fired or was cancelled.
    fn cancel(&self, id: CallId) -> bool;
    fn is_pending(&self, id: CallId) -> bool;
}

#[derive(Default)]
struct SchedulerState {
    next_id: u64,
    seq: u64,
    queue: BTreeMap<(u64, u64), (CallId, DelayedCall)>,
    index: HashMap<CallId, (u64, u64)>,
}

/// Delayed calls ordered by due time, then by scheduling order.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Removes and returns the earliest call that is due.
    pub fn pop_due(&self) -> Option<DelayedCall> {
        let now = to_micros(self.clock.now());
        let mut state = self.lock();
        let key = *state.queue.keys().next()?;
        if key.0 > now {
            return None;
        }
        let (id, call) = state.queue.remove(&key)?;
        state.index.remove(&id);
        Some(call)
    }

    /// Due time of the earliest pending call.
    pub fn next_due(&self) -> Option<f64> {
        self.lock()
            .queue
            .keys()
            .next()
            .map(|(due, _)| from_micros(*due))
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}

impl TimeSource for Scheduler {
    fn get_time(&self) -> f64 {
        self.clock.now()
    }

    fn call_later(&self, delay: f64, call: DelayedCall) -> CallId {
        let due = to_micros(self.clock.now() + delay.max(0.0));
        let mut state = self.lock();
        state.next_id += 1;
        state.seq += 1;
        let id = CallId(state.next_id);
        let key = (due, state.seq);
        debug!(
            call_id = %id,
            agent_id = %call.agent_id,
            session_id = %call.session_id,
            delay,
            "Delayed call scheduled"
        );
        state.queue.insert(key, (id, call));
        state.index.insert(id, key);
        id
    }

    fn cancel(&self, id: CallId) -> bool {
        let mut state = self.lock();
        match state.index.remove(&id) {
            Some(key) => state.queue.remove(&key).is_some(),
            None => false,
        }
    }

    fn is_pending(&self, id: CallId) -> bool {
        self.lock().index.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(session: &str) -> DelayedCall {
        DelayedCall {
            agent_id: AgentId::new("a"),
            session_id: SessionId::from(session),
            generation: 1,
            fiber: None,
        }
    }

    #[test]
    fn test_calls_fire_in_due_order() {
        let clock = Arc::new(ManualClock::new(100.0));
        let scheduler = Scheduler::new(clock.clone());
        scheduler.call_later(5.0, call("late"));
        scheduler.call_later(1.0, call("early"));
        scheduler.call_later(1.0, call("early-2"));

        assert_eq!(scheduler.next_due(), Some(101.0));
        assert!(scheduler.pop_due().is_none());

        clock.advance(1.0);
        assert_eq!(scheduler.pop_due().unwrap().session_id.as_str(), "early");
        assert_eq!(scheduler.pop_due().unwrap().session_id.as_str(), "early-2");
        assert!(scheduler.pop_due().is_none());

        clock.advance(10.0);
        assert_eq!(scheduler.pop_due().unwrap().session_id.as_str(), "late");
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let clock = Arc::new(ManualClock::new(0.0));
        let scheduler = Scheduler::new(clock.clone());
        let id = scheduler.call_later(1.0, call("s"));
        assert!(scheduler.is_pending(id));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(!scheduler.is_pending(id));
        clock.advance(2.0);
        assert!(scheduler.pop_due().is_none());
    }

    #[test]
    fn test_negative_delay_is_due_now() {
        let clock = Arc::new(ManualClock::new(50.0));
        let scheduler = Scheduler::new(clock);
        scheduler.call_later(-3.0, call("now"));
        assert!(scheduler.pop_due().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(1000.0);
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert!((clock.now() - 1030.0).abs() < 1e-3);
    }
}
