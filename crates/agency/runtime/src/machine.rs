//! State machine component shared by every protocol role.
//!
//! A role holds one `StateMachine` with its closed state set `S` and the
//! set `A` of actions its timeouts can trigger. At most one timeout is
//! pending at a time; arming a new one cancels the previous.

use std::fmt::Debug;

use agency_types::SessionId;
use tracing::{debug, warn};

use crate::medium::AgentMedium;
use crate::time::CallId;

/// One legal transition: from any state in `before` to `after`.
#[derive(Debug, Clone, Copy)]
pub struct Transition<S: 'static> {
    pub before: &'static [S],
    pub after: S,
}

#[derive(Debug, Clone)]
struct PendingTimeout<S, A> {
    call: CallId,
    generation: u64,
    fallback: Option<S>,
    action: A,
}

#[derive(Debug)]
pub struct StateMachine<S, A> {
    state: S,
    timeout: Option<PendingTimeout<S, A>>,
    generation: u64,
}

impl<S, A> StateMachine<S, A>
where
    S: Copy + PartialEq + Debug + 'static,
    A: Debug,
{
    pub fn new(state: S) -> Self {
        Self {
            state,
            timeout: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn set_state(&mut self, state: S) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Changing state");
            self.state = state;
        }
    }

    pub fn is_in(&self, allowed: &[S]) -> bool {
        allowed.contains(&self.state)
    }

    /// Whether the current state allows `operation`. Logs when it does not;
    /// the caller then skips the operation.
    pub fn ensure_state(&self, allowed: &[S], operation: &str) -> bool {
        if self.is_in(allowed) {
            return true;
        }
        warn!(
            operation,
            state = ?self.state,
            expected = ?allowed,
            "Operation not allowed in current state, ignoring"
        );
        false
    }

    /// Applies the first transition whose `before` set holds the current
    /// state. Logs and returns false when none does.
    pub fn apply(&mut self, event: &str, transitions: &[Transition<S>]) -> bool {
        match transitions.iter().find(|t| t.before.contains(&self.state)) {
            Some(transition) => {
                self.set_state(transition.after);
                true
            }
            None => {
                warn!(
                    event,
                    state = ?self.state,
                    "Received event in unexpected state, ignoring"
                );
                false
            }
        }
    }

    /// Arms a timeout firing `action` at absolute time `at`. When it fires
    /// the state is first forced to `fallback`, if given.
    pub fn set_timeout(
        &mut self,
        medium: &AgentMedium,
        session_id: &SessionId,
        at: f64,
        fallback: Option<S>,
        action: A,
    ) {
        self.cancel_timeout(medium);
        self.generation += 1;
        let delay = at - medium.get_time();
        let call = medium.call_later(delay, session_id, self.generation);
        self.timeout = Some(PendingTimeout {
            call,
            generation: self.generation,
            fallback,
            action,
        });
    }

    /// Reserves a generation for a timer the role schedules itself, so it
    /// can never be taken for the machine's own timeout.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn cancel_timeout(&mut self, medium: &AgentMedium) {
        if let Some(timeout) = self.timeout.take() {
            medium.cancel_delayed_call(timeout.call);
        }
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some()
    }

    /// Consumes the timeout armed as `generation`. Stale generations
    /// return `None`.
    pub fn fire(&mut self, generation: u64) -> Option<A> {
        match &self.timeout {
            Some(pending) if pending.generation == generation => {}
            _ => {
                debug!(generation, "Ignoring stale timeout");
                return None;
            }
        }
        let pending = self.timeout.take()?;
        if let Some(fallback) = pending.fallback {
            self.set_state(fallback);
        }
        Some(pending.action)
    }

    /// Fires the pending timeout now instead of at its due time.
    pub fn expire_now(&mut self, medium: &AgentMedium) -> Option<A> {
        let pending = self.timeout.take()?;
        medium.cancel_delayed_call(pending.call);
        if let Some(fallback) = pending.fallback {
            self.set_state(fallback);
        }
        Some(pending.action)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use agency_journal::Journal;
    use agency_types::{AgentId, RequestState};

    use super::*;
    use crate::messaging::EmuMessaging;
    use crate::time::{ManualClock, Scheduler};

    const CLOSE: &[Transition<RequestState>] = &[
        Transition {
            before: &[RequestState::None],
            after: RequestState::Requested,
        },
        Transition {
            before: &[RequestState::None, RequestState::Requested],
            after: RequestState::Closed,
        },
    ];

    fn medium() -> (AgentMedium, Arc<Scheduler>) {
        let scheduler = Arc::new(Scheduler::new(Arc::new(ManualClock::new(0.0))));
        let medium = AgentMedium::new(
            AgentId::new("a"),
            "lobby",
            10.0,
            scheduler.clone(),
            Arc::new(EmuMessaging::new()),
            Journal::off("a"),
        );
        (medium, scheduler)
    }

    #[test]
    fn test_first_matching_transition_wins() {
        let mut machine: StateMachine<RequestState, ()> = StateMachine::new(RequestState::None);
        assert!(machine.apply("go", CLOSE));
        assert_eq!(machine.state(), RequestState::Requested);
        assert!(machine.apply("go", CLOSE));
        assert_eq!(machine.state(), RequestState::Closed);
        assert!(!machine.apply("go", CLOSE));
        assert_eq!(machine.state(), RequestState::Closed);
    }

    #[test]
    fn test_rearming_makes_old_timeout_stale() {
        let (medium, scheduler) = medium();
        let session = SessionId::from("s");
        let mut machine = StateMachine::new(RequestState::Requested);

        machine.set_timeout(&medium, &session, 5.0, None, "first");
        machine.set_timeout(&medium, &session, 8.0, Some(RequestState::Closed), "second");
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(machine.fire(1), None);
        assert_eq!(machine.state(), RequestState::Requested);
        assert_eq!(machine.fire(2), Some("second"));
        assert_eq!(machine.state(), RequestState::Closed);
        assert!(!machine.has_timeout());
    }

    #[test]
    fn test_expire_now_cancels_scheduled_call() {
        let (medium, scheduler) = medium();
        let mut machine = StateMachine::new(RequestState::Requested);
        machine.set_timeout(
            &medium,
            &SessionId::from("s"),
            5.0,
            Some(RequestState::Closed),
            (),
        );

        assert_eq!(machine.expire_now(&medium), Some(()));
        assert_eq!(machine.state(), RequestState::Closed);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(machine.expire_now(&medium), None);
    }
}
