//! Exponential backoff around any initiator protocol.
//!
//! The retrying protocol never talks to other agents itself. Each attempt
//! asks the agent to start the inner protocol as its child, and the
//! child's result decides whether to finish or to schedule the next
//! attempt.

use std::any::Any;

use agency_types::{Message, ProtocolType, Recipient, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::machine::StateMachine;
use crate::medium::AgentCommand;
use crate::protocol::{
    AgencyProtocol, InitiatorFactory, ProtocolContext, ProtocolCore, ProtocolFailure,
    ProtocolResult,
};

pub const RETRIED_PREFIX: &str = "retried-";

/// Protocol id of the retrying wrapper around `inner`.
pub fn retried_protocol_id(inner: &str) -> String {
    format!("{RETRIED_PREFIX}{inner}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `None` retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    /// Cap of the doubling delay. `None` doubles without bound.
    #[serde(default)]
    pub max_delay: Option<f64>,
}

fn default_initial_delay() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: default_initial_delay(),
            max_delay: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay before the first retry, already within `max_delay`.
    pub fn first_delay(&self) -> f64 {
        match self.max_delay {
            Some(cap) => self.initial_delay.min(cap),
            None => self.initial_delay,
        }
    }

    /// Delay following `delay` after one more failure.
    pub fn next_delay(&self, delay: f64) -> f64 {
        let doubled = delay * 2.0;
        match self.max_delay {
            Some(cap) => doubled.min(cap),
            None => doubled,
        }
    }

    /// Arguments of a `retried-` protocol wrapping `args`.
    pub fn wrap_args(&self, args: Value) -> Value {
        json!({ "policy": self, "args": args })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStatus {
    pub attempt: u32,
    pub max_retries: Option<u32>,
    pub delay: f64,
    pub running_now: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RetryStage {
    Idle,
    Running,
    Waiting,
    Done,
}

#[derive(Debug)]
pub struct RetryingProtocol {
    core: ProtocolCore,
    machine: StateMachine<RetryStage, ()>,
    inner_id: String,
    recipients: Vec<Recipient>,
    args: Value,
    policy: RetryPolicy,
    attempt: u32,
    delay: f64,
    running: Option<SessionId>,
}

impl RetryingProtocol {
    pub fn inner_protocol_id(&self) -> &str {
        &self.inner_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next retry would wait.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn get_status(&self) -> RetryStatus {
        RetryStatus {
            attempt: self.attempt,
            max_retries: self.policy.max_retries,
            delay: self.delay,
            running_now: self.running.is_some(),
        }
    }

    /// Stops retrying. A scheduled retry is cancelled and the protocol
    /// fails right away; an attempt in flight is expired and its failure
    /// becomes final.
    pub fn give_up(&mut self) {
        if self.core.is_finished() {
            return;
        }
        info!(
            session_id = %self.core.session_id(),
            attempt = self.attempt,
            "Giving up retrying"
        );
        self.policy.max_retries = Some(self.attempt.saturating_sub(1));
        match self.machine.state() {
            RetryStage::Waiting => {
                self.machine.cancel_timeout(self.core.medium());
                self.machine.set_state(RetryStage::Done);
                self.core.finish(Err(ProtocolFailure::GaveUp {
                    attempts: self.attempt,
                }));
            }
            RetryStage::Running => {
                if let Some(child) = &self.running {
                    self.core.medium().push_command(AgentCommand::ExpireNow {
                        session_id: child.clone(),
                    });
                }
            }
            RetryStage::Idle | RetryStage::Done => {}
        }
    }

    fn start_attempt(&mut self) {
        self.attempt += 1;
        debug!(
            session_id = %self.core.session_id(),
            protocol_id = %self.inner_id,
            attempt = self.attempt,
            "Starting attempt"
        );
        self.machine.set_state(RetryStage::Running);
        self.core.medium().push_command(AgentCommand::Initiate {
            protocol_id: self.inner_id.clone(),
            recipients: self.recipients.clone(),
            args: self.args.clone(),
            parent: Some(self.core.session_id().clone()),
        });
    }

    fn exhausted(&self) -> bool {
        self.policy
            .max_retries
            .is_some_and(|max| self.attempt > max)
    }
}

impl AgencyProtocol for RetryingProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProtocolCore {
        &mut self.core
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.machine.state()).to_lowercase()
    }

    fn initiate(&mut self) {
        self.delay = self.policy.first_delay();
        self.start_attempt();
    }

    fn on_message(&mut self, msg: Message) {
        warn!(
            session_id = %self.core.session_id(),
            kind = %msg.kind(),
            "Retrying protocol does not take messages, ignoring"
        );
    }

    fn on_timeout(&mut self, generation: u64) {
        if self.machine.fire(generation).is_some() {
            self.start_attempt();
        }
    }

    fn expire_now(&mut self) -> bool {
        self.give_up();
        true
    }

    fn on_child_started(&mut self, child: &SessionId) {
        self.running = Some(child.clone());
    }

    fn on_child_finished(&mut self, child: &SessionId, result: &ProtocolResult) {
        if self.running.as_ref() != Some(child) || self.core.is_finished() {
            return;
        }
        self.running = None;
        match result {
            Ok(value) => {
                self.machine.set_state(RetryStage::Done);
                self.core.finish(Ok(value.clone()));
            }
            Err(failure) if self.exhausted() => {
                info!(
                    session_id = %self.core.session_id(),
                    attempts = self.attempt,
                    error = %failure,
                    "Out of retries"
                );
                self.machine.set_state(RetryStage::Done);
                self.core.finish(Err(failure.clone()));
            }
            Err(failure) => {
                debug!(
                    session_id = %self.core.session_id(),
                    attempt = self.attempt,
                    delay = self.delay,
                    error = %failure,
                    "Attempt failed, retrying later"
                );
                self.machine.set_state(RetryStage::Waiting);
                let at = self.core.get_time() + self.delay;
                self.machine.set_timeout(
                    self.core.medium(),
                    self.core.session_id(),
                    at,
                    None,
                    (),
                );
                self.delay = self.policy.next_delay(self.delay);
            }
        }
    }

    fn abort(&mut self, failure: ProtocolFailure) {
        self.machine.cancel_timeout(self.core.medium());
        self.machine.set_state(RetryStage::Done);
        self.core.finish(Err(failure));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Builds [`RetryingProtocol`]s around one inner initiator.
///
/// Arguments are `{"policy": RetryPolicy, "args": inner_args}`; a missing
/// policy falls back to the factory's default.
#[derive(Debug, Clone)]
pub struct RetryingFactory {
    inner_id: String,
    protocol_id: String,
    protocol_type: ProtocolType,
    default_policy: RetryPolicy,
}

impl RetryingFactory {
    pub fn new(inner_id: impl Into<String>, protocol_type: ProtocolType) -> Self {
        let inner_id = inner_id.into();
        Self {
            protocol_id: retried_protocol_id(&inner_id),
            inner_id,
            protocol_type,
            default_policy: RetryPolicy::default(),
        }
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }
}

impl InitiatorFactory for RetryingFactory {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn protocol_type(&self) -> ProtocolType {
        self.protocol_type
    }

    fn build(
        &self,
        ctx: ProtocolContext,
        recipients: Vec<Recipient>,
        args: Value,
    ) -> Box<dyn AgencyProtocol> {
        let policy = match args.get("policy") {
            Some(raw) => serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
                warn!(error = %e, "Invalid retry policy, using the default");
                self.default_policy.clone()
            }),
            None => self.default_policy.clone(),
        };
        let inner_args = args.get("args").cloned().unwrap_or(Value::Null);
        Box::new(RetryingProtocol {
            core: ProtocolCore::new(ctx, self.protocol_id.clone()),
            machine: StateMachine::new(RetryStage::Idle),
            inner_id: self.inner_id.clone(),
            recipients,
            args: inner_args,
            delay: policy.first_delay(),
            policy,
            attempt: 0,
            running: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retried_protocol_id() {
        assert_eq!(retried_protocol_id("ping"), "retried-ping");
    }

    #[test]
    fn test_policy_wraps_args() {
        let policy = RetryPolicy {
            max_retries: Some(2),
            ..RetryPolicy::default()
        };
        let wrapped = policy.wrap_args(json!({"n": 1}));
        assert_eq!(wrapped["args"], json!({"n": 1}));
        let back: RetryPolicy = serde_json::from_value(wrapped["policy"].clone()).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            initial_delay: 0.5,
            max_delay: Some(4.0),
            max_retries: Some(7),
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.initial_delay, 0.5);
        assert_eq!(policy.max_delay, Some(4.0));
        assert_eq!(policy.max_retries, Some(7));
    }

    #[test]
    fn test_first_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: None,
            initial_delay: 5.0,
            max_delay: Some(2.0),
        };
        assert_eq!(policy.first_delay(), 2.0);
        assert_eq!(policy.next_delay(policy.first_delay()), 2.0);
        assert_eq!(RetryPolicy::default().first_delay(), 1.0);
    }

    proptest! {
        #[test]
        fn prop_delay_follows_doubling_law(
            initial in 0.01f64..10.0,
            cap in proptest::option::of(0.01f64..100.0),
            failures in 1u32..12,
        ) {
            let policy = RetryPolicy { max_retries: None, initial_delay: initial, max_delay: cap };
            let mut delay = policy.first_delay();
            for k in 1..=failures {
                let expected = initial * 2f64.powi(k as i32 - 1);
                let expected = match cap {
                    Some(cap) => expected.min(cap),
                    None => expected,
                };
                prop_assert!((delay - expected).abs() <= expected * 1e-9);
                delay = policy.next_delay(delay);
            }
        }
    }
}
