//! Contractor side of a contract.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use agency_types::{ContractState, Message, Payload, PayloadKind, ProtocolType, Recipient, SessionId};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::contracts::ContractorTimeouts;
use crate::machine::{StateMachine, Transition};
use crate::protocol::{
    AgencyProtocol, InterestFactory, ProtocolContext, ProtocolCore, ProtocolFailure,
    ProtocolResult,
};
use crate::time::CallId;

/// Behaviour of a contractor. Every hook but `announced` is optional.
///
/// Whatever path a contract takes, the contractor's own protocol result is
/// `Null`; the outcome is told to the hooks.
pub trait Contractor: Send + 'static {
    /// An announcement arrived. Expected to bid, refuse or hand over.
    fn announced(&mut self, contractor: &mut ContractorMedium, announcement: &Message);

    /// The announcement expired before bidding or refusing.
    fn announce_expired(&mut self, _contractor: &mut ContractorMedium) {}

    /// The bid expired without a grant or a rejection.
    fn bid_expired(&mut self, _contractor: &mut ContractorMedium) {}

    fn rejected(&mut self, _contractor: &mut ContractorMedium, _rejection: &Message) {}

    /// The bid was granted. Expected to eventually
    /// [`complete`](ContractorMedium::complete) or
    /// [`defect`](ContractorMedium::defect).
    fn granted(&mut self, _contractor: &mut ContractorMedium, _grant: &Message) {}

    /// A periodic progress report requested by the grant was sent.
    fn reported(&mut self, _contractor: &mut ContractorMedium, _report: &Message) {}

    fn cancelled(&mut self, _contractor: &mut ContractorMedium, _cancellation: &Message) {}

    fn acknowledged(&mut self, _contractor: &mut ContractorMedium, _ack: &Message) {}

    /// The job was cancelled after completion, or the report was never
    /// acknowledged.
    fn aborted(&mut self, _contractor: &mut ContractorMedium) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ContractorTimeout {
    Announce,
    Bid,
    Grant,
    Report,
}

/// Periodic progress reports requested by the grant.
#[derive(Debug, Clone, Copy)]
struct Reporter {
    frequency: f64,
    call: CallId,
    generation: u64,
}

#[derive(Debug)]
enum ContractorEvent {
    Announced(Message),
    AnnounceExpired,
    BidExpired,
    Rejected(Message),
    Granted(Message),
    Reported(Message),
    Cancelled(Message),
    Acknowledged(Message),
    Aborted,
}

const ON_ANNOUNCEMENT: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Initiated],
    after: ContractState::Announced,
}];

const ON_REJECTION: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Bid],
    after: ContractState::Rejected,
}];

const ON_GRANT: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Bid],
    after: ContractState::Granted,
}];

const ON_CANCELLATION: &[Transition<ContractState>] = &[
    Transition {
        before: &[ContractState::Granted],
        after: ContractState::Cancelled,
    },
    Transition {
        before: &[ContractState::Completed],
        after: ContractState::Aborted,
    },
];

const ON_ACKNOWLEDGEMENT: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Completed],
    after: ContractState::Acknowledged,
}];

/// The contractor's view of its contract, handed to every [`Contractor`]
/// hook.
#[derive(Debug)]
pub struct ContractorMedium {
    core: ProtocolCore,
    machine: StateMachine<ContractState, ContractorTimeout>,
    timeouts: ContractorTimeouts,
    manager: Option<Recipient>,
    remote_id: Option<SessionId>,
    announcement: Option<Message>,
    bid: Option<Message>,
    grant: Option<Message>,
    report: Option<Message>,
    reporter: Option<Reporter>,
    events: VecDeque<ContractorEvent>,
}

impl ContractorMedium {
    pub fn core(&self) -> &ProtocolCore {
        &self.core
    }

    pub fn state(&self) -> ContractState {
        self.machine.state()
    }

    pub fn announcement(&self) -> Option<&Message> {
        self.announcement.as_ref()
    }

    /// The bid as sent.
    pub fn placed_bid(&self) -> Option<&Message> {
        self.bid.as_ref()
    }

    pub fn grant_message(&self) -> Option<&Message> {
        self.grant.as_ref()
    }

    pub fn final_report(&self) -> Option<&Message> {
        self.report.as_ref()
    }

    /// Where replies to the manager go. A grant may move it.
    pub fn manager_address(&self) -> Option<&Recipient> {
        self.manager.as_ref()
    }

    pub fn update_manager_address(&mut self, recipient: Recipient) {
        if self.manager.as_ref() != Some(&recipient) {
            debug!(
                session_id = %self.core.session_id(),
                manager = %recipient,
                "Updating manager address"
            );
            self.manager = Some(recipient);
        }
    }

    fn send_to_manager(&self, msg: Message, expiration: Option<f64>) -> Message {
        let recipients: Vec<Recipient> = self.manager.iter().cloned().collect();
        self.core
            .send(&recipients, msg, self.remote_id.as_ref(), expiration)
    }

    pub fn bid(&mut self, bid: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[ContractState::Announced], "bid") {
            return None;
        }
        self.machine.set_state(ContractState::Bid);
        let expiration = self.core.get_time() + self.timeouts.bid;
        let sent = self.send_to_manager(bid.duplicate(), Some(expiration));
        self.machine.set_timeout(
            self.core.medium(),
            self.core.session_id(),
            expiration,
            Some(ContractState::Expired),
            ContractorTimeout::Bid,
        );
        self.bid = Some(sent.clone());
        Some(sent)
    }

    /// Passes the announcement on as a bid that keeps its own reply
    /// address, so the answer reaches whoever the bid was delegated to.
    /// The contractor is done afterwards.
    pub fn handover(&mut self, bid: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[ContractState::Announced], "handover") {
            return None;
        }
        self.machine.set_state(ContractState::Delegated);
        let recipients: Vec<Recipient> = self.manager.iter().cloned().collect();
        let sent = self.core.handover(
            &recipients,
            bid.duplicate_for_handover(),
            self.remote_id.as_ref(),
            None,
        );
        self.finish(Ok(Value::Null));
        Some(sent)
    }

    pub fn refuse(&mut self, refusal: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[ContractState::Announced], "refuse") {
            return None;
        }
        self.machine.set_state(ContractState::Refused);
        let sent = self.send_to_manager(refusal.duplicate(), None);
        self.finish(Ok(Value::Null));
        Some(sent)
    }

    /// Walks away from a granted job.
    pub fn defect(&mut self, cancellation: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[ContractState::Granted], "defect") {
            return None;
        }
        self.machine.set_state(ContractState::Defected);
        let sent = self.send_to_manager(cancellation.duplicate(), None);
        self.finish(Ok(Value::Null));
        Some(sent)
    }

    /// Sends the final report and waits for its acknowledgement.
    pub fn complete(&mut self, report: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[ContractState::Granted], "complete") {
            return None;
        }
        self.cancel_reporter();
        self.machine.set_state(ContractState::Completed);
        let expiration = self.core.get_time() + self.timeouts.bid;
        let sent = self.send_to_manager(report.duplicate(), Some(expiration));
        self.machine.set_timeout(
            self.core.medium(),
            self.core.session_id(),
            expiration,
            Some(ContractState::Aborted),
            ContractorTimeout::Report,
        );
        self.report = Some(sent.clone());
        Some(sent)
    }

    /// Sends a progress report without changing state.
    pub fn update(&mut self, report: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[ContractState::Granted], "update") {
            return None;
        }
        Some(self.send_to_manager(report.duplicate(), None))
    }

    fn finish(&mut self, result: ProtocolResult) -> bool {
        self.machine.cancel_timeout(self.core.medium());
        self.cancel_reporter();
        self.core.finish(result)
    }

    fn start_reporter(&mut self) {
        let Some(frequency) = self.grant.as_ref().and_then(Message::update_report_frequency) else {
            return;
        };
        if frequency <= 0.0 || self.core.is_finished() || self.state() != ContractState::Granted {
            return;
        }
        debug!(
            session_id = %self.core.session_id(),
            frequency,
            "Starting periodic reporter"
        );
        self.schedule_report(frequency);
    }

    fn schedule_report(&mut self, frequency: f64) {
        let generation = self.machine.next_generation();
        let call = self
            .core
            .medium()
            .call_later(frequency, self.core.session_id(), generation);
        self.reporter = Some(Reporter {
            frequency,
            call,
            generation,
        });
    }

    fn cancel_reporter(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            debug!(session_id = %self.core.session_id(), "Cancelling periodic reporter");
            self.core.medium().cancel_delayed_call(reporter.call);
        }
    }

    /// Sends the next progress report if `generation` is the reporter's
    /// timer. Returns false for any other timer.
    fn on_report_due(&mut self, generation: u64) -> bool {
        let Some(reporter) = self.reporter else {
            return false;
        };
        if reporter.generation != generation {
            return false;
        }
        self.reporter = None;
        if let Some(sent) = self.update(Message::update_report(Value::Null)) {
            self.schedule_report(reporter.frequency);
            self.events.push_back(ContractorEvent::Reported(sent));
        }
        true
    }

    fn expire_at(&mut self, at: Option<f64>, fallback: ContractState, action: ContractorTimeout) {
        let at = match at {
            Some(at) => at,
            None => self.core.get_time() + self.timeouts.bid,
        };
        self.machine.set_timeout(
            self.core.medium(),
            self.core.session_id(),
            at,
            Some(fallback),
            action,
        );
    }

    fn on_announce(&mut self, announcement: Message) {
        self.manager = announcement.reply_to.clone();
        self.remote_id = announcement.sender_id.clone();
        self.expire_at(
            announcement.expiration_time,
            ContractState::Closed,
            ContractorTimeout::Announce,
        );
        self.announcement = Some(announcement.clone());
        self.events
            .push_back(ContractorEvent::Announced(announcement));
    }

    fn on_grant(&mut self, grant: Message) {
        let bid_index = match &grant.payload {
            Payload::Grant { bid_index, .. } => *bid_index,
            _ => 0,
        };
        let bids_sent = usize::from(self.bid.is_some());
        if bid_index >= bids_sent {
            error!(
                session_id = %self.core.session_id(),
                bid_index,
                bids_sent,
                "The bid granted doesn't match the one put upon, terminating"
            );
            self.machine.set_state(ContractState::Wtf);
            self.finish(Ok(Value::Null));
            return;
        }
        if let Some(recipient) = grant.reply_to.clone() {
            self.update_manager_address(recipient);
        }
        if grant.sender_id.is_some() {
            self.remote_id = grant.sender_id.clone();
        }
        self.expire_at(
            grant.expiration_time,
            ContractState::Aborted,
            ContractorTimeout::Grant,
        );
        self.grant = Some(grant.clone());
        self.events.push_back(ContractorEvent::Granted(grant));
    }
}

/// Contract-net interested party: drives a [`Contractor`] through one
/// announcement.
pub struct AgencyContractor {
    medium: ContractorMedium,
    contractor: Box<dyn Contractor>,
}

impl AgencyContractor {
    pub fn medium(&self) -> &ContractorMedium {
        &self.medium
    }

    pub fn state(&self) -> ContractState {
        self.medium.state()
    }

    fn drain(&mut self) {
        while let Some(event) = self.medium.events.pop_front() {
            if self.medium.core.is_finished() {
                self.medium.events.clear();
                break;
            }
            let terminal = match event {
                ContractorEvent::Announced(msg) => {
                    self.contractor.announced(&mut self.medium, &msg);
                    false
                }
                ContractorEvent::Granted(msg) => {
                    self.contractor.granted(&mut self.medium, &msg);
                    self.medium.start_reporter();
                    false
                }
                ContractorEvent::Reported(msg) => {
                    self.contractor.reported(&mut self.medium, &msg);
                    false
                }
                ContractorEvent::AnnounceExpired => {
                    self.contractor.announce_expired(&mut self.medium);
                    true
                }
                ContractorEvent::BidExpired => {
                    self.contractor.bid_expired(&mut self.medium);
                    true
                }
                ContractorEvent::Rejected(msg) => {
                    self.contractor.rejected(&mut self.medium, &msg);
                    true
                }
                ContractorEvent::Cancelled(msg) => {
                    self.contractor.cancelled(&mut self.medium, &msg);
                    true
                }
                ContractorEvent::Acknowledged(msg) => {
                    self.contractor.acknowledged(&mut self.medium, &msg);
                    true
                }
                ContractorEvent::Aborted => {
                    self.contractor.aborted(&mut self.medium);
                    true
                }
            };
            if terminal {
                self.medium.finish(Ok(Value::Null));
            }
        }
    }

    fn on_timeout_action(&mut self, action: ContractorTimeout) {
        let event = match action {
            ContractorTimeout::Announce => ContractorEvent::AnnounceExpired,
            ContractorTimeout::Bid => ContractorEvent::BidExpired,
            ContractorTimeout::Grant | ContractorTimeout::Report => ContractorEvent::Aborted,
        };
        self.medium.events.push_back(event);
        self.drain();
    }
}

impl std::fmt::Debug for AgencyContractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgencyContractor")
            .field("medium", &self.medium)
            .finish_non_exhaustive()
    }
}

impl AgencyProtocol for AgencyContractor {
    fn core(&self) -> &ProtocolCore {
        &self.medium.core
    }

    fn core_mut(&mut self) -> &mut ProtocolCore {
        &mut self.medium.core
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.medium.state()).to_lowercase()
    }

    fn initiate(&mut self) {
        self.medium.machine.set_state(ContractState::Initiated);
    }

    fn on_message(&mut self, msg: Message) {
        let kind = msg.kind();
        let transitions = match kind {
            PayloadKind::Announcement => ON_ANNOUNCEMENT,
            PayloadKind::Rejection => ON_REJECTION,
            PayloadKind::Grant => ON_GRANT,
            PayloadKind::Cancellation => ON_CANCELLATION,
            PayloadKind::Acknowledgement => ON_ACKNOWLEDGEMENT,
            other => {
                warn!(
                    session_id = %self.medium.core.session_id(),
                    kind = %other,
                    "Contractor received unexpected message, ignoring"
                );
                return;
            }
        };
        let before = self.medium.state();
        if !self.medium.machine.apply(kind.name(), transitions) {
            return;
        }
        match kind {
            PayloadKind::Announcement => self.medium.on_announce(msg),
            PayloadKind::Grant => self.medium.on_grant(msg),
            PayloadKind::Rejection => {
                self.medium.machine.cancel_timeout(self.medium.core.medium());
                self.medium.events.push_back(ContractorEvent::Rejected(msg));
            }
            PayloadKind::Cancellation => {
                self.medium.machine.cancel_timeout(self.medium.core.medium());
                let event = if before == ContractState::Granted {
                    ContractorEvent::Cancelled(msg)
                } else {
                    ContractorEvent::Aborted
                };
                self.medium.events.push_back(event);
            }
            PayloadKind::Acknowledgement => {
                self.medium.machine.cancel_timeout(self.medium.core.medium());
                self.medium
                    .events
                    .push_back(ContractorEvent::Acknowledged(msg));
            }
            _ => {}
        }
        self.drain();
    }

    fn on_timeout(&mut self, generation: u64) {
        if self.medium.on_report_due(generation) {
            self.drain();
            return;
        }
        if let Some(action) = self.medium.machine.fire(generation) {
            self.on_timeout_action(action);
        }
    }

    fn expire_now(&mut self) -> bool {
        match self.medium.machine.expire_now(self.medium.core.medium()) {
            Some(action) => {
                self.on_timeout_action(action);
                true
            }
            None => false,
        }
    }

    fn abort(&mut self, failure: ProtocolFailure) {
        self.medium.finish(Err(failure));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

type BuildContractor = dyn Fn() -> Box<dyn Contractor> + Send + Sync;

/// Registers a [`Contractor`] implementation as an interest in a contract
/// protocol.
pub struct ContractorFactory {
    protocol_id: String,
    timeouts: ContractorTimeouts,
    build: Arc<BuildContractor>,
}

impl ContractorFactory {
    pub fn new<C, F>(protocol_id: impl Into<String>, build: F) -> Self
    where
        C: Contractor,
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            protocol_id: protocol_id.into(),
            timeouts: ContractorTimeouts::default(),
            build: Arc::new(move || Box::new(build()) as Box<dyn Contractor>),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ContractorTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl InterestFactory for ContractorFactory {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Contract
    }

    fn initiator(&self) -> PayloadKind {
        PayloadKind::Announcement
    }

    fn build(&self, ctx: ProtocolContext, _msg: &Message) -> Box<dyn AgencyProtocol> {
        Box::new(AgencyContractor {
            medium: ContractorMedium {
                core: ProtocolCore::new(ctx, self.protocol_id.clone()),
                machine: StateMachine::new(ContractState::Initiated),
                timeouts: self.timeouts,
                manager: None,
                remote_id: None,
                announcement: None,
                bid: None,
                grant: None,
                report: None,
                reporter: None,
                events: VecDeque::new(),
            },
            contractor: (self.build)(),
        })
    }
}
