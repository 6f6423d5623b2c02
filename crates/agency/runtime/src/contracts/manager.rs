//! Manager side of a contract.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use agency_types::{
    ContractState, ContractorState, Message, Payload, PayloadKind, ProtocolType, Recipient,
    SessionId,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::contracts::ManagerTimeouts;
use crate::machine::{StateMachine, Transition};
use crate::protocol::{
    AgencyProtocol, InitiatorFactory, ProtocolContext, ProtocolCore, ProtocolFailure,
    ProtocolResult,
};

/// Behaviour of a manager. Every hook but `initiate` is optional.
///
/// Hooks act on the contract through the [`ManagerMedium`] they are
/// handed; operations invalid in the current state are logged and ignored.
pub trait Manager: Send + 'static {
    /// Called once when the contract starts. Expected to
    /// [`announce`](ManagerMedium::announce).
    fn initiate(&mut self, manager: &mut ManagerMedium, args: &Value);

    fn bid(&mut self, _manager: &mut ManagerMedium, _bid: &Message) {}

    /// The announce window closed with at least one bid.
    fn closed(&mut self, _manager: &mut ManagerMedium) {}

    /// Nobody bid, or the bids expired before a grant.
    fn expired(&mut self, _manager: &mut ManagerMedium) {}

    fn cancelled(&mut self, _manager: &mut ManagerMedium, _reason: Option<&str>) {}

    /// Granted contractors did not report in time.
    fn aborted(&mut self, _manager: &mut ManagerMedium) {}

    fn update_report(&mut self, _manager: &mut ManagerMedium, _report: &Message) {}

    /// Every granted contractor reported. The return value is the result
    /// of the contract.
    fn completed(&mut self, _manager: &mut ManagerMedium, _reports: Vec<Message>) -> Value {
        Value::Null
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ManagerTimeout {
    Initiate,
    Announce,
    Close,
    Grant,
}

#[derive(Debug)]
enum ManagerEvent {
    Bid(Message),
    Closed,
    Expired,
    Cancelled {
        reason: Option<String>,
        failure: ProtocolFailure,
    },
    Aborted,
    UpdateReport(Message),
    Completed(Vec<Message>),
}

const IN_ANNOUNCED: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Announced],
    after: ContractState::Announced,
}];

const IN_GRANTED: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Granted],
    after: ContractState::Granted,
}];

const ON_CANCELLATION: &[Transition<ContractState>] = &[Transition {
    before: &[ContractState::Granted],
    after: ContractState::Cancelled,
}];

const TO_REJECTED: &[Transition<ContractorState>] = &[Transition {
    before: &[ContractorState::Bid, ContractorState::Elected],
    after: ContractorState::Rejected,
}];

const TO_GRANTED: &[Transition<ContractorState>] = &[Transition {
    before: &[ContractorState::Bid, ContractorState::Elected],
    after: ContractorState::Granted,
}];

const TO_ELECTED: &[Transition<ContractorState>] = &[Transition {
    before: &[ContractorState::Bid],
    after: ContractorState::Elected,
}];

const TO_COMPLETED: &[Transition<ContractorState>] = &[Transition {
    before: &[ContractorState::Granted],
    after: ContractorState::Completed,
}];

const TO_CANCELLED: &[Transition<ContractorState>] = &[Transition {
    before: &[ContractorState::Granted, ContractorState::Completed],
    after: ContractorState::Cancelled,
}];

const TO_ACKNOWLEDGED: &[Transition<ContractorState>] = &[Transition {
    before: &[ContractorState::Completed],
    after: ContractorState::Acknowledged,
}];

/// What a manager knows about one bidder.
#[derive(Debug)]
pub struct ManagerContractor {
    key: String,
    recipient: Recipient,
    remote_id: Option<SessionId>,
    bid: Option<Message>,
    report: Option<Message>,
    machine: StateMachine<ContractorState, ()>,
}

impl ManagerContractor {
    fn from_message(msg: &Message, recipient: Recipient, state: ContractorState) -> Self {
        Self {
            key: recipient.key.clone(),
            recipient,
            remote_id: msg.sender_id.clone(),
            bid: (state == ContractorState::Bid).then(|| msg.clone()),
            report: None,
            machine: StateMachine::new(state),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ContractorState {
        self.machine.state()
    }

    pub fn bid(&self) -> Option<&Message> {
        self.bid.as_ref()
    }

    pub fn report(&self) -> Option<&Message> {
        self.report.as_ref()
    }

    /// Applies `transitions` and, when one matched, sends `msg` to the
    /// bidder.
    fn on_event(
        &mut self,
        core: &ProtocolCore,
        event: &str,
        transitions: &[Transition<ContractorState>],
        msg: Message,
        expiration: Option<f64>,
    ) -> bool {
        if !self.machine.apply(event, transitions) {
            return false;
        }
        core.send(
            std::slice::from_ref(&self.recipient),
            msg,
            self.remote_id.as_ref(),
            expiration,
        );
        true
    }
}

/// Bidders of one contract in arrival order, keyed by their reply-to key.
#[derive(Debug, Default)]
pub struct ManagerContractors {
    items: Vec<ManagerContractor>,
}

impl ManagerContractors {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagerContractor> {
        self.items.iter()
    }

    pub fn get(&self, key: &str) -> Option<&ManagerContractor> {
        self.items.iter().find(|c| c.key == key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut ManagerContractor> {
        self.items.iter_mut().find(|c| c.key == key)
    }

    pub fn by_message(&self, msg: &Message) -> Option<&ManagerContractor> {
        msg.reply_to.as_ref().and_then(|r| self.get(&r.key))
    }

    fn by_message_mut(&mut self, msg: &Message) -> Option<&mut ManagerContractor> {
        let key = msg.reply_to.as_ref()?.key.clone();
        self.get_mut(&key)
    }

    pub fn with_state<'a>(
        &'a self,
        states: &'a [ContractorState],
    ) -> impl Iterator<Item = &'a ManagerContractor> + 'a {
        self.items.iter().filter(move |c| c.machine.is_in(states))
    }

    fn keys_with_state(&self, states: &[ContractorState]) -> Vec<String> {
        self.with_state(states).map(|c| c.key.clone()).collect()
    }

    pub fn get_bids(&self) -> Vec<Message> {
        self.items.iter().filter_map(|c| c.bid.clone()).collect()
    }

    /// Latest expiration among the bids received.
    pub fn get_expiration_time(&self) -> Option<f64> {
        self.items
            .iter()
            .filter_map(|c| c.bid.as_ref().and_then(|b| b.expiration_time))
            .reduce(f64::max)
    }

    fn insert(&mut self, contractor: ManagerContractor) {
        self.items.push(contractor);
    }
}

/// The manager's view of its contract, handed to every [`Manager`] hook.
#[derive(Debug)]
pub struct ManagerMedium {
    core: ProtocolCore,
    machine: StateMachine<ContractState, ManagerTimeout>,
    timeouts: ManagerTimeouts,
    recipients: Vec<Recipient>,
    expected_bids: Option<usize>,
    announcement: Option<Message>,
    contractors: ManagerContractors,
    events: VecDeque<ManagerEvent>,
}

impl ManagerMedium {
    fn new(core: ProtocolCore, recipients: Vec<Recipient>, timeouts: ManagerTimeouts) -> Self {
        let expected_bids = count_expected_bids(&recipients);
        Self {
            core,
            machine: StateMachine::new(ContractState::Initiated),
            timeouts,
            recipients,
            expected_bids,
            announcement: None,
            contractors: ManagerContractors::default(),
            events: VecDeque::new(),
        }
    }

    pub fn core(&self) -> &ProtocolCore {
        &self.core
    }

    pub fn state(&self) -> ContractState {
        self.machine.state()
    }

    pub fn get_recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn get_bids(&self) -> Vec<Message> {
        self.contractors.get_bids()
    }

    pub fn contractors(&self) -> &ManagerContractors {
        &self.contractors
    }

    /// Number of answers that close the announce window early, unknown
    /// when the announcement was broadcast.
    pub fn expected_bids(&self) -> Option<usize> {
        self.expected_bids
    }

    /// The announcement as sent.
    pub fn announcement(&self) -> Option<&Message> {
        self.announcement.as_ref()
    }

    pub fn announce(&mut self, announcement: Message) -> Option<Message> {
        if !self
            .machine
            .ensure_state(&[ContractState::Initiated], "announce")
        {
            return None;
        }
        let mut msg = announcement.duplicate();
        if msg.traversal_id.is_none() {
            msg.traversal_id = Some(self.core.medium().new_traversal_id());
        }
        self.machine.set_state(ContractState::Announced);
        let expiration = self.core.get_time() + self.timeouts.announce;
        debug!(
            session_id = %self.core.session_id(),
            recipients = self.recipients.len(),
            "Sending announcement"
        );
        let sent = self.core.send(&self.recipients, msg, None, Some(expiration));
        self.machine.set_timeout(
            self.core.medium(),
            self.core.session_id(),
            expiration,
            None,
            ManagerTimeout::Announce,
        );
        self.announcement = Some(sent.clone());
        Some(sent)
    }

    pub fn reject(&mut self, bid: &Message, rejection: Option<Message>) -> bool {
        if !self.machine.ensure_state(
            &[
                ContractState::Announced,
                ContractState::Granted,
                ContractState::Closed,
            ],
            "reject",
        ) {
            return false;
        }
        let Some(contractor) = self.contractors.by_message_mut(bid) else {
            warn!(session_id = %self.core.session_id(), "Rejecting unknown bid, ignoring");
            return false;
        };
        let rejection = rejection.unwrap_or_else(Message::rejection);
        contractor.on_event(&self.core, "reject", TO_REJECTED, rejection, None)
    }

    /// Grants each `(bid, grant)` pair and rejects every other bidder
    /// still waiting in the bid state.
    pub fn grant(&mut self, grants: Vec<(Message, Message)>) -> bool {
        if !self.machine.ensure_state(
            &[ContractState::Closed, ContractState::Announced],
            "grant",
        ) {
            return false;
        }
        self.machine.set_state(ContractState::Granted);
        let expiration = self.core.get_time() + self.timeouts.grant;
        self.machine.set_timeout(
            self.core.medium(),
            self.core.session_id(),
            expiration,
            Some(ContractState::Aborted),
            ManagerTimeout::Grant,
        );

        for (bid, grant) in grants {
            let Some(contractor) = self.contractors.by_message_mut(&bid) else {
                warn!(session_id = %self.core.session_id(), "Granting unknown bid, ignoring");
                continue;
            };
            contractor.on_event(
                &self.core,
                "grant",
                TO_GRANTED,
                grant.duplicate(),
                Some(expiration),
            );
        }

        for key in self.contractors.keys_with_state(&[ContractorState::Bid]) {
            if let Some(contractor) = self.contractors.get_mut(&key) {
                contractor.on_event(&self.core, "reject", TO_REJECTED, Message::rejection(), None);
            }
        }
        true
    }

    /// Marks a bidder as elected without telling it anything yet.
    pub fn elect(&mut self, bid: &Message) -> bool {
        match self.contractors.by_message_mut(bid) {
            Some(contractor) => contractor.machine.apply("elect", TO_ELECTED),
            None => false,
        }
    }

    pub fn cancel(&mut self, reason: Option<String>) -> bool {
        if !self.machine.ensure_state(
            &[ContractState::Granted, ContractState::Cancelled],
            "cancel",
        ) {
            return false;
        }
        self.cancel_contract(reason, ProtocolFailure::initiator_failed(ContractState::Cancelled));
        true
    }

    /// Rejects the outstanding bidders and finishes with `result`, unless
    /// the contract already failed.
    pub fn terminate(&mut self, result: Value) -> bool {
        for key in self
            .contractors
            .keys_with_state(&[ContractorState::Bid, ContractorState::Elected])
        {
            if let Some(contractor) = self.contractors.get_mut(&key) {
                contractor.on_event(&self.core, "reject", TO_REJECTED, Message::rejection(), None);
            }
        }
        if self.machine.state().is_failed() {
            return false;
        }
        self.machine.set_state(ContractState::Terminated);
        self.finish(Ok(result))
    }

    fn finish(&mut self, result: ProtocolResult) -> bool {
        self.machine.cancel_timeout(self.core.medium());
        self.core.finish(result)
    }

    fn cancel_contract(&mut self, reason: Option<String>, failure: ProtocolFailure) {
        self.machine.set_state(ContractState::Cancelled);
        self.machine.cancel_timeout(self.core.medium());
        for key in self
            .contractors
            .keys_with_state(&[ContractorState::Granted, ContractorState::Completed])
        {
            if let Some(contractor) = self.contractors.get_mut(&key) {
                contractor.on_event(
                    &self.core,
                    "cancel",
                    TO_CANCELLED,
                    Message::cancellation(reason.clone()),
                    None,
                );
            }
        }
        self.events
            .push_back(ManagerEvent::Cancelled { reason, failure });
    }

    fn check_close(&mut self) {
        if let Some(expected) = self.expected_bids {
            if self.contractors.len() >= expected {
                self.close_or_expire();
            }
        }
    }

    fn close_or_expire(&mut self) {
        self.machine.cancel_timeout(self.core.medium());
        let has_bids = self
            .contractors
            .with_state(&[ContractorState::Bid])
            .next()
            .is_some();
        if has_bids {
            self.machine.set_state(ContractState::Closed);
            let expiration = match self.contractors.get_expiration_time() {
                Some(at) => at,
                None => self.core.get_time() + self.timeouts.announce,
            };
            self.machine.set_timeout(
                self.core.medium(),
                self.core.session_id(),
                expiration,
                Some(ContractState::Expired),
                ManagerTimeout::Close,
            );
            self.events.push_back(ManagerEvent::Closed);
        } else {
            self.machine.set_state(ContractState::Expired);
            self.events.push_back(ManagerEvent::Expired);
        }
    }

    fn complete(&mut self) {
        self.machine.set_state(ContractState::Completed);
        self.machine.cancel_timeout(self.core.medium());
        let mut reports = Vec::new();
        for key in self.contractors.keys_with_state(&[ContractorState::Completed]) {
            if let Some(contractor) = self.contractors.get_mut(&key) {
                if let Some(report) = contractor.report.clone() {
                    reports.push(report);
                }
                contractor.on_event(
                    &self.core,
                    "ack",
                    TO_ACKNOWLEDGED,
                    Message::acknowledgement(),
                    None,
                );
            }
        }
        self.events.push_back(ManagerEvent::Completed(reports));
    }

    fn on_bid(&mut self, bid: Message) {
        let Some(recipient) = bid.reply_to.clone() else {
            warn!(session_id = %self.core.session_id(), "Bid without reply address, ignoring");
            return;
        };
        if self.contractors.get(&recipient.key).is_some() {
            warn!(
                session_id = %self.core.session_id(),
                contractor = %recipient.key,
                "Second answer from the same contractor, ignoring"
            );
            return;
        }
        self.contractors.insert(ManagerContractor::from_message(
            &bid,
            recipient,
            ContractorState::Bid,
        ));
        self.events.push_back(ManagerEvent::Bid(bid));
    }

    fn on_refusal(&mut self, refusal: &Message) {
        let Some(recipient) = refusal.reply_to.clone() else {
            warn!(session_id = %self.core.session_id(), "Refusal without reply address, ignoring");
            return;
        };
        if self.contractors.get(&recipient.key).is_some() {
            debug!(
                session_id = %self.core.session_id(),
                contractor = %recipient.key,
                "Contractor already answered, ignoring"
            );
            return;
        }
        self.contractors.insert(ManagerContractor::from_message(
            refusal,
            recipient,
            ContractorState::Refused,
        ));
        self.check_close();
    }

    fn on_report(&mut self, report: Message) {
        let Some(contractor) = self.contractors.by_message_mut(&report) else {
            warn!(session_id = %self.core.session_id(), "Report from unknown contractor, ignoring");
            return;
        };
        if !contractor.machine.apply("final_report", TO_COMPLETED) {
            return;
        }
        contractor.report = Some(report);
        let outstanding = self
            .contractors
            .with_state(&[ContractorState::Granted])
            .next()
            .is_some();
        if !outstanding {
            self.complete();
        }
    }

    fn on_cancel(&mut self, cancellation: &Message) {
        let Some(contractor) = self.contractors.by_message_mut(cancellation) else {
            return;
        };
        contractor.machine.set_state(ContractorState::Cancelled);
        let remote_reason = match &cancellation.payload {
            Payload::Cancellation {
                reason: Some(reason),
                ..
            } => reason.as_str(),
            _ => "none",
        };
        let reason = format!("Other contractor cancelled the job with reason: {remote_reason}");
        self.cancel_contract(Some(reason.clone()), ProtocolFailure::Remote(reason));
    }
}

fn count_expected_bids(recipients: &[Recipient]) -> Option<usize> {
    if recipients.iter().any(Recipient::is_broadcast) {
        None
    } else {
        Some(recipients.len())
    }
}

/// Contract-net initiator: drives a [`Manager`] through one contract.
pub struct AgencyManager {
    medium: ManagerMedium,
    manager: Box<dyn Manager>,
    args: Value,
}

impl AgencyManager {
    pub fn medium(&self) -> &ManagerMedium {
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
            match event {
                ManagerEvent::Bid(bid) => {
                    self.manager.bid(&mut self.medium, &bid);
                    if self.medium.state() == ContractState::Announced {
                        self.medium.check_close();
                    }
                }
                ManagerEvent::Closed => self.manager.closed(&mut self.medium),
                ManagerEvent::Expired => {
                    self.manager.expired(&mut self.medium);
                    self.medium.finish(Err(ProtocolFailure::Expired));
                }
                ManagerEvent::Cancelled { reason, failure } => {
                    self.manager.cancelled(&mut self.medium, reason.as_deref());
                    self.medium.finish(Err(failure));
                }
                ManagerEvent::Aborted => {
                    self.manager.aborted(&mut self.medium);
                    self.medium
                        .finish(Err(ProtocolFailure::initiator_failed(ContractState::Aborted)));
                }
                ManagerEvent::UpdateReport(report) => {
                    self.manager.update_report(&mut self.medium, &report)
                }
                ManagerEvent::Completed(reports) => {
                    let result = self.manager.completed(&mut self.medium, reports);
                    self.medium.finish(Ok(result));
                }
            }
        }
    }

    fn on_timeout_action(&mut self, action: ManagerTimeout) {
        match action {
            ManagerTimeout::Initiate => {
                error!(
                    session_id = %self.medium.core.session_id(),
                    "Timeout exceeded waiting for initiate() to send the announcement"
                );
                self.medium
                    .finish(Err(ProtocolFailure::initiator_failed(ContractState::Wtf)));
            }
            ManagerTimeout::Announce => {
                debug!(
                    session_id = %self.medium.core.session_id(),
                    "Timeout expired, closing the announce window"
                );
                if self.medium.state() == ContractState::Announced {
                    self.medium.close_or_expire();
                }
            }
            ManagerTimeout::Close => self.medium.events.push_back(ManagerEvent::Expired),
            ManagerTimeout::Grant => self.medium.events.push_back(ManagerEvent::Aborted),
        }
        self.drain();
    }
}

impl std::fmt::Debug for AgencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgencyManager")
            .field("medium", &self.medium)
            .finish_non_exhaustive()
    }
}

impl AgencyProtocol for AgencyManager {
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
        let at = self.medium.core.get_time() + self.medium.timeouts.initiate;
        self.medium.machine.set_timeout(
            self.medium.core.medium(),
            self.medium.core.session_id(),
            at,
            Some(ContractState::Wtf),
            ManagerTimeout::Initiate,
        );
        self.manager.initiate(&mut self.medium, &self.args);
        self.drain();
    }

    fn on_message(&mut self, msg: Message) {
        let kind = msg.kind();
        let transitions = match kind {
            PayloadKind::Bid | PayloadKind::Refusal | PayloadKind::Duplicate => IN_ANNOUNCED,
            PayloadKind::FinalReport | PayloadKind::UpdateReport => IN_GRANTED,
            PayloadKind::Cancellation => ON_CANCELLATION,
            other => {
                warn!(
                    session_id = %self.medium.core.session_id(),
                    kind = %other,
                    "Manager received unexpected message, ignoring"
                );
                return;
            }
        };
        if kind == PayloadKind::Cancellation && self.medium.contractors.by_message(&msg).is_none() {
            warn!(
                session_id = %self.medium.core.session_id(),
                "Cancellation from unknown contractor, ignoring"
            );
            return;
        }
        if !self.medium.machine.apply(kind.name(), transitions) {
            return;
        }
        match kind {
            PayloadKind::Bid => self.medium.on_bid(msg),
            PayloadKind::Refusal | PayloadKind::Duplicate => self.medium.on_refusal(&msg),
            PayloadKind::FinalReport => self.medium.on_report(msg),
            PayloadKind::UpdateReport => self.medium.events.push_back(ManagerEvent::UpdateReport(msg)),
            PayloadKind::Cancellation => self.medium.on_cancel(&msg),
            _ => {}
        }
        self.drain();
    }

    fn on_timeout(&mut self, generation: u64) {
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

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

type BuildManager = dyn Fn() -> Box<dyn Manager> + Send + Sync;

/// Registers a [`Manager`] implementation under a protocol id.
pub struct ManagerFactory {
    protocol_id: String,
    timeouts: ManagerTimeouts,
    build: Arc<BuildManager>,
}

impl ManagerFactory {
    pub fn new<M, F>(protocol_id: impl Into<String>, build: F) -> Self
    where
        M: Manager,
        F: Fn() -> M + Send + Sync + 'static,
    {
        Self {
            protocol_id: protocol_id.into(),
            timeouts: ManagerTimeouts::default(),
            build: Arc::new(move || Box::new(build()) as Box<dyn Manager>),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ManagerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl InitiatorFactory for ManagerFactory {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Contract
    }

    fn build(
        &self,
        ctx: ProtocolContext,
        recipients: Vec<Recipient>,
        args: Value,
    ) -> Box<dyn AgencyProtocol> {
        let core = ProtocolCore::new(ctx, self.protocol_id.clone());
        Box::new(AgencyManager {
            medium: ManagerMedium::new(core, recipients, self.timeouts),
            manager: (self.build)(),
            args,
        })
    }
}
