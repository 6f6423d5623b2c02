//! Request/reply: one request, at most one reply.

use std::any::Any;
use std::sync::Arc;

use agency_types::{Message, PayloadKind, ProtocolType, Recipient, RequestState, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::machine::{StateMachine, Transition};
use crate::protocol::{
    AgencyProtocol, InitiatorFactory, InterestFactory, ProtocolContext, ProtocolCore,
    ProtocolFailure,
};

/// Timeouts of the requesting side, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequesterTimeouts {
    /// Time the reply has to arrive.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_timeout() -> f64 {
    10.0
}

impl Default for RequesterTimeouts {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

/// Behaviour of the requesting side.
pub trait Requester: Send + 'static {
    /// Expected to [`request`](RequesterMedium::request).
    fn initiate(&mut self, requester: &mut RequesterMedium, args: &Value);

    /// The reply arrived. The return value is the result of the request;
    /// by default the reply's body.
    fn got_reply(&mut self, _requester: &mut RequesterMedium, reply: &Message) -> Value {
        reply.body().clone()
    }

    /// No reply arrived in time.
    fn closed(&mut self, _requester: &mut RequesterMedium) {}
}

/// Behaviour of the replying side.
pub trait Replier: Send + 'static {
    /// Expected to [`reply`](ReplierMedium::reply) before the request
    /// expires.
    fn requested(&mut self, replier: &mut ReplierMedium, request: &Message);
}

const ON_RESPONSE: &[Transition<RequestState>] = &[Transition {
    before: &[RequestState::Requested],
    after: RequestState::Closed,
}];

const ON_REQUEST: &[Transition<RequestState>] = &[Transition {
    before: &[RequestState::Requested],
    after: RequestState::Requested,
}];

#[derive(Debug)]
pub struct RequesterMedium {
    core: ProtocolCore,
    machine: StateMachine<RequestState, ()>,
    timeouts: RequesterTimeouts,
    recipients: Vec<Recipient>,
    deadline: f64,
    request: Option<Message>,
}

impl RequesterMedium {
    pub fn core(&self) -> &ProtocolCore {
        &self.core
    }

    pub fn state(&self) -> RequestState {
        self.machine.state()
    }

    pub fn get_recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Sends the request. It expires together with the requester's own
    /// timeout.
    pub fn request(&mut self, request: Message) -> Option<Message> {
        if !self
            .machine
            .ensure_state(&[RequestState::Requested], "request")
        {
            return None;
        }
        if self.request.is_some() {
            warn!(
                session_id = %self.core.session_id(),
                "Request already sent, ignoring"
            );
            return None;
        }
        let mut request = request.duplicate();
        if request.traversal_id.is_none() {
            request.traversal_id = Some(self.core.medium().new_traversal_id());
        }
        let sent = self
            .core
            .send(&self.recipients, request, None, Some(self.deadline));
        self.request = Some(sent.clone());
        Some(sent)
    }
}

/// Request/reply initiator.
pub struct AgencyRequester {
    medium: RequesterMedium,
    requester: Box<dyn Requester>,
    args: Value,
}

impl AgencyRequester {
    pub fn medium(&self) -> &RequesterMedium {
        &self.medium
    }

    fn on_timeout_action(&mut self) {
        debug!(session_id = %self.medium.core.session_id(), "No reply in time, closing");
        self.requester.closed(&mut self.medium);
        self.medium
            .core
            .finish(Err(ProtocolFailure::initiator_failed(RequestState::Closed)));
    }
}

impl std::fmt::Debug for AgencyRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgencyRequester")
            .field("medium", &self.medium)
            .finish_non_exhaustive()
    }
}

impl AgencyProtocol for AgencyRequester {
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
        self.medium.machine.set_state(RequestState::Requested);
        self.medium.deadline = self.medium.core.get_time() + self.medium.timeouts.timeout;
        self.medium.machine.set_timeout(
            self.medium.core.medium(),
            self.medium.core.session_id(),
            self.medium.deadline,
            Some(RequestState::Closed),
            (),
        );
        self.requester.initiate(&mut self.medium, &self.args);
    }

    fn on_message(&mut self, msg: Message) {
        if msg.kind() != PayloadKind::ResponseMessage {
            warn!(
                session_id = %self.medium.core.session_id(),
                kind = %msg.kind(),
                "Requester received unexpected message, ignoring"
            );
            return;
        }
        if !self.medium.machine.apply(msg.kind().name(), ON_RESPONSE) {
            return;
        }
        self.medium
            .machine
            .cancel_timeout(self.medium.core.medium());
        let result = self.requester.got_reply(&mut self.medium, &msg);
        self.medium.core.finish(Ok(result));
    }

    fn on_timeout(&mut self, generation: u64) {
        if self.medium.machine.fire(generation).is_some() {
            self.on_timeout_action();
        }
    }

    fn expire_now(&mut self) -> bool {
        match self.medium.machine.expire_now(self.medium.core.medium()) {
            Some(()) => {
                self.on_timeout_action();
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

#[derive(Debug)]
pub struct ReplierMedium {
    core: ProtocolCore,
    machine: StateMachine<RequestState, ()>,
    requester: Option<Recipient>,
    remote_id: Option<SessionId>,
    request: Option<Message>,
}

impl ReplierMedium {
    pub fn core(&self) -> &ProtocolCore {
        &self.core
    }

    pub fn state(&self) -> RequestState {
        self.machine.state()
    }

    pub fn request(&self) -> Option<&Message> {
        self.request.as_ref()
    }

    /// Answers the request and closes the dialog.
    pub fn reply(&mut self, reply: Message) -> Option<Message> {
        if !self.machine.ensure_state(&[RequestState::Requested], "reply") {
            return None;
        }
        let recipients: Vec<Recipient> = self.requester.iter().cloned().collect();
        let expiration = self.request.as_ref().and_then(|r| r.expiration_time);
        let sent = self.core.send(
            &recipients,
            reply.duplicate(),
            self.remote_id.as_ref(),
            expiration,
        );
        self.machine.cancel_timeout(self.core.medium());
        self.machine.set_state(RequestState::Closed);
        self.core.finish(Ok(Value::Null));
        Some(sent)
    }
}

/// Request/reply interested party.
pub struct AgencyReplier {
    medium: ReplierMedium,
    replier: Box<dyn Replier>,
}

impl AgencyReplier {
    pub fn medium(&self) -> &ReplierMedium {
        &self.medium
    }

    fn on_timeout_action(&mut self) {
        debug!(
            session_id = %self.medium.core.session_id(),
            "Request expired without a reply"
        );
        self.medium.core.finish(Ok(Value::Null));
    }
}

impl std::fmt::Debug for AgencyReplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgencyReplier")
            .field("medium", &self.medium)
            .finish_non_exhaustive()
    }
}

impl AgencyProtocol for AgencyReplier {
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
        self.medium.machine.set_state(RequestState::Requested);
    }

    fn on_message(&mut self, msg: Message) {
        if msg.kind() != PayloadKind::RequestMessage {
            warn!(
                session_id = %self.medium.core.session_id(),
                kind = %msg.kind(),
                "Replier received unexpected message, ignoring"
            );
            return;
        }
        if !self.medium.machine.apply(msg.kind().name(), ON_REQUEST) {
            return;
        }
        if self.medium.request.is_some() {
            warn!(session_id = %self.medium.core.session_id(), "Second request, ignoring");
            return;
        }
        self.medium.requester = msg.reply_to.clone();
        self.medium.remote_id = msg.sender_id.clone();
        let at = match msg.expiration_time {
            Some(at) => at,
            None => self.medium.core.get_time() + self.medium.core.medium().default_timeout(),
        };
        self.medium.machine.set_timeout(
            self.medium.core.medium(),
            self.medium.core.session_id(),
            at,
            Some(RequestState::Closed),
            (),
        );
        self.medium.request = Some(msg.clone());
        self.replier.requested(&mut self.medium, &msg);
    }

    fn on_timeout(&mut self, generation: u64) {
        if self.medium.machine.fire(generation).is_some() {
            self.on_timeout_action();
        }
    }

    fn expire_now(&mut self) -> bool {
        match self.medium.machine.expire_now(self.medium.core.medium()) {
            Some(()) => {
                self.on_timeout_action();
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

type BuildRequester = dyn Fn() -> Box<dyn Requester> + Send + Sync;

/// Registers a [`Requester`] implementation under a protocol id.
pub struct RequesterFactory {
    protocol_id: String,
    timeouts: RequesterTimeouts,
    build: Arc<BuildRequester>,
}

impl RequesterFactory {
    pub fn new<R, F>(protocol_id: impl Into<String>, build: F) -> Self
    where
        R: Requester,
        F: Fn() -> R + Send + Sync + 'static,
    {
        Self {
            protocol_id: protocol_id.into(),
            timeouts: RequesterTimeouts::default(),
            build: Arc::new(move || Box::new(build()) as Box<dyn Requester>),
        }
    }

    pub fn with_timeouts(mut self, timeouts: RequesterTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl InitiatorFactory for RequesterFactory {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Request
    }

    fn build(
        &self,
        ctx: ProtocolContext,
        recipients: Vec<Recipient>,
        args: Value,
    ) -> Box<dyn AgencyProtocol> {
        Box::new(AgencyRequester {
            medium: RequesterMedium {
                core: ProtocolCore::new(ctx, self.protocol_id.clone()),
                machine: StateMachine::new(RequestState::None),
                timeouts: self.timeouts,
                recipients,
                deadline: 0.0,
                request: None,
            },
            requester: (self.build)(),
            args,
        })
    }
}

type BuildReplier = dyn Fn() -> Box<dyn Replier> + Send + Sync;

/// Registers a [`Replier`] implementation as an interest in a request
/// protocol.
pub struct ReplierFactory {
    protocol_id: String,
    build: Arc<BuildReplier>,
}

impl ReplierFactory {
    pub fn new<R, F>(protocol_id: impl Into<String>, build: F) -> Self
    where
        R: Replier,
        F: Fn() -> R + Send + Sync + 'static,
    {
        Self {
            protocol_id: protocol_id.into(),
            build: Arc::new(move || Box::new(build()) as Box<dyn Replier>),
        }
    }
}

impl InterestFactory for ReplierFactory {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Request
    }

    fn initiator(&self) -> PayloadKind {
        PayloadKind::RequestMessage
    }

    fn build(&self, ctx: ProtocolContext, _msg: &Message) -> Box<dyn AgencyProtocol> {
        Box::new(AgencyReplier {
            medium: ReplierMedium {
                core: ProtocolCore::new(ctx, self.protocol_id.clone()),
                machine: StateMachine::new(RequestState::None),
                requester: None,
                remote_id: None,
                request: None,
            },
            replier: (self.build)(),
        })
    }
}
