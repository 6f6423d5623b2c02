//! An agent hosted by an agency: routes its messages and timeouts to the
//! protocols it runs, and records every call into its journal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use agency_journal::{FiberContext, JournalEntry, JournalError, JournalId, Recorder};
use agency_serialization::{thaw, Registry, Snapshot};
use agency_types::{AgentId, Message, PayloadKind, ProtocolType, Recipient, SessionId};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{AgencyError, AgencyResult};
use crate::interest::{Interest, InterestKind};
use crate::medium::{AgentCommand, AgentMedium};
use crate::messaging::Binding;
use crate::protocol::{
    AgencyProtocol, InitiatorFactory, InterestFactory, NotificationHandler, ProtocolContext,
    ProtocolFailure, ProtocolHandle, ProtocolResult,
};
use crate::retrying::{RetryPolicy, RetryingFactory, RetryingProtocol, RETRIED_PREFIX};
use crate::time::DelayedCall;

pub const ON_MESSAGE: &str = "AgencyAgent.on_message";
pub const ON_TIMEOUT: &str = "AgencyAgent.on_timeout";
pub const INITIATE_PROTOCOL: &str = "AgencyAgent.initiate_protocol";

type InterestKey = (ProtocolType, String);

pub struct AgencyAgent {
    agent_id: AgentId,
    medium: Arc<AgentMedium>,
    recorder: Recorder,
    default_retry: RetryPolicy,
    factories: HashMap<String, Arc<dyn InitiatorFactory>>,
    interests: HashMap<InterestKey, Interest>,
    protocols: BTreeMap<SessionId, Box<dyn AgencyProtocol>>,
    watchers: HashMap<SessionId, Vec<oneshot::Sender<ProtocolResult>>>,
    parents: HashMap<SessionId, SessionId>,
    spawned_by: HashMap<SessionId, InterestKey>,
    seen_messages: HashMap<String, f64>,
    seen_traversals: HashMap<String, f64>,
    binding: Option<Binding>,
    terminating: bool,
    terminated: bool,
}

impl AgencyAgent {
    pub fn new(medium: Arc<AgentMedium>, recorder: Recorder, default_retry: RetryPolicy) -> Self {
        let agent_id = medium.agent_id().clone();
        let binding =
            medium
                .messaging()
                .create_binding(&agent_id, agent_id.as_str(), medium.shard());
        if let Some(keeper) = medium.journal().keeper() {
            keeper.register(recorder.journal_id());
        }
        info!(agent_id = %agent_id, journal_id = %recorder.journal_id(), "Agent started");
        Self {
            agent_id,
            medium,
            recorder,
            default_retry,
            factories: HashMap::new(),
            interests: HashMap::new(),
            protocols: BTreeMap::new(),
            watchers: HashMap::new(),
            parents: HashMap::new(),
            spawned_by: HashMap::new(),
            seen_messages: HashMap::new(),
            seen_traversals: HashMap::new(),
            binding: Some(binding),
            terminating: false,
            terminated: false,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn medium(&self) -> &Arc<AgentMedium> {
        &self.medium
    }

    pub fn journal_id(&self) -> &JournalId {
        self.recorder.journal_id()
    }

    /// Address other agents reach this one at.
    pub fn recipient(&self) -> &Recipient {
        self.medium.recipient()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn register_factory(&mut self, factory: impl InitiatorFactory + 'static) {
        let factory: Arc<dyn InitiatorFactory> = Arc::new(factory);
        debug!(
            agent_id = %self.agent_id,
            protocol_id = %factory.protocol_id(),
            "Registering initiator"
        );
        self.factories
            .insert(factory.protocol_id().to_string(), factory);
    }

    /// Lets the agent accept conversations of `factory`'s protocol.
    /// A public interest also answers broadcasts on the protocol id; with a
    /// `concurrency` limit, excess conversations wait in arrival order.
    pub fn register_interest(
        &mut self,
        factory: impl InterestFactory + 'static,
        public: bool,
        concurrency: Option<usize>,
    ) -> AgencyResult<()> {
        let factory: Arc<dyn InterestFactory> = Arc::new(factory);
        let protocol_type = factory.protocol_type();
        let protocol_id = factory.protocol_id().to_string();
        self.add_interest(
            InterestKind::Protocol(factory),
            protocol_type,
            protocol_id,
            public,
            concurrency,
        )
    }

    pub fn register_notification(
        &mut self,
        protocol_id: impl Into<String>,
        handler: impl NotificationHandler + 'static,
        public: bool,
    ) -> AgencyResult<()> {
        self.add_interest(
            InterestKind::Notification(Box::new(handler)),
            ProtocolType::Notification,
            protocol_id.into(),
            public,
            None,
        )
    }

    fn add_interest(
        &mut self,
        kind: InterestKind,
        protocol_type: ProtocolType,
        protocol_id: String,
        public: bool,
        concurrency: Option<usize>,
    ) -> AgencyResult<()> {
        self.ensure_alive()?;
        let key = (protocol_type, protocol_id.clone());
        if self.interests.contains_key(&key) {
            return Err(AgencyError::DuplicateInterest {
                protocol_type,
                protocol_id,
            });
        }
        let binding = public.then(|| {
            self.medium
                .messaging()
                .create_binding(&self.agent_id, &protocol_id, self.medium.shard())
        });
        debug!(
            agent_id = %self.agent_id,
            protocol_type = %protocol_type,
            protocol_id = %protocol_id,
            public,
            "Registering interest"
        );
        self.interests.insert(
            key,
            Interest::new(kind, protocol_type, protocol_id, concurrency, binding),
        );
        Ok(())
    }

    /// Drops an interest and its binding. Conversations already started
    /// carry on; queued ones are dropped.
    pub fn revoke_interest(&mut self, protocol_type: ProtocolType, protocol_id: &str) -> bool {
        match self
            .interests
            .remove(&(protocol_type, protocol_id.to_string()))
        {
            Some(interest) => {
                if let Some(binding) = &interest.binding {
                    self.medium.messaging().revoke(binding);
                }
                true
            }
            None => false,
        }
    }

    pub fn interest(&self, protocol_type: ProtocolType, protocol_id: &str) -> Option<&Interest> {
        self.interests.get(&(protocol_type, protocol_id.to_string()))
    }

    /// Starts a protocol registered with [`register_factory`]. A
    /// `retried-` prefix wraps a registered protocol in the default retry
    /// policy.
    ///
    /// [`register_factory`]: Self::register_factory
    pub fn initiate_protocol(
        &mut self,
        protocol_id: &str,
        recipients: Vec<Recipient>,
        args: Value,
    ) -> AgencyResult<ProtocolHandle> {
        self.ensure_alive()?;
        let factory = self.resolve_factory(protocol_id)?;
        let instance_id = self.recorder.journal_id().clone();
        self.medium.journal().begin(
            &instance_id,
            INITIATE_PROTOCOL,
            &(protocol_id, &recipients, &args),
            None,
        )?;
        let session_id = self.start_protocol(factory, recipients, args, None);
        let (sender, receiver) = oneshot::channel();
        self.watchers
            .entry(session_id.clone())
            .or_default()
            .push(sender);
        self.settle();
        self.finish_call(session_id.as_str())?;
        Ok(ProtocolHandle::new(session_id, protocol_id, receiver))
    }

    /// Starts `protocol_id` wrapped in a retrying protocol with `policy`.
    pub fn retrying(
        &mut self,
        protocol_id: &str,
        recipients: Vec<Recipient>,
        args: Value,
        policy: RetryPolicy,
    ) -> AgencyResult<ProtocolHandle> {
        let retried = format!("{RETRIED_PREFIX}{protocol_id}");
        self.initiate_protocol(&retried, recipients, policy.wrap_args(args))
    }

    /// Routes an inbound message. Returns whether anything took it.
    pub fn on_message(&mut self, msg: Message) -> AgencyResult<bool> {
        self.ensure_alive()?;
        let instance_id = self.recorder.journal_id().clone();
        self.medium
            .journal()
            .begin(&instance_id, ON_MESSAGE, &msg, None)?;
        let handled = self.dispatch(msg);
        self.settle();
        self.finish_call(&handled)?;
        Ok(handled)
    }

    /// Fires a protocol's timeout. Timeouts of protocols that are gone are
    /// ignored.
    pub fn on_timeout(&mut self, call: DelayedCall) -> AgencyResult<bool> {
        self.ensure_alive()?;
        let Some(protocol) = self.protocols.get(&call.session_id) else {
            debug!(
                agent_id = %self.agent_id,
                session_id = %call.session_id,
                "Timeout for a finished protocol, ignoring"
            );
            return Ok(false);
        };
        let instance_id = protocol.journal_id().clone();
        self.medium.journal().begin(
            &instance_id,
            ON_TIMEOUT,
            &(call.session_id.as_str(), call.generation),
            call.fiber.clone(),
        )?;
        if let Some(protocol) = self.protocols.get_mut(&call.session_id) {
            protocol.on_timeout(call.generation);
        }
        self.settle();
        self.finish_call(&true)?;
        Ok(true)
    }

    /// Re-executes a recorded call against this agent, substituting the
    /// recorded side effects. Any divergence is a replay error.
    pub fn replay(&mut self, entry: JournalEntry) -> AgencyResult<()> {
        let outcome = self.replay_entry(entry);
        if outcome.is_err() {
            self.medium.journal().abort();
        }
        outcome
    }

    fn replay_entry(&mut self, entry: JournalEntry) -> AgencyResult<()> {
        let registry = Registry::permissive();
        let replay_error = |entry: &JournalEntry, reason: String| {
            AgencyError::Journal(JournalError::Replay {
                instance_id: entry.instance_id.clone(),
                reason,
            })
        };
        match entry.entry_id.as_str() {
            ON_MESSAGE => {
                let msg: Message = thaw(&entry.input, &registry)?;
                self.medium.journal().begin_replay(entry);
                self.on_message(msg)?;
            }
            INITIATE_PROTOCOL => {
                let (protocol_id, recipients, args): (String, Vec<Recipient>, Value) =
                    thaw(&entry.input, &registry)?;
                self.medium.journal().begin_replay(entry);
                self.initiate_protocol(&protocol_id, recipients, args)?;
            }
            ON_TIMEOUT => {
                let (session, generation): (String, u64) = thaw(&entry.input, &registry)?;
                let session_id = SessionId(session);
                if !self.protocols.contains_key(&session_id) {
                    return Err(replay_error(
                        &entry,
                        format!("no live protocol with session {session_id}"),
                    ));
                }
                let call = DelayedCall {
                    agent_id: self.agent_id.clone(),
                    session_id,
                    generation,
                    fiber: Some(FiberContext {
                        fiber_id: entry.fiber_id.clone(),
                        depth: entry.fiber_depth,
                    }),
                };
                self.medium.journal().begin_replay(entry);
                self.on_timeout(call)?;
            }
            other => {
                let reason = format!("unknown recorded call {other}");
                return Err(replay_error(&entry, reason));
            }
        }
        Ok(())
    }

    /// A new receiver for the result of a live protocol.
    pub fn notify_finish(
        &mut self,
        session_id: &SessionId,
    ) -> AgencyResult<oneshot::Receiver<ProtocolResult>> {
        if !self.protocols.contains_key(session_id) {
            return Err(AgencyError::UnknownSession(session_id.clone()));
        }
        let (sender, receiver) = oneshot::channel();
        self.watchers
            .entry(session_id.clone())
            .or_default()
            .push(sender);
        Ok(receiver)
    }

    pub fn protocol_state(&self, session_id: &SessionId) -> Option<String> {
        self.protocols.get(session_id).map(|p| p.state_name())
    }

    /// A live protocol as its concrete role type.
    pub fn protocol_as<P: 'static>(&self, session_id: &SessionId) -> Option<&P> {
        self.protocols
            .get(session_id)
            .and_then(|p| p.as_any().downcast_ref::<P>())
    }

    pub fn has_protocol(&self, session_id: &SessionId) -> bool {
        self.protocols.contains_key(session_id)
    }

    pub fn live_sessions(&self) -> Vec<SessionId> {
        self.protocols.keys().cloned().collect()
    }

    /// Stops a retrying protocol, or expires any other one now.
    pub fn give_up(&mut self, session_id: &SessionId) -> AgencyResult<()> {
        let protocol = self
            .protocols
            .get_mut(session_id)
            .ok_or_else(|| AgencyError::UnknownSession(session_id.clone()))?;
        match protocol.as_any_mut().downcast_mut::<RetryingProtocol>() {
            Some(retrying) => retrying.give_up(),
            None => {
                if !protocol.expire_now() {
                    protocol.abort(ProtocolFailure::Expired);
                }
            }
        }
        self.settle();
        Ok(())
    }

    /// Revokes every binding and finalizes every live protocol. Protocols
    /// with a pending timeout expire now, the rest fail with
    /// [`ProtocolFailure::AgentTerminated`].
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        info!(agent_id = %self.agent_id, live = self.protocols.len(), "Terminating agent");
        self.terminating = true;
        if let Some(binding) = self.binding.take() {
            self.medium.messaging().revoke(&binding);
        }
        for (_, interest) in self.interests.drain() {
            if let Some(binding) = &interest.binding {
                self.medium.messaging().revoke(binding);
            }
        }

        for protocol in self.protocols.values_mut() {
            if !protocol.is_finished() && !protocol.expire_now() {
                protocol.abort(ProtocolFailure::AgentTerminated);
            }
        }
        self.settle();
        for protocol in self.protocols.values_mut() {
            protocol.abort(ProtocolFailure::AgentTerminated);
        }
        self.settle();
        self.terminated = true;
    }

    fn ensure_alive(&self) -> AgencyResult<()> {
        if self.terminated || self.terminating {
            return Err(AgencyError::Terminated(self.agent_id.clone()));
        }
        Ok(())
    }

    fn finish_call<O: Snapshot + ?Sized>(&self, output: &O) -> AgencyResult<()> {
        self.medium.journal().finish(output)?;
        Ok(())
    }

    fn resolve_factory(&self, protocol_id: &str) -> AgencyResult<Arc<dyn InitiatorFactory>> {
        if let Some(factory) = self.factories.get(protocol_id) {
            return Ok(factory.clone());
        }
        if let Some(inner) = protocol_id.strip_prefix(RETRIED_PREFIX) {
            if let Some(factory) = self.factories.get(inner) {
                let retrying = RetryingFactory::new(inner, factory.protocol_type())
                    .with_default_policy(self.default_retry.clone());
                return Ok(Arc::new(retrying));
            }
        }
        Err(AgencyError::UnknownFactory(protocol_id.to_string()))
    }

    fn context(&mut self) -> ProtocolContext {
        let journal_id = self.recorder.next_child_id();
        let keeper = self.medium.journal().keeper().cloned();
        if let Some(keeper) = keeper {
            keeper.register(&journal_id);
        }
        ProtocolContext {
            medium: self.medium.clone(),
            session_id: self.medium.new_session_id(),
            journal_id,
        }
    }

    fn start_protocol(
        &mut self,
        factory: Arc<dyn InitiatorFactory>,
        recipients: Vec<Recipient>,
        args: Value,
        parent: Option<SessionId>,
    ) -> SessionId {
        let ctx = self.context();
        let session_id = ctx.session_id.clone();
        let mut protocol = factory.build(ctx, recipients, args);
        debug!(
            agent_id = %self.agent_id,
            session_id = %session_id,
            protocol_id = %factory.protocol_id(),
            "Initiating protocol"
        );
        if let Some(parent) = parent {
            if let Some(parent_protocol) = self.protocols.get_mut(&parent) {
                parent_protocol.on_child_started(&session_id);
            }
            self.parents.insert(session_id.clone(), parent);
        }
        protocol.initiate();
        self.protocols.insert(session_id.clone(), protocol);
        session_id
    }

    fn dispatch(&mut self, msg: Message) -> bool {
        let now = self.medium.get_time();
        if msg.is_expired(now) {
            debug!(
                agent_id = %self.agent_id,
                kind = %msg.kind(),
                expiration_time = ?msg.expiration_time,
                now,
                "Dropping expired message"
            );
            return false;
        }
        if self.is_redelivery(&msg, now) {
            debug!(
                agent_id = %self.agent_id,
                kind = %msg.kind(),
                message_id = ?msg.message_id,
                "Dropping message delivered twice"
            );
            return false;
        }

        if let Some(receiver_id) = &msg.receiver_id {
            if let Some(protocol) = self.protocols.get_mut(receiver_id) {
                protocol.on_message(msg);
                return true;
            }
        }

        let key = (msg.protocol_type, msg.protocol_id.clone());
        let Some(interest) = self.interests.get_mut(&key) else {
            error!(
                agent_id = %self.agent_id,
                protocol_type = %msg.protocol_type,
                protocol_id = %msg.protocol_id,
                kind = %msg.kind(),
                "No listener or interest for message"
            );
            return false;
        };
        if msg.kind() != interest.initiator() {
            error!(
                agent_id = %self.agent_id,
                protocol_id = %msg.protocol_id,
                kind = %msg.kind(),
                expected = %interest.initiator(),
                "Message does not open a conversation of this interest"
            );
            return false;
        }
        if let InterestKind::Notification(handler) = &mut interest.kind {
            handler.notified(&self.medium, &msg);
            return true;
        }

        if msg.traversal_id.is_none() {
            warn!(
                agent_id = %self.agent_id,
                protocol_id = %msg.protocol_id,
                kind = %msg.kind(),
                "First message without a traversal id, dropping"
            );
            return false;
        }
        if self.is_duplicate(&msg, now) {
            return true;
        }
        let Some(interest) = self.interests.get_mut(&key) else {
            return false;
        };
        if !interest.has_capacity() {
            debug!(
                agent_id = %self.agent_id,
                protocol_id = %msg.protocol_id,
                queued = interest.queue.len() + 1,
                "Interest at its concurrency limit, queueing"
            );
            interest.queue.push_back(msg);
            return true;
        }
        self.spawn_interested(&key, msg)
    }

    /// Remembers the id of every message until it expires. Messages
    /// without an id are never considered redelivered.
    fn is_redelivery(&mut self, msg: &Message, now: f64) -> bool {
        self.seen_messages.retain(|_, expires| *expires >= now);
        let Some(message_id) = &msg.message_id else {
            return false;
        };
        if self.seen_messages.contains_key(message_id) {
            return true;
        }
        let expires = self.remember_until(msg, now);
        self.seen_messages.insert(message_id.clone(), expires);
        false
    }

    fn remember_until(&self, msg: &Message, now: f64) -> f64 {
        match msg.expiration_time {
            Some(at) => at,
            None => now + self.medium.default_timeout(),
        }
    }

    /// Remembers the traversal id of a first message, and answers a repeat
    /// of one with a duplication notice.
    fn is_duplicate(&mut self, msg: &Message, now: f64) -> bool {
        self.seen_traversals.retain(|_, expires| *expires >= now);
        let Some(traversal_id) = &msg.traversal_id else {
            return false;
        };
        if self.seen_traversals.contains_key(traversal_id) {
            debug!(
                agent_id = %self.agent_id,
                traversal_id = %traversal_id,
                "Already served this traversal, answering duplicate"
            );
            if let Some((recipient, mut reply)) = msg.duplication_message() {
                reply.reply_to = Some(self.medium.recipient().clone());
                self.medium.send_msg(&[recipient], &reply);
            }
            return true;
        }
        let expires = self.remember_until(msg, now);
        self.seen_traversals.insert(traversal_id.clone(), expires);
        false
    }

    fn spawn_interested(&mut self, key: &InterestKey, msg: Message) -> bool {
        let factory = match self.interests.get(key).map(|i| &i.kind) {
            Some(InterestKind::Protocol(factory)) => factory.clone(),
            _ => return false,
        };
        let ctx = self.context();
        let session_id = ctx.session_id.clone();
        let mut protocol = factory.build(ctx, &msg);
        debug!(
            agent_id = %self.agent_id,
            session_id = %session_id,
            protocol_id = %msg.protocol_id,
            "Spawning interested protocol"
        );
        if let Some(interest) = self.interests.get_mut(key) {
            interest.live.insert(session_id.clone());
        }
        self.spawned_by.insert(session_id.clone(), key.clone());
        protocol.initiate();
        protocol.on_message(msg);
        self.protocols.insert(session_id, protocol);
        true
    }

    /// Runs queued commands and retires finished protocols until neither
    /// is left.
    fn settle(&mut self) {
        loop {
            let commands = self.medium.take_commands();
            let mut progressed = !commands.is_empty();
            for command in commands {
                self.run_command(command);
            }
            let finished: Vec<SessionId> = self
                .protocols
                .iter()
                .filter(|(_, protocol)| protocol.is_finished())
                .map(|(session_id, _)| session_id.clone())
                .collect();
            progressed |= !finished.is_empty();
            for session_id in finished {
                self.retire(&session_id);
            }
            if !progressed {
                break;
            }
        }
    }

    fn run_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Initiate {
                protocol_id,
                recipients,
                args,
                parent,
            } => {
                let factory = if self.terminating {
                    Err(AgencyError::Terminated(self.agent_id.clone()))
                } else {
                    self.resolve_factory(&protocol_id)
                };
                match factory {
                    Ok(factory) => {
                        self.start_protocol(factory, recipients, args, parent);
                    }
                    Err(e) => {
                        error!(agent_id = %self.agent_id, error = %e, "Cannot start protocol");
                        let failure = match e {
                            AgencyError::Terminated(_) => ProtocolFailure::AgentTerminated,
                            other => ProtocolFailure::Remote(other.to_string()),
                        };
                        if let Some(parent) = parent {
                            if let Some(parent_protocol) = self.protocols.get_mut(&parent) {
                                parent_protocol.abort(failure);
                            }
                        }
                    }
                }
            }
            AgentCommand::ExpireNow { session_id } => {
                if let Some(protocol) = self.protocols.get_mut(&session_id) {
                    if !protocol.expire_now() {
                        protocol.abort(ProtocolFailure::Expired);
                    }
                }
            }
        }
    }

    fn retire(&mut self, session_id: &SessionId) {
        let Some(mut protocol) = self.protocols.remove(session_id) else {
            return;
        };
        let result = protocol
            .take_result()
            .unwrap_or(Err(ProtocolFailure::AgentTerminated));
        debug!(
            agent_id = %self.agent_id,
            session_id = %session_id,
            protocol_id = %protocol.protocol_id(),
            success = result.is_ok(),
            "Protocol retired"
        );
        for watcher in self.watchers.remove(session_id).unwrap_or_default() {
            let _ = watcher.send(result.clone());
        }
        if let Some(parent) = self.parents.remove(session_id) {
            if let Some(parent_protocol) = self.protocols.get_mut(&parent) {
                parent_protocol.on_child_finished(session_id, &result);
            }
        }
        self.parents.retain(|_, parent| *parent != *session_id);
        if let Some(key) = self.spawned_by.remove(session_id) {
            self.release_slot(&key, session_id);
        }
    }

    /// Frees the interest slot held by `session_id` and starts queued
    /// conversations while there is room.
    fn release_slot(&mut self, key: &InterestKey, session_id: &SessionId) {
        if let Some(interest) = self.interests.get_mut(key) {
            interest.live.remove(session_id);
        }
        loop {
            let next = match self.interests.get_mut(key) {
                Some(interest) if interest.has_capacity() => interest.queue.pop_front(),
                _ => None,
            };
            let Some(msg) = next else {
                break;
            };
            let now = self.medium.get_time();
            if msg.is_expired(now) {
                debug!(
                    agent_id = %self.agent_id,
                    protocol_id = %msg.protocol_id,
                    "Queued message expired while waiting, dropping"
                );
                continue;
            }
            self.spawn_interested(key, msg);
        }
    }
}

impl std::fmt::Debug for AgencyAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgencyAgent")
            .field("agent_id", &self.agent_id)
            .field("journal_id", self.recorder.journal_id())
            .field("protocols", &self.protocols.len())
            .field("interests", &self.interests.len())
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Notification interest backed by a closure.
pub struct NotificationFn<F>(pub F);

impl<F> NotificationHandler for NotificationFn<F>
where
    F: FnMut(&AgentMedium, &Message) + Send,
{
    fn notified(&mut self, medium: &AgentMedium, msg: &Message) {
        if msg.kind() == PayloadKind::Notification {
            (self.0)(medium, msg);
        } else {
            warn!(kind = %msg.kind(), "Not a notification, ignoring");
        }
    }
}
