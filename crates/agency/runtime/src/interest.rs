//! Interests: what lets an agent accept new conversations.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use agency_types::{Message, PayloadKind, ProtocolType, SessionId};

use crate::messaging::Binding;
use crate::protocol::{InterestFactory, NotificationHandler};

pub(crate) enum InterestKind {
    Protocol(Arc<dyn InterestFactory>),
    Notification(Box<dyn NotificationHandler>),
}

/// A registered `(protocol_type, protocol_id)` an agent answers to.
pub struct Interest {
    pub(crate) kind: InterestKind,
    protocol_type: ProtocolType,
    protocol_id: String,
    concurrency: Option<usize>,
    pub(crate) binding: Option<Binding>,
    pub(crate) live: BTreeSet<SessionId>,
    pub(crate) queue: VecDeque<Message>,
}

impl Interest {
    pub(crate) fn new(
        kind: InterestKind,
        protocol_type: ProtocolType,
        protocol_id: impl Into<String>,
        concurrency: Option<usize>,
        binding: Option<Binding>,
    ) -> Self {
        Self {
            kind,
            protocol_type,
            protocol_id: protocol_id.into(),
            concurrency,
            binding,
            live: BTreeSet::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.protocol_type
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Public interests also receive broadcasts on their protocol id.
    pub fn is_public(&self) -> bool {
        self.binding.is_some()
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Kind of the message that opens a conversation.
    pub fn initiator(&self) -> PayloadKind {
        match &self.kind {
            InterestKind::Protocol(factory) => factory.initiator(),
            InterestKind::Notification(_) => PayloadKind::Notification,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Whether another conversation may start now.
    pub fn has_capacity(&self) -> bool {
        match self.concurrency {
            Some(limit) => self.live.len() < limit,
            None => true,
        }
    }
}

impl std::fmt::Debug for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interest")
            .field("protocol_type", &self.protocol_type)
            .field("protocol_id", &self.protocol_id)
            .field("concurrency", &self.concurrency)
            .field("live", &self.live.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}
