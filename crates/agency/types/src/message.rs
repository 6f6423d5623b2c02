//! Protocol messages.
//!
//! A message is a value: senders hand over a copy and keep no handle on
//! what was transmitted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ProtocolType, SessionId};
use crate::recipient::Recipient;

/// Concrete payload of a message, one variant per message kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Announcement {
        /// Increased every time the contract is nested into another shard.
        #[serde(default)]
        level: u32,
        /// How many more times the contract may be nested; `None` is unbounded.
        #[serde(default)]
        max_distance: Option<u32>,
        #[serde(default)]
        body: Value,
    },
    Bid {
        cost: f64,
        #[serde(default)]
        body: Value,
    },
    Grant {
        /// Index of the granted bid among the bids the contractor sent.
        #[serde(default)]
        bid_index: usize,
        /// Seconds between the progress reports the contractor sends while
        /// working. `None` asks for no reports.
        #[serde(default)]
        update_report: Option<f64>,
        #[serde(default)]
        body: Value,
    },
    Rejection {
        #[serde(default)]
        body: Value,
    },
    Cancellation {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        body: Value,
    },
    FinalReport {
        #[serde(default)]
        body: Value,
    },
    UpdateReport {
        #[serde(default)]
        body: Value,
    },
    Acknowledgement {
        #[serde(default)]
        body: Value,
    },
    Duplicate {
        #[serde(default)]
        body: Value,
    },
    Refusal {
        #[serde(default)]
        body: Value,
    },
    RequestMessage {
        #[serde(default)]
        body: Value,
    },
    ResponseMessage {
        #[serde(default)]
        body: Value,
    },
    Notification {
        #[serde(default)]
        body: Value,
    },
}

/// Payload discriminant without data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Announcement,
    Bid,
    Grant,
    Rejection,
    Cancellation,
    FinalReport,
    UpdateReport,
    Acknowledgement,
    Duplicate,
    Refusal,
    RequestMessage,
    ResponseMessage,
    Notification,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Announcement { .. } => PayloadKind::Announcement,
            Payload::Bid { .. } => PayloadKind::Bid,
            Payload::Grant { .. } => PayloadKind::Grant,
            Payload::Rejection { .. } => PayloadKind::Rejection,
            Payload::Cancellation { .. } => PayloadKind::Cancellation,
            Payload::FinalReport { .. } => PayloadKind::FinalReport,
            Payload::UpdateReport { .. } => PayloadKind::UpdateReport,
            Payload::Acknowledgement { .. } => PayloadKind::Acknowledgement,
            Payload::Duplicate { .. } => PayloadKind::Duplicate,
            Payload::Refusal { .. } => PayloadKind::Refusal,
            Payload::RequestMessage { .. } => PayloadKind::RequestMessage,
            Payload::ResponseMessage { .. } => PayloadKind::ResponseMessage,
            Payload::Notification { .. } => PayloadKind::Notification,
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Payload::Announcement { body, .. }
            | Payload::Bid { body, .. }
            | Payload::Grant { body, .. }
            | Payload::Rejection { body }
            | Payload::Cancellation { body, .. }
            | Payload::FinalReport { body }
            | Payload::UpdateReport { body }
            | Payload::Acknowledgement { body }
            | Payload::Duplicate { body }
            | Payload::Refusal { body }
            | Payload::RequestMessage { body }
            | Payload::ResponseMessage { body }
            | Payload::Notification { body } => body,
        }
    }
}

impl PayloadKind {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            PayloadKind::RequestMessage | PayloadKind::ResponseMessage => ProtocolType::Request,
            PayloadKind::Notification => ProtocolType::Notification,
            // a duplicate answers whichever dialog it was raised in; the
            // sender overrides this when building one
            _ => ProtocolType::Contract,
        }
    }

    /// Kinds that open a new conversation and carry a traversal id.
    pub fn is_first_message(&self) -> bool {
        matches!(
            self,
            PayloadKind::Announcement | PayloadKind::RequestMessage | PayloadKind::Notification
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PayloadKind::Announcement => "Announcement",
            PayloadKind::Bid => "Bid",
            PayloadKind::Grant => "Grant",
            PayloadKind::Rejection => "Rejection",
            PayloadKind::Cancellation => "Cancellation",
            PayloadKind::FinalReport => "FinalReport",
            PayloadKind::UpdateReport => "UpdateReport",
            PayloadKind::Acknowledgement => "Acknowledgement",
            PayloadKind::Duplicate => "Duplicate",
            PayloadKind::Refusal => "Refusal",
            PayloadKind::RequestMessage => "RequestMessage",
            PayloadKind::ResponseMessage => "ResponseMessage",
            PayloadKind::Notification => "Notification",
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: Option<String>,
    pub protocol_type: ProtocolType,
    #[serde(default)]
    pub protocol_id: String,
    #[serde(default)]
    pub sender_id: Option<SessionId>,
    #[serde(default)]
    pub receiver_id: Option<SessionId>,
    #[serde(default)]
    pub reply_to: Option<Recipient>,
    /// Absolute time after which the message is dropped on receipt.
    #[serde(default)]
    pub expiration_time: Option<f64>,
    /// Correlation id used to detect conversations already served.
    #[serde(default)]
    pub traversal_id: Option<String>,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: None,
            protocol_type: payload.kind().protocol_type(),
            protocol_id: String::new(),
            sender_id: None,
            receiver_id: None,
            reply_to: None,
            expiration_time: None,
            traversal_id: None,
            payload,
        }
    }

    pub fn announcement(body: Value) -> Self {
        Self::new(Payload::Announcement {
            level: 0,
            max_distance: None,
            body,
        })
    }

    pub fn bid(cost: f64, body: Value) -> Self {
        Self::new(Payload::Bid { cost, body })
    }

    pub fn grant(body: Value) -> Self {
        Self::new(Payload::Grant {
            bid_index: 0,
            update_report: None,
            body,
        })
    }

    /// Grant asking the contractor for a progress report every
    /// `frequency` seconds.
    pub fn grant_with_updates(body: Value, frequency: f64) -> Self {
        Self::new(Payload::Grant {
            bid_index: 0,
            update_report: Some(frequency),
            body,
        })
    }

    pub fn rejection() -> Self {
        Self::new(Payload::Rejection { body: Value::Null })
    }

    pub fn refusal() -> Self {
        Self::new(Payload::Refusal { body: Value::Null })
    }

    pub fn cancellation(reason: Option<String>) -> Self {
        Self::new(Payload::Cancellation {
            reason,
            body: Value::Null,
        })
    }

    pub fn final_report(body: Value) -> Self {
        Self::new(Payload::FinalReport { body })
    }

    pub fn update_report(body: Value) -> Self {
        Self::new(Payload::UpdateReport { body })
    }

    pub fn acknowledgement() -> Self {
        Self::new(Payload::Acknowledgement { body: Value::Null })
    }

    pub fn request(body: Value) -> Self {
        Self::new(Payload::RequestMessage { body })
    }

    pub fn response(body: Value) -> Self {
        Self::new(Payload::ResponseMessage { body })
    }

    pub fn notification(body: Value) -> Self {
        Self::new(Payload::Notification { body })
    }

    pub fn with_protocol_id(mut self, protocol_id: impl Into<String>) -> Self {
        self.protocol_id = protocol_id.into();
        self
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn body(&self) -> &Value {
        self.payload.body()
    }

    /// Cost of a bid, `None` for other kinds.
    pub fn cost(&self) -> Option<f64> {
        match &self.payload {
            Payload::Bid { cost, .. } => Some(*cost),
            _ => None,
        }
    }

    /// Reporting frequency requested by a grant.
    pub fn update_report_frequency(&self) -> Option<f64> {
        match &self.payload {
            Payload::Grant { update_report, .. } => *update_report,
            _ => None,
        }
    }

    pub fn is_expired(&self, now: f64) -> bool {
        self.expiration_time.is_some_and(|at| at < now)
    }

    /// Copy safe to modify and send as another message.
    pub fn duplicate(&self) -> Self {
        let mut msg = self.clone();
        msg.message_id = None;
        msg.reply_to = None;
        msg
    }

    /// Copy keeping the reply-to address, used when handing a dialog over.
    pub fn duplicate_for_handover(&self) -> Self {
        let mut msg = self.clone();
        msg.message_id = None;
        msg
    }

    /// Reply sent back when a first message arrives for a conversation
    /// that was already served.
    pub fn duplication_message(&self) -> Option<(Recipient, Message)> {
        let reply_to = self.reply_to.clone()?;
        let mut msg = Message::new(Payload::Duplicate { body: Value::Null });
        msg.protocol_type = self.protocol_type;
        msg.protocol_id = self.protocol_id.clone();
        msg.expiration_time = self.expiration_time;
        msg.receiver_id = self.sender_id.clone();
        Some((reply_to, msg))
    }

    /// Picks the `number` cheapest bids, keeping arrival order among
    /// equal costs. Messages that are not bids are skipped.
    pub fn pick_best(bids: &[Message], number: usize) -> Vec<Message> {
        let mut costed: Vec<(f64, &Message)> = bids
            .iter()
            .filter_map(|bid| bid.cost().map(|cost| (cost, bid)))
            .collect();
        costed.sort_by(|a, b| a.0.total_cmp(&b.0));
        costed
            .into_iter()
            .take(number)
            .map(|(_, bid)| bid.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;
    use serde_json::json;

    #[test]
    fn test_duplicate_clears_identity_and_reply_to() {
        let mut msg = Message::bid(3.0, json!({"slot": 1}));
        msg.message_id = Some("m1".into());
        msg.reply_to = Some(Recipient::agent(&AgentId::new("a"), "lobby"));

        let copy = msg.duplicate();
        assert_eq!(copy.message_id, None);
        assert_eq!(copy.reply_to, None);
        assert_eq!(copy.payload, msg.payload);

        let handover = msg.duplicate_for_handover();
        assert_eq!(handover.reply_to, msg.reply_to);
    }

    #[test]
    fn test_expiration_is_strict() {
        let mut msg = Message::request(json!(null));
        assert!(!msg.is_expired(100.0));
        msg.expiration_time = Some(100.0);
        assert!(!msg.is_expired(100.0));
        assert!(msg.is_expired(100.5));
    }

    #[test]
    fn test_pick_best_orders_by_cost() {
        let bids = vec![
            Message::bid(5.0, json!("a")),
            Message::bid(1.0, json!("b")),
            Message::bid(3.0, json!("c")),
            Message::bid(1.0, json!("d")),
        ];
        let best = Message::pick_best(&bids, 3);
        let bodies: Vec<_> = best.iter().map(|b| b.body().clone()).collect();
        assert_eq!(bodies, vec![json!("b"), json!("d"), json!("c")]);
        assert!(Message::pick_best(&bids, 0).is_empty());
        assert_eq!(Message::pick_best(&bids, 10).len(), 4);
    }

    #[test]
    fn test_duplication_message_targets_sender() {
        let mut msg = Message::announcement(json!({}));
        msg.protocol_id = "lookup".into();
        msg.sender_id = Some(SessionId::from("s1"));
        msg.reply_to = Some(Recipient::agent(&AgentId::new("m"), "lobby"));
        msg.expiration_time = Some(10.0);

        let (to, dup) = msg.duplication_message().unwrap();
        assert_eq!(to, Recipient::agent(&AgentId::new("m"), "lobby"));
        assert_eq!(dup.kind(), PayloadKind::Duplicate);
        assert_eq!(dup.receiver_id, Some(SessionId::from("s1")));
        assert_eq!(dup.protocol_id, "lookup");
        assert_eq!(dup.expiration_time, Some(10.0));
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let msg = Message::cancellation(Some("busy".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["type"], "cancellation");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
