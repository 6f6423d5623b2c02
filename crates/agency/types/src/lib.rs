//! # Agency Types
//!
//! Value types shared by the agency runtime and its journal: agent and
//! session identifiers, recipients, protocol messages and the closed
//! state sets of every protocol role.

pub mod ids;
pub mod message;
pub mod recipient;
pub mod state;

pub use ids::{AgentId, ProtocolType, SessionId};
pub use message::{Message, Payload, PayloadKind};
pub use recipient::{Recipient, RecipientType};
pub use state::{ContractState, ContractorState, RequestState};

agency_serialization::impl_snapshot_via_serde!(
    AgentId,
    SessionId,
    ProtocolType,
    Recipient,
    Message,
    ContractState,
    ContractorState,
    RequestState,
);

#[cfg(test)]
mod tests {
    use super::*;
    use agency_serialization::{freeze, thaw, Registry};

    #[test]
    fn test_message_freezes_into_journal_tree() {
        let mut msg = Message::announcement(serde_json::json!({"task": "fetch"}))
            .with_protocol_id("lookup");
        msg.reply_to = Some(Recipient::agent(&AgentId::new("m"), "lobby"));
        msg.expiration_time = Some(12.5);

        let tree = freeze(&msg).unwrap();
        let back: Message = thaw(&tree, &Registry::permissive()).unwrap();
        assert_eq!(back, msg);
    }
}
