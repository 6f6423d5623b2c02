use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    Agent,
    Broadcast,
}

/// Message destination: a routing key inside a shard.
///
/// An agent recipient's key is the agent id; a broadcast recipient's key is
/// the protocol id, reaching every agent with a public interest in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub key: String,
    pub route: String,
    pub recipient_type: RecipientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Recipient {
    pub fn agent(agent_id: &AgentId, route: impl Into<String>) -> Self {
        Self {
            key: agent_id.0.clone(),
            route: route.into(),
            recipient_type: RecipientType::Agent,
            channel: None,
        }
    }

    pub fn broadcast(protocol_id: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            key: protocol_id.into(),
            route: route.into(),
            recipient_type: RecipientType::Broadcast,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_type == RecipientType::Broadcast
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_structural() {
        let id = AgentId::new("a1");
        assert_eq!(Recipient::agent(&id, "lobby"), Recipient::agent(&id, "lobby"));
        assert_ne!(Recipient::agent(&id, "lobby"), Recipient::agent(&id, "other"));
        assert_ne!(
            Recipient::agent(&id, "lobby"),
            Recipient::broadcast("a1", "lobby")
        );
    }
}
