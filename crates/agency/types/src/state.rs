//! Closed state sets of the protocol roles.

use serde::{Deserialize, Serialize};

/// State of either side of a contract.
///
/// The manager moves through `Initiated, Announced, Closed | Expired,
/// Granted, Completed | Cancelled | Aborted, Terminated`; the contractor
/// through `Initiated, Announced, Bid | Refused | Delegated, Rejected |
/// Granted | Expired, Completed | Defected | Cancelled, Acknowledged |
/// Aborted`. `Wtf` is reachable from any inconsistent transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Initiated,
    Announced,
    Closed,
    Expired,
    Granted,
    Completed,
    Cancelled,
    Aborted,
    Terminated,
    Bid,
    Refused,
    Rejected,
    Delegated,
    Acknowledged,
    Defected,
    Wtf,
}

impl ContractState {
    /// States after which a manager has nothing left to finalize.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ContractState::Expired
                | ContractState::Cancelled
                | ContractState::Aborted
                | ContractState::Wtf
        )
    }
}

/// Per-bidder state kept by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractorState {
    Bid,
    Refused,
    Rejected,
    Elected,
    Granted,
    Completed,
    Acknowledged,
    Cancelled,
}

/// State of either side of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    None,
    Requested,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_states() {
        assert!(ContractState::Wtf.is_failed());
        assert!(ContractState::Expired.is_failed());
        assert!(!ContractState::Completed.is_failed());
        assert!(!ContractState::Terminated.is_failed());
    }

    #[test]
    fn test_states_serialize_snake_case() {
        let json = serde_json::to_string(&ContractState::Wtf).unwrap();
        assert_eq!(json, "\"wtf\"");
        let back: ContractorState = serde_json::from_str("\"elected\"").unwrap();
        assert_eq!(back, ContractorState::Elected);
    }
}
