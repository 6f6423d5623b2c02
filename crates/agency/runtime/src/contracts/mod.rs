//! Contract-net: a manager announces a job, contractors bid, the manager
//! grants some bids and rejects the rest, granted contractors report and
//! get acknowledged.

pub mod contractor;
pub mod manager;

use serde::{Deserialize, Serialize};

pub use contractor::{AgencyContractor, Contractor, ContractorFactory, ContractorMedium};
pub use manager::{
    AgencyManager, Manager, ManagerContractor, ManagerContractors, ManagerFactory, ManagerMedium,
};

/// Timeouts of the manager side, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManagerTimeouts {
    /// Time `initiate()` has to announce.
    #[serde(default = "default_timeout")]
    pub initiate: f64,
    /// Length of the announce window.
    #[serde(default = "default_timeout")]
    pub announce: f64,
    /// Time granted contractors have to report.
    #[serde(default = "default_timeout")]
    pub grant: f64,
}

fn default_timeout() -> f64 {
    10.0
}

impl Default for ManagerTimeouts {
    fn default() -> Self {
        Self {
            initiate: default_timeout(),
            announce: default_timeout(),
            grant: default_timeout(),
        }
    }
}

/// Timeouts of the contractor side, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContractorTimeouts {
    /// Validity of a bid, and of a final report waiting for its ack.
    #[serde(default = "default_timeout")]
    pub bid: f64,
}

impl Default for ContractorTimeouts {
    fn default() -> Self {
        Self {
            bid: default_timeout(),
        }
    }
}
