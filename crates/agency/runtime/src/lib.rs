//! # Agency Runtime
//!
//! Hosts agents and the conversations they take part in.
//!
//! An [`Agency`] owns its agents, a shared [`Scheduler`] and a
//! [`Messaging`] transport. Each [`AgencyAgent`] routes incoming messages
//! to live protocols or spawns new ones from registered interests:
//!
//! - contract-net ([`AgencyManager`] and [`AgencyContractor`])
//! - request/reply ([`AgencyRequester`] and [`AgencyReplier`])
//! - retries with exponential backoff ([`RetryingProtocol`])
//!
//! Every entry point of an agent is a recorded call, so a journal kept by
//! the agency can be replayed against a freshly built agent.
//! [`driver::run`] drives an agency on tokio.

pub mod agency;
pub mod agent;
pub mod config;
pub mod contracts;
pub mod driver;
pub mod error;
pub mod interest;
pub mod machine;
pub mod medium;
pub mod messaging;
pub mod protocol;
pub mod requests;
pub mod retrying;
pub mod telemetry;
pub mod time;

pub use agency::Agency;
pub use agent::{AgencyAgent, NotificationFn};
pub use config::{AgencyConfig, KeeperKind, RetryConfig};
pub use contracts::{
    AgencyContractor, AgencyManager, Contractor, ContractorFactory, ContractorMedium,
    ContractorTimeouts, Manager, ManagerContractor, ManagerContractors, ManagerFactory,
    ManagerMedium, ManagerTimeouts,
};
pub use error::{AgencyError, AgencyResult, MessagingError};
pub use interest::Interest;
pub use machine::{StateMachine, Transition};
pub use medium::{AgentCommand, AgentMedium};
pub use messaging::{Binding, EmuMessaging, Messaging};
pub use protocol::{
    AgencyProtocol, InitiatorFactory, InterestFactory, NotificationHandler, ProtocolContext,
    ProtocolCore, ProtocolFailure, ProtocolHandle, ProtocolResult,
};
pub use requests::{
    AgencyReplier, AgencyRequester, Replier, ReplierFactory, ReplierMedium, Requester,
    RequesterFactory, RequesterMedium, RequesterTimeouts,
};
pub use retrying::{
    retried_protocol_id, RetryPolicy, RetryStatus, RetryingFactory, RetryingProtocol,
};
pub use telemetry::init_tracing;
pub use time::{CallId, Clock, DelayedCall, ManualClock, Scheduler, SystemClock, TimeSource, TokioClock};
