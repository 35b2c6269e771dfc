//! # Events
//!
//! The wire language shared by the streaming server and its clients: topics,
//! the `EventEnvelope` pushed server to client, the `Command`s a client sends
//! back over the socket, and the mapping from domain objects to envelope payloads.
//!
//! Depends only on `core-types`.

pub mod command;
pub mod error;
pub mod messages;
pub mod payload;
pub mod topic;

pub use command::{Command, PingData};
pub use error::EventsError;
pub use messages::EventEnvelope;
pub use payload::{
    DecisionData, EventPayload, OutcomeData, ProposalData, RiskData, SignalData, SystemData,
};
pub use topic::{EventKind, Topic, TopicSet};
