//! # Core Types
//!
//! The domain objects produced by the investment pipeline. Nothing in this crate
//! knows about transports; the `events` crate maps these into wire envelopes.

pub mod enums;
pub mod error;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{AlertLevel, DecisionAction, HealthStatus, ProposalStatus};
pub use error::CoreError;
pub use structs::{Decision, Outcome, Proposal, RiskAssessment, Signal, SystemAlert, SystemStatus};
