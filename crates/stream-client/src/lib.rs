//! # Stream Client
//!
//! Consumer side of the event stream. A `StreamingClient` keeps a WebSocket and
//! a Server-Sent-Events stream open against the stream server, reconnects them
//! with exponential backoff, and hands each event's payload to handlers
//! registered per event type.

pub mod backoff;
mod client;
pub mod dispatch;
pub mod error;
pub mod sse;

// --- Public API ---
pub use backoff::ReconnectPolicy;
pub use client::{ClientStatus, ConnectionState, StreamingClient, Transport, TransportStatus};
pub use configuration::ClientSettings as ClientConfig;
pub use dispatch::HandlerId;
pub use error::ClientError;
