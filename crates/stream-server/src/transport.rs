//! The seam between the connection bookkeeping and the physical transport.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport is closed")]
    Closed,
    #[error("transport send buffer is full")]
    Full,
    #[error("transport write failed: {0}")]
    Write(String),
}

/// Write half of one registered connection.
///
/// The manager treats any error as evidence that the connection is dead.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_frame(&self, frame: &str) -> Result<(), DeliveryError>;
}

/// Hands frames to a per-connection writer task over a bounded channel.
///
/// The writer task owns the socket; when it stops (write error, peer gone)
/// the channel closes and the next frame fails with `Closed`. A writer that
/// falls `capacity` frames behind fails with `Full`.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send_frame(&self, frame: &str) -> Result<(), DeliveryError> {
        self.tx.try_send(frame.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
