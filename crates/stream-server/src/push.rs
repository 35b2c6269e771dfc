use crate::registry::{ConnectionId, ANONYMOUS_USER};
use events::{EventEnvelope, TopicSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PushConnection {
    user_id: String,
    subscriptions: TopicSet,
    tx: mpsc::Sender<EventEnvelope>,
}

/// Server-to-client event streams (SSE).
///
/// Each stream's subscriptions are fixed when it opens. Publishing bypasses the
/// socket queue and writes straight into each stream's bounded channel; a stream
/// whose channel is closed or full is dropped.
pub struct PushStreamHandler {
    connections: RwLock<HashMap<ConnectionId, PushConnection>>,
    buffer: usize,
    default_subscriptions: TopicSet,
}

impl PushStreamHandler {
    pub fn new(buffer: usize, default_subscriptions: TopicSet) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            default_subscriptions,
        }
    }

    /// Opens a stream and returns the receiver feeding it.
    ///
    /// The `connection` envelope is already waiting in the receiver. Only an absent
    /// subscription set falls back to the configured defaults; an empty one stays empty.
    pub fn open(
        &self,
        user_id: Option<String>,
        subscriptions: Option<TopicSet>,
    ) -> (ConnectionId, mpsc::Receiver<EventEnvelope>) {
        let user_id = user_id
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());
        let subscriptions =
            subscriptions.unwrap_or_else(|| self.default_subscriptions.clone());

        let (tx, rx) = mpsc::channel(self.buffer);
        // The channel is fresh and has at least one slot.
        let _ = tx.try_send(EventEnvelope::push_connected(&subscriptions));

        let id = Uuid::new_v4();
        info!(
            connection_id = %id,
            user_id = %user_id,
            subscriptions = ?subscriptions,
            "Push stream opened."
        );
        self.connections.write().insert(
            id,
            PushConnection {
                user_id,
                subscriptions,
                tx,
            },
        );
        (id, rx)
    }

    /// Forgets a stream. Returns `false` if it was already gone.
    pub fn close(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().remove(id).is_some();
        if removed {
            info!(connection_id = %id, "Push stream closed.");
        }
        removed
    }

    /// Writes the envelope to every matching stream. Returns how many accepted it.
    pub fn publish(&self, envelope: &EventEnvelope) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let connections = self.connections.read();
            for (id, conn) in connections.iter() {
                if !envelope.is_deliverable_to(&conn.user_id, &conn.subscriptions) {
                    continue;
                }
                match conn.tx.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Closed(_)) => dead.push((*id, "closed")),
                    Err(TrySendError::Full(_)) => dead.push((*id, "lagging")),
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write();
            for (id, reason) in dead {
                if connections.remove(&id).is_some() {
                    warn!(connection_id = %id, reason, "Dropping push stream.");
                }
            }
        }

        debug!(event_id = %envelope.id, event_type = %envelope.kind, delivered, "Pushed event.");
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}
