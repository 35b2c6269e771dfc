use crate::transport::EventSink;
use chrono::{DateTime, TimeDelta, Utc};
use events::{Topic, TopicSet};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Identity used for handshakes that do not name a user.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Server-side state of one physical socket session.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub subscriptions: TopicSet,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Write failures since the last successful write.
    pub consecutive_failures: u32,
}

impl Connection {
    /// A fresh connection subscribed to every domain topic.
    pub fn new(user_id: Option<String>, now: DateTime<Utc>) -> Self {
        let user_id = user_id
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            subscriptions: Topic::all(),
            last_activity: now,
            created_at: now,
            consecutive_failures: 0,
        }
    }

    /// Replaces the initial subscriptions. An empty set subscribes to nothing.
    pub fn with_subscriptions(mut self, subscriptions: TopicSet) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Records inbound activity. Never moves `last_activity` backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>, threshold: TimeDelta) -> bool {
        now - self.last_activity > threshold
    }
}

struct Entry {
    connection: Connection,
    sink: Arc<dyn EventSink>,
}

/// The table of live socket connections and their write halves.
///
/// Readers get owned snapshots, so fan-out and sweeps can remove entries while
/// they walk the result.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connection: Connection, sink: Arc<dyn EventSink>) {
        let id = connection.connection_id;
        self.entries.write().await.insert(id, Entry { connection, sink });
    }

    /// Removes a connection, returning it if it was still registered.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.entries.write().await.remove(id).map(|e| e.connection)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.entries.read().await.get(id).map(|e| e.connection.clone())
    }

    pub async fn sink(&self, id: &ConnectionId) -> Option<Arc<dyn EventSink>> {
        self.entries.read().await.get(id).map(|e| Arc::clone(&e.sink))
    }

    /// Applies `f` to a registered connection.
    pub async fn update<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        self.entries
            .write()
            .await
            .get_mut(id)
            .map(|e| f(&mut e.connection))
    }

    /// Copies of every connection with its sink.
    pub async fn snapshot(&self) -> Vec<(Connection, Arc<dyn EventSink>)> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| (e.connection.clone(), Arc::clone(&e.sink)))
            .collect()
    }

    pub async fn idle_connections(
        &self,
        now: DateTime<Utc>,
        threshold: TimeDelta,
    ) -> Vec<ConnectionId> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.connection.is_idle(now, threshold))
            .map(|e| e.connection.connection_id)
            .collect()
    }

    /// Counts a failed write, returning the new consecutive failure count.
    pub async fn record_failure(&self, id: &ConnectionId) -> Option<u32> {
        self.update(id, |c| {
            c.consecutive_failures += 1;
            c.consecutive_failures
        })
        .await
    }

    pub async fn record_success(&self, id: &ConnectionId) {
        self.update(id, |c| c.consecutive_failures = 0).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
