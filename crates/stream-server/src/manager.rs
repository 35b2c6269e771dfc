use crate::error::ServerError;
use crate::queue::{Admission, OutboundQueue};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use crate::transport::{DeliveryError, EventSink};
use chrono::{DateTime, TimeDelta, Utc};
use configuration::ServerSettings;
use events::{Command, EventEnvelope, TopicSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Point-in-time counters for the socket side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub connections: usize,
    pub queue_depth: usize,
    pub dropped_events: u64,
}

/// Owns the bidirectional transport: connection lifecycle, inbound commands,
/// queued fan-out and eviction of dead or idle connections.
///
/// Lifecycle calls for one connection are expected in order (connect, messages,
/// disconnect) from that connection's reader task. Fan-out and sweeps work on
/// registry snapshots and may run concurrently with them.
pub struct StreamingManager {
    registry: ConnectionRegistry,
    queue: OutboundQueue,
    /// Serialises queue drains so per-connection delivery stays FIFO.
    drain_lock: Mutex<()>,
    drain_interval: Duration,
    sweep_interval: Duration,
    idle_timeout: TimeDelta,
    max_delivery_failures: u32,
}

impl StreamingManager {
    pub fn new(settings: &ServerSettings) -> Self {
        let idle_timeout =
            TimeDelta::from_std(settings.idle_timeout()).unwrap_or_else(|_| TimeDelta::days(36_500));
        Self {
            registry: ConnectionRegistry::new(),
            queue: OutboundQueue::new(settings.queue_capacity, settings.overflow_policy),
            drain_lock: Mutex::new(()),
            drain_interval: settings.drain_interval(),
            sweep_interval: settings.sweep_interval(),
            idle_timeout,
            max_delivery_failures: settings.max_delivery_failures.max(1),
        }
    }

    /// Registers a new socket session subscribed to every topic and greets it.
    ///
    /// If the greeting cannot be written the session is not registered.
    pub async fn handle_connect(
        &self,
        user_id: Option<String>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ConnectionId, ServerError> {
        self.handle_connect_with(user_id, None, sink).await
    }

    /// Like [`Self::handle_connect`], starting from `subscriptions` when the
    /// handshake named a set, even an empty one. Reconnecting clients use it to
    /// keep a narrowed subscription.
    pub async fn handle_connect_with(
        &self,
        user_id: Option<String>,
        subscriptions: Option<TopicSet>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ConnectionId, ServerError> {
        let mut connection = Connection::new(user_id, Utc::now());
        if let Some(subscriptions) = subscriptions {
            connection = connection.with_subscriptions(subscriptions);
        }
        let connection_id = connection.connection_id;

        let welcome = EventEnvelope::welcome(&connection.subscriptions).to_json()?;
        sink.send_frame(&welcome)
            .await
            .map_err(|e| ServerError::Handshake(e.to_string()))?;

        info!(
            connection_id = %connection_id,
            user_id = %connection.user_id,
            "Socket connection established."
        );
        self.registry.insert(connection, sink).await;
        Ok(connection_id)
    }

    /// Handles one inbound frame. Malformed and unknown commands are logged and ignored.
    pub async fn handle_message(
        &self,
        connection_id: ConnectionId,
        raw: &str,
    ) -> Result<(), ServerError> {
        let now = Utc::now();
        self.registry
            .update(&connection_id, |c| c.touch(now))
            .await
            .ok_or(ServerError::UnknownConnection(connection_id))?;

        let command = match Command::parse(raw) {
            Ok(command) => command,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Ignoring inbound message.");
                return Ok(());
            }
        };
        debug!(connection_id = %connection_id, command = command.name(), "Command received.");

        let topics = command.topics();
        let reply = match command {
            Command::Subscribe { .. } => {
                let subscriptions = self
                    .registry
                    .update(&connection_id, |c| {
                        c.subscriptions.extend(topics);
                        c.subscriptions.clone()
                    })
                    .await
                    .ok_or(ServerError::UnknownConnection(connection_id))?;
                EventEnvelope::subscription_updated(&subscriptions)
            }
            Command::Unsubscribe { .. } => {
                let subscriptions = self
                    .registry
                    .update(&connection_id, |c| {
                        c.subscriptions.retain(|t| !topics.contains(t));
                        c.subscriptions.clone()
                    })
                    .await
                    .ok_or(ServerError::UnknownConnection(connection_id))?;
                EventEnvelope::subscription_updated(&subscriptions)
            }
            Command::Ping { data } => EventEnvelope::pong(data.timestamp),
        };

        self.reply(connection_id, &reply).await;
        Ok(())
    }

    /// Forgets a connection. Returns `false` if it was already gone.
    pub async fn handle_disconnect(&self, connection_id: ConnectionId) -> bool {
        match self.registry.remove(&connection_id).await {
            Some(connection) => {
                info!(
                    connection_id = %connection_id,
                    user_id = %connection.user_id,
                    "Socket connection closed."
                );
                true
            }
            None => false,
        }
    }

    /// Queues an envelope for fan-out on the next drain. Never blocks.
    pub fn publish(&self, envelope: EventEnvelope) -> Result<(), ServerError> {
        let id = envelope.id;
        match self.queue.push(envelope) {
            Admission::Rejected => Err(ServerError::QueueFull(id)),
            Admission::Queued | Admission::DisplacedOldest => Ok(()),
        }
    }

    /// Fans out everything queued so far, oldest first. Returns the number of envelopes processed.
    pub async fn drain_queue(&self) -> usize {
        let _guard = self.drain_lock.lock().await;
        let batch = self.queue.drain();
        let processed = batch.len();
        for envelope in &batch {
            self.fan_out(envelope).await;
        }
        processed
    }

    /// Delivers one envelope to every matching connection. Returns the number of successful writes.
    async fn fan_out(&self, envelope: &EventEnvelope) -> usize {
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!(event_id = %envelope.id, error = %e, "Failed to serialize event, skipping.");
                return 0;
            }
        };

        let targets = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|(c, _)| envelope.is_deliverable_to(&c.user_id, &c.subscriptions));

        let mut delivered = 0;
        for (connection, sink) in targets {
            match sink.send_frame(&frame).await {
                Ok(()) => {
                    delivered += 1;
                    if connection.consecutive_failures > 0 {
                        self.registry.record_success(&connection.connection_id).await;
                    }
                }
                Err(e) => self.delivery_failed(connection.connection_id, e).await,
            }
        }
        debug!(event_id = %envelope.id, event_type = %envelope.kind, delivered, "Event fanned out.");
        delivered
    }

    /// Sends a protocol reply straight to one connection, bypassing the queue.
    async fn reply(&self, connection_id: ConnectionId, envelope: &EventEnvelope) {
        let Some(sink) = self.registry.sink(&connection_id).await else {
            return;
        };
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!(connection_id = %connection_id, error = %e, "Failed to serialize reply.");
                return;
            }
        };
        if let Err(e) = sink.send_frame(&frame).await {
            self.delivery_failed(connection_id, e).await;
        }
    }

    async fn delivery_failed(&self, connection_id: ConnectionId, cause: DeliveryError) {
        let Some(failures) = self.registry.record_failure(&connection_id).await else {
            return;
        };
        if failures >= self.max_delivery_failures {
            if self.registry.remove(&connection_id).await.is_some() {
                warn!(
                    connection_id = %connection_id,
                    error = %cause,
                    failures,
                    "Evicting connection after failed delivery."
                );
            }
        } else {
            warn!(connection_id = %connection_id, error = %cause, failures, "Delivery failed.");
        }
    }

    /// Removes every connection with no inbound activity for longer than the idle timeout.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for connection_id in self.registry.idle_connections(now, self.idle_timeout).await {
            if let Some(connection) = self.registry.remove(&connection_id).await {
                info!(
                    connection_id = %connection_id,
                    last_activity = %connection.last_activity,
                    "Removing inactive connection."
                );
                evicted += 1;
            }
        }
        evicted
    }

    /// Starts the queue drain loop and the idle sweep.
    ///
    /// Both stop when `shutdown` flips to `true` (or its sender is dropped);
    /// the drain loop flushes the queue once more on the way out.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let drain = {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = interval(manager.drain_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            manager.drain_queue().await;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                manager.drain_queue().await;
                                break;
                            }
                        }
                    }
                }
                debug!("Queue drain worker stopped.");
            })
        };

        let sweep = {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let period = manager.sweep_interval;
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let evicted = manager.evict_idle(Utc::now()).await;
                            if evicted > 0 {
                                info!(evicted, "Idle sweep finished.");
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Idle sweep worker stopped.");
            })
        };

        vec![drain, sweep]
    }

    pub async fn connection(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.registry.get(connection_id).await
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            connections: self.registry.len().await,
            queue_depth: self.queue.depth(),
            dropped_events: self.queue.dropped(),
        }
    }
}
