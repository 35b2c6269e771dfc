use crate::backoff::ReconnectPolicy;
use crate::dispatch::{Dispatcher, HandlerId, RecentIds};
use crate::error::ClientError;
use crate::sse::SseDecoder;
use chrono::Utc;
use configuration::ClientSettings;
use events::{Command, EventEnvelope, EventKind, Topic, TopicSet};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// The two transports a client keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    /// Bidirectional WebSocket.
    #[serde(rename = "websocket")]
    Socket,
    /// Server-Sent Events.
    #[serde(rename = "sse")]
    Push,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Socket => "websocket",
            Transport::Push => "sse",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
    pub state: ConnectionState,
    /// Reconnection attempts since the last successful connection.
    pub reconnect_attempts: u32,
}

/// Snapshot returned by [`StreamingClient::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub user_id: String,
    pub socket: TransportStatus,
    pub push: TransportStatus,
    pub subscriptions: Vec<String>,
    pub queued_commands: usize,
}

/// Commands waiting for the socket, and the live session's writer once there is one.
#[derive(Default)]
struct Outbox {
    queued: VecDeque<Command>,
    live: Option<mpsc::UnboundedSender<Command>>,
}

/// How a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

/// State shared between the public handle and the transport tasks.
///
/// Locks are never held across an `.await`, and never two at a time.
struct Shared {
    settings: ClientSettings,
    subscriptions: Mutex<TopicSet>,
    outbox: Mutex<Outbox>,
    socket: Mutex<TransportStatus>,
    push: Mutex<TransportStatus>,
    dispatcher: Dispatcher,
    recent: Mutex<RecentIds>,
}

impl Shared {
    fn new(settings: ClientSettings) -> Self {
        let subscriptions = Topic::parse_lenient(&settings.subscriptions);
        let recent = RecentIds::new(settings.dedup_window);
        Self {
            settings,
            subscriptions: Mutex::new(subscriptions),
            outbox: Mutex::new(Outbox::default()),
            socket: Mutex::new(TransportStatus::default()),
            push: Mutex::new(TransportStatus::default()),
            dispatcher: Dispatcher::default(),
            recent: Mutex::new(recent),
        }
    }

    fn status_of(&self, transport: Transport) -> &Mutex<TransportStatus> {
        match transport {
            Transport::Socket => &self.socket,
            Transport::Push => &self.push,
        }
    }

    fn set_state(&self, transport: Transport, state: ConnectionState) {
        self.status_of(transport).lock().state = state;
    }

    fn set_attempts(&self, transport: Transport, attempts: u32) {
        self.status_of(transport).lock().reconnect_attempts = attempts;
    }

    fn subscriptions(&self) -> TopicSet {
        self.subscriptions.lock().clone()
    }

    /// Raises a `connection`, `disconnection` or `error` pseudo-event.
    fn emit_local(&self, kind: EventKind, transport: Transport, extra: Option<String>) {
        let mut data = json!({ "transport": transport.as_str() });
        if let Some(error) = extra {
            data["error"] = Value::String(error);
        }
        self.dispatcher.emit(kind, &data);
    }

    /// Sends over the live socket session, or queues until the next one.
    fn send_or_queue(&self, mut command: Command) {
        let mut outbox = self.outbox.lock();
        if let Some(live) = outbox.live.take() {
            match live.send(command) {
                Ok(()) => {
                    outbox.live = Some(live);
                    return;
                }
                // The session ended between its last read and now.
                Err(mpsc::error::SendError(returned)) => command = returned,
            }
        }
        debug!(command = command.name(), "Socket not connected, queueing command.");
        outbox.queued.push_back(command);
    }

    /// Detaches the ending socket session. Commands it never wrote (the one whose
    /// write failed, then whatever was still buffered) go back to the front of
    /// the queue in their original order.
    fn close_session(&self, rx: &mut mpsc::UnboundedReceiver<Command>, failed: Option<Command>) {
        let mut outbox = self.outbox.lock();
        outbox.live = None;
        rx.close();
        let mut unsent: Vec<Command> = failed.into_iter().collect();
        while let Ok(command) = rx.try_recv() {
            unsent.push(command);
        }
        if !unsent.is_empty() {
            debug!(count = unsent.len(), "Re-queueing unsent commands.");
        }
        for command in unsent.into_iter().rev() {
            outbox.queued.push_front(command);
        }
    }

    /// Decodes and dispatches one inbound envelope. Returns its kind unless it
    /// was malformed or a duplicate.
    fn handle_frame(&self, transport: Transport, raw: &str) -> Option<EventKind> {
        let envelope = match EventEnvelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(transport = transport.as_str(), error = %e, "Failed to parse inbound frame.");
                return None;
            }
        };
        if !self.recent.lock().insert(envelope.id) {
            debug!(transport = transport.as_str(), event_id = %envelope.id, "Duplicate envelope skipped.");
            return None;
        }

        if envelope.kind == EventKind::SubscriptionUpdated {
            if let Some(names) = envelope.data["subscriptions"].as_array() {
                let updated = Topic::parse_lenient(names.iter().filter_map(Value::as_str));
                debug!(subscriptions = ?updated, "Subscriptions updated by server.");
                *self.subscriptions.lock() = updated;
            }
        }

        self.dispatcher.emit(envelope.kind, &envelope.data);
        Some(envelope.kind)
    }

    fn socket_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.settings.ws_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }
        self.append_handshake(&mut url);
        Ok(url)
    }

    fn push_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.settings.sse_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }
        self.append_handshake(&mut url);
        Ok(url)
    }

    fn append_handshake(&self, url: &mut Url) {
        let subscriptions = Topic::names(&self.subscriptions()).join(",");
        let mut query = url.query_pairs_mut();
        query.append_pair("userId", &self.settings.user_id);
        if let Some(token) = &self.settings.token {
            query.append_pair("token", token);
        }
        query.append_pair("subscriptions", &subscriptions);
    }
}

/// Consumer-side connection to the streaming server.
///
/// Keeps a socket and a push stream open independently, reconnecting each with
/// exponential backoff, and dispatches every envelope's `data` to the handlers
/// registered for its type. Envelopes delivered on both transports are
/// dispatched once.
pub struct StreamingClient {
    shared: Arc<Shared>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamingClient {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            shared: Arc::new(Shared::new(settings)),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler for one event type. Handlers receive the envelope's `data` only.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.shared.dispatcher.off(kind, id)
    }

    /// Adds topics locally and tells the server, or queues the command until the socket is up.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) {
        let topics: TopicSet = topics.into_iter().collect();
        if topics.is_empty() {
            return;
        }
        self.shared.subscriptions.lock().extend(topics.iter().copied());
        self.shared.send_or_queue(Command::subscribe(&topics));
    }

    /// Removes topics locally and tells the server, or queues the command until the socket is up.
    pub fn unsubscribe(&self, topics: impl IntoIterator<Item = Topic>) {
        let topics: TopicSet = topics.into_iter().collect();
        if topics.is_empty() {
            return;
        }
        self.shared
            .subscriptions
            .lock()
            .retain(|t| !topics.contains(t));
        self.shared.send_or_queue(Command::unsubscribe(&topics));
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            user_id: self.shared.settings.user_id.clone(),
            socket: *self.shared.socket.lock(),
            push: *self.shared.push.lock(),
            subscriptions: Topic::names(&self.shared.subscriptions()),
            queued_commands: self.shared.outbox.lock().queued.len(),
        }
    }

    /// Starts the enabled transports in the background.
    ///
    /// Only configuration problems are returned; connection failures are
    /// reported through `error` events and retried. Once every transport has
    /// spent its reconnect budget, calling `connect` again starts over. Must be
    /// called from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.lock();
        let mut tasks = self.tasks.lock();
        if shutdown.is_some() {
            if !tasks.iter().all(JoinHandle::is_finished) {
                return Err(ClientError::AlreadyConnected);
            }
            // Every transport gave up on its own; start over.
            shutdown.take();
            tasks.clear();
        }
        let settings = &self.shared.settings;
        if settings.enable_socket {
            self.shared.socket_url()?;
        }
        if settings.enable_push {
            self.shared.push_url()?;
        }

        let (tx, rx) = watch::channel(false);
        if settings.enable_socket {
            tasks.push(tokio::spawn(run_socket(Arc::clone(&self.shared), rx.clone())));
        }
        if settings.enable_push {
            tasks.push(tokio::spawn(run_push(Arc::clone(&self.shared), rx)));
        }
        *shutdown = Some(tx);
        info!(user_id = %settings.user_id, "Streaming client started.");
        Ok(())
    }

    /// Closes both transports and waits for their tasks to finish.
    /// Commands still queued stay queued for a later `connect`.
    pub async fn disconnect(&self) {
        let Some(shutdown) = self.shutdown.lock().take() else {
            return;
        };
        let _ = shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Streaming client stopped.");
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
    }
}

/// Sleeps out the next backoff delay. Returns `false` when the client should stop.
async fn wait_before_retry(
    shared: &Shared,
    transport: Transport,
    policy: &mut ReconnectPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let Some(delay) = policy.next_delay() else {
        warn!(transport = transport.as_str(), "Reconnection attempts exhausted.");
        shared.emit_local(
            EventKind::Error,
            transport,
            Some("reconnection attempts exhausted".to_string()),
        );
        return false;
    };
    shared.set_attempts(transport, policy.attempts());
    info!(
        transport = transport.as_str(),
        attempt = policy.attempts(),
        delay_ms = delay.as_millis() as u64,
        "Reconnecting."
    );
    tokio::select! {
        _ = sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn run_socket(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let transport = Transport::Socket;
    let mut policy = ReconnectPolicy::new(
        shared.settings.reconnect_base_delay(),
        shared.settings.max_reconnect_attempts,
    );

    while !*shutdown.borrow() {
        shared.set_state(transport, ConnectionState::Connecting);
        let url = match shared.socket_url() {
            Ok(url) => url,
            Err(e) => {
                shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
                break;
            }
        };

        let attempt = tokio::select! {
            attempt = connect_async(url.as_str()) => attempt,
            _ = shutdown.changed() => break,
        };
        match attempt {
            Ok((stream, _)) => {
                policy.reset();
                shared.set_attempts(transport, 0);
                info!(url = %shared.settings.ws_url, "Socket connected.");
                let end = run_socket_session(&shared, stream, &mut shutdown).await;

                shared.set_state(transport, ConnectionState::Disconnected);
                shared.emit_local(EventKind::Disconnection, transport, None);
                if end == SessionEnd::Shutdown {
                    break;
                }
                warn!("Socket connection lost.");
            }
            Err(e) => {
                shared.set_state(transport, ConnectionState::Disconnected);
                warn!(error = %e, "Socket connection failed.");
                shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
            }
        }

        if !wait_before_retry(&shared, transport, &mut policy, &mut shutdown).await {
            break;
        }
    }
    shared.set_state(transport, ConnectionState::Disconnected);
}

async fn run_socket_session<S>(
    shared: &Shared,
    stream: tokio_tungstenite::WebSocketStream<S>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let transport = Transport::Socket;
    let (mut write, mut read) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    // Re-announce the subscriptions, then replay what was queued while offline.
    let subscriptions = shared.subscriptions();
    if !subscriptions.is_empty() {
        let _ = tx.send(Command::subscribe(&subscriptions));
    }
    {
        let mut outbox = shared.outbox.lock();
        for command in outbox.queued.drain(..) {
            let _ = tx.send(command);
        }
        outbox.live = Some(tx);
    }
    shared.set_state(transport, ConnectionState::Connected);
    shared.emit_local(EventKind::Connection, transport, None);

    let period = shared.settings.heartbeat_interval();
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let pong_timeout = shared.settings.pong_timeout();
    // Without a timeout the timer is never polled; it just needs a valid deadline.
    let silence_limit = pong_timeout.unwrap_or(Duration::from_secs(60 * 60));
    let silence = sleep(silence_limit);
    tokio::pin!(silence);

    let (end, failed) = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break (SessionEnd::Shutdown, None);
            }
            Some(command) = rx.recv() => {
                let frame = match command.to_json() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode command, dropping it.");
                        continue;
                    }
                };
                debug!(command = command.name(), "Sending command.");
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
                    break (SessionEnd::Lost, Some(command));
                }
            }
            _ = heartbeat.tick() => {
                let ping = Command::ping(Utc::now().timestamp_millis());
                let frame = match ping.to_json() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
                    break (SessionEnd::Lost, None);
                }
            }
            _ = &mut silence, if pong_timeout.is_some() => {
                warn!(timeout_secs = silence_limit.as_secs(), "No traffic from server, forcing reconnect.");
                shared.emit_local(EventKind::Error, transport, Some("liveness timeout".to_string()));
                break (SessionEnd::Lost, None);
            }
            message = read.next() => {
                if pong_timeout.is_some() {
                    silence.as_mut().reset(Instant::now() + silence_limit);
                }
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if shared.handle_frame(transport, text.as_str()) == Some(EventKind::Pong) {
                            heartbeat.reset();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break (SessionEnd::Lost, None),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
                        break (SessionEnd::Lost, None);
                    }
                }
            }
        }
    };

    shared.close_session(&mut rx, failed);
    end
}

async fn run_push(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let transport = Transport::Push;
    let http = reqwest::Client::new();
    let mut policy = ReconnectPolicy::new(
        shared.settings.reconnect_base_delay(),
        shared.settings.max_reconnect_attempts,
    );

    while !*shutdown.borrow() {
        shared.set_state(transport, ConnectionState::Connecting);
        let url = match shared.push_url() {
            Ok(url) => url,
            Err(e) => {
                shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
                break;
            }
        };

        let request = http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let response = tokio::select! {
            response = request => response.and_then(|r| r.error_for_status()),
            _ = shutdown.changed() => break,
        };
        match response {
            Ok(response) => {
                policy.reset();
                shared.set_attempts(transport, 0);
                shared.set_state(transport, ConnectionState::Connected);
                info!(url = %shared.settings.sse_url, "Push stream connected.");
                shared.emit_local(EventKind::Connection, transport, None);

                let end = read_push_stream(&shared, response, &mut shutdown).await;

                shared.set_state(transport, ConnectionState::Disconnected);
                shared.emit_local(EventKind::Disconnection, transport, None);
                if end == SessionEnd::Shutdown {
                    break;
                }
                warn!("Push stream ended.");
            }
            Err(e) => {
                shared.set_state(transport, ConnectionState::Disconnected);
                warn!(error = %e, "Push stream request failed.");
                shared.emit_local(EventKind::Error, transport, Some(e.to_string()));
            }
        }

        if !wait_before_retry(&shared, transport, &mut policy, &mut shutdown).await {
            break;
        }
    }
    shared.set_state(transport, ConnectionState::Disconnected);
}

async fn read_push_stream(
    shared: &Shared,
    response: reqwest::Response,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return SessionEnd::Shutdown,
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    for data in decoder.push(&bytes) {
                        shared.handle_frame(Transport::Push, &data);
                    }
                    if decoder.is_overflowing() {
                        let error = ClientError::EventTooLarge(decoder.limit());
                        warn!(error = %error, "Dropping push stream.");
                        shared.emit_local(EventKind::Error, Transport::Push, Some(error.to_string()));
                        return SessionEnd::Lost;
                    }
                }
                Some(Err(e)) => {
                    shared.emit_local(EventKind::Error, Transport::Push, Some(e.to_string()));
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn socket_only(addr: std::net::SocketAddr) -> ClientSettings {
        ClientSettings {
            ws_url: format!("ws://{addr}/stream/ws"),
            enable_push: false,
            reconnect_base_delay_ms: 10,
            ..ClientSettings::default()
        }
    }

    fn watch_kind(client: &StreamingClient, kind: EventKind) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        client.on(kind, move |data| {
            let _ = tx.send(data.clone());
            Ok(())
        });
        rx
    }

    async fn next_command<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> Command
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a command")
                .expect("client hung up")
                .unwrap();
            if let Message::Text(text) = message {
                return Command::parse(text.as_str()).unwrap();
            }
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .unwrap()
    }

    #[tokio::test]
    async fn cold_start_subscribes_to_every_topic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamingClient::new(socket_only(listener.local_addr().unwrap()));
        let mut connected = watch_kind(&client, EventKind::Connection);

        client.connect().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = accept_async(stream).await.unwrap();

        assert_eq!(next_command(&mut server).await, Command::subscribe(&Topic::all()));
        assert_eq!(recv(&mut connected).await["transport"], "websocket");
        assert_eq!(client.status().socket.state, ConnectionState::Connected);

        client.disconnect().await;
        assert_eq!(client.status().socket.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn commands_issued_offline_are_flushed_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamingClient::new(socket_only(listener.local_addr().unwrap()));

        client.unsubscribe([Topic::Risk]);
        client.subscribe([Topic::Signal]);
        assert_eq!(client.status().queued_commands, 2);

        client.connect().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = accept_async(stream).await.unwrap();

        let mut remaining = Topic::all();
        remaining.remove(&Topic::Risk);
        assert_eq!(next_command(&mut server).await, Command::subscribe(&remaining));
        assert_eq!(
            next_command(&mut server).await,
            Command::unsubscribe(&[Topic::Risk])
        );
        assert_eq!(
            next_command(&mut server).await,
            Command::subscribe(&[Topic::Signal])
        );
        assert_eq!(client.status().queued_commands, 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn reconnects_after_the_server_drops_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamingClient::new(socket_only(listener.local_addr().unwrap()));
        let mut dropped = watch_kind(&client, EventKind::Disconnection);

        client.connect().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = accept_async(stream).await.unwrap();
        next_command(&mut first).await;
        first.close(None).await.unwrap();
        drop(first);
        recv(&mut dropped).await;

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client did not reconnect")
            .unwrap();
        let mut second = accept_async(stream).await.unwrap();
        assert!(matches!(next_command(&mut second).await, Command::Subscribe { .. }));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_budget() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = StreamingClient::new(ClientSettings {
            max_reconnect_attempts: 2,
            ..socket_only(addr)
        });
        let mut errors = watch_kind(&client, EventKind::Error);

        client.connect().unwrap();
        let mut messages = Vec::new();
        loop {
            let error = recv(&mut errors).await;
            let message = error["error"].as_str().unwrap_or_default().to_string();
            messages.push(message.clone());
            if message == "reconnection attempts exhausted" {
                break;
            }
        }
        assert_eq!(messages.len(), 4);
        assert_eq!(client.status().socket.reconnect_attempts, 2);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_starts_over_after_the_budget_is_spent() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = StreamingClient::new(ClientSettings {
            max_reconnect_attempts: 1,
            ..socket_only(addr)
        });
        let mut errors = watch_kind(&client, EventKind::Error);

        client.connect().unwrap();
        while recv(&mut errors).await["error"] != "reconnection attempts exhausted" {}

        let listener = TcpListener::bind(addr).await.unwrap();
        let mut restarted = false;
        for _ in 0..200 {
            match client.connect() {
                Ok(()) => {
                    restarted = true;
                    break;
                }
                Err(ClientError::AlreadyConnected) => sleep(Duration::from_millis(10)).await,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(restarted);

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client did not start over")
            .unwrap();
        let mut server = accept_async(stream).await.unwrap();
        assert!(matches!(next_command(&mut server).await, Command::Subscribe { .. }));

        client.disconnect().await;
    }

    #[test]
    fn unsent_commands_go_back_to_the_front_of_the_queue() {
        let shared = Shared::new(ClientSettings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.outbox.lock().live = Some(tx);

        shared.send_or_queue(Command::unsubscribe(&[Topic::Risk]));
        shared.send_or_queue(Command::subscribe(&[Topic::Signal]));
        let failed = rx.try_recv().unwrap();
        assert_eq!(failed, Command::unsubscribe(&[Topic::Risk]));

        shared.close_session(&mut rx, Some(failed));
        shared.send_or_queue(Command::unsubscribe(&[Topic::Outcome]));

        let outbox = shared.outbox.lock();
        assert!(outbox.live.is_none());
        assert_eq!(
            outbox.queued.iter().cloned().collect::<Vec<_>>(),
            vec![
                Command::unsubscribe(&[Topic::Risk]),
                Command::subscribe(&[Topic::Signal]),
                Command::unsubscribe(&[Topic::Outcome]),
            ]
        );
    }

    #[tokio::test]
    async fn heartbeat_pings_until_a_pong_pushes_it_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamingClient::new(ClientSettings {
            heartbeat_interval_secs: 1,
            pong_timeout_secs: None,
            ..socket_only(listener.local_addr().unwrap())
        });

        client.connect().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = accept_async(stream).await.unwrap();
        assert!(matches!(next_command(&mut server).await, Command::Subscribe { .. }));

        let ping = next_command(&mut server).await;
        assert!(matches!(ping, Command::Ping { ref data } if data.timestamp.is_some()));

        // Without the reset the next ping would be due ~400ms after this pong.
        sleep(Duration::from_millis(600)).await;
        let pong = EventEnvelope::pong(Some(1)).to_json().unwrap();
        server.send(Message::Text(pong.into())).await.unwrap();
        let ponged_at = Instant::now();

        assert!(matches!(next_command(&mut server).await, Command::Ping { .. }));
        assert!(ponged_at.elapsed() >= Duration::from_millis(800));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn push_stream_reconnects_after_the_response_ends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StreamingClient::new(ClientSettings {
            sse_url: format!("http://{addr}/stream/sse"),
            enable_socket: false,
            reconnect_base_delay_ms: 10,
            ..ClientSettings::default()
        });
        let mut risk = watch_kind(&client, EventKind::Risk);
        let mut connected = watch_kind(&client, EventKind::Connection);

        client.connect().unwrap();
        for n in 1..=2 {
            let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("push stream did not (re)connect")
                .unwrap();
            let mut request = [0u8; 4096];
            let read = stream.read(&mut request).await.unwrap();
            assert!(String::from_utf8_lossy(&request[..read]).starts_with("GET /stream/sse?"));

            let frame = EventEnvelope::new(EventKind::Risk, json!({ "n": n }))
                .to_json()
                .unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\ndata: {frame}\n\n"
            );
            stream.write_all(response.as_bytes()).await.unwrap();

            assert_eq!(recv(&mut connected).await["transport"], "sse");
            assert_eq!(recv(&mut risk).await["n"], n);
            drop(stream);
        }
        assert_eq!(client.status().push.reconnect_attempts, 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn silent_server_triggers_a_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamingClient::new(ClientSettings {
            heartbeat_interval_secs: 30,
            pong_timeout_secs: Some(1),
            ..socket_only(listener.local_addr().unwrap())
        });
        let mut errors = watch_kind(&client, EventKind::Error);

        client.connect().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let _silent = accept_async(stream).await.unwrap();

        assert_eq!(recv(&mut errors).await["error"], "liveness timeout");
        let reconnect = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(reconnect.is_ok());

        client.disconnect().await;
    }

    #[test]
    fn duplicate_envelopes_are_dispatched_once() {
        let shared = Shared::new(ClientSettings::default());
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        shared.dispatcher.on(EventKind::Signal, move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        let frame = EventEnvelope::new(EventKind::Signal, json!({"source": "news"}))
            .to_json()
            .unwrap();
        assert_eq!(shared.handle_frame(Transport::Socket, &frame), Some(EventKind::Signal));
        assert_eq!(shared.handle_frame(Transport::Push, &frame), None);
        assert_eq!(shared.handle_frame(Transport::Push, "not json"), None);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn subscription_updates_replace_the_local_set() {
        let shared = Shared::new(ClientSettings::default());
        let frame = EventEnvelope::subscription_updated(&Topic::parse_csv("risk,outcome"))
            .to_json()
            .unwrap();
        shared.handle_frame(Transport::Socket, &frame);
        assert_eq!(shared.subscriptions(), Topic::parse_csv("outcome,risk"));
    }

    #[test]
    fn handshake_urls_carry_identity_and_topics() {
        let shared = Shared::new(ClientSettings {
            user_id: "desk 7".to_string(),
            token: Some("t0k".to_string()),
            subscriptions: vec!["risk".to_string(), "bogus".to_string()],
            ..ClientSettings::default()
        });
        let url = shared.push_url().unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("userId".to_string(), "desk 7".to_string()),
                ("token".to_string(), "t0k".to_string()),
                ("subscriptions".to_string(), "risk".to_string()),
            ]
        );

        let bad = Shared::new(ClientSettings {
            ws_url: "http://127.0.0.1/stream/ws".to_string(),
            ..ClientSettings::default()
        });
        assert!(matches!(bad.socket_url(), Err(ClientError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = StreamingClient::new(socket_only(listener.local_addr().unwrap()));
        client.connect().unwrap();
        assert!(matches!(client.connect(), Err(ClientError::AlreadyConnected)));
        client.disconnect().await;
    }
}
