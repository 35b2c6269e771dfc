use configuration::ServerSettings;
use events::{EventEnvelope, EventKind};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_server::AppState;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(settings: ServerSettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let state = Arc::new(AppState::new(settings));
        let task = tokio::spawn(stream_server::serve(listener, state, async {
            let _ = stopped.await;
        }));
        Self { addr, stop, task }
    }

    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws(&self, query: &str) -> String {
        format!("ws://{}/stream/ws?{}", self.addr, query)
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not shut down")
            .unwrap()
            .unwrap();
    }
}

fn fast_settings() -> ServerSettings {
    ServerSettings {
        bind_addr: "127.0.0.1:0".to_string(),
        drain_interval_ms: 10,
        ..ServerSettings::default()
    }
}

async fn next_envelope(socket: &mut Socket) -> EventEnvelope {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return EventEnvelope::from_json(text.as_str()).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, command: Value) {
    socket
        .send(Message::Text(command.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn socket_greets_and_answers_pings() {
    let server = TestServer::start(fast_settings()).await;
    let (mut socket, _) = connect_async(server.ws("userId=alice")).await.unwrap();

    let welcome = next_envelope(&mut socket).await;
    assert_eq!(welcome.kind, EventKind::System);
    assert_eq!(welcome.data["subscriptions"].as_array().unwrap().len(), 6);

    send(&mut socket, json!({"type": "ping", "data": {"timestamp": 42}})).await;
    let pong = next_envelope(&mut socket).await;
    assert_eq!(pong.kind, EventKind::Pong);
    assert_eq!(pong.data["timestamp"], 42);

    socket.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn posted_events_reach_subscribed_sockets() {
    let server = TestServer::start(fast_settings()).await;
    let (mut socket, _) = connect_async(server.ws("userId=alice")).await.unwrap();
    next_envelope(&mut socket).await;

    send(
        &mut socket,
        json!({"type": "unsubscribe", "subscriptions": ["signal", "proposal", "decision", "outcome", "system"]}),
    )
    .await;
    let updated = next_envelope(&mut socket).await;
    assert_eq!(updated.kind, EventKind::SubscriptionUpdated);
    assert_eq!(updated.data["subscriptions"], json!(["risk"]));

    let client = reqwest::Client::new();
    let status = json!({"health": "healthy"});
    let response = client
        .post(server.http("/api/events"))
        .json(&json!({"eventType": "system", "data": status}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let risk = json!({
        "risk_score": "0.91",
        "var": "0.04",
        "cvar": "0.06",
        "volatility": "0.22",
        "recommendations": ["hedge"]
    });
    let response = client
        .post(server.http("/api/events"))
        .json(&json!({"eventType": "risk", "data": risk}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let delivered = next_envelope(&mut socket).await;
    assert_eq!(delivered.kind, EventKind::Risk);
    assert_eq!(delivered.data["risk_score"], "0.91");

    let stats: Value = client
        .get(server.http("/api/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["socketConnections"], 1);
    assert_eq!(stats["pushConnections"], 0);

    socket.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn unknown_event_types_are_rejected() {
    let server = TestServer::start(fast_settings()).await;
    let response = reqwest::Client::new()
        .post(server.http("/api/events"))
        .json(&json!({"eventType": "weather", "data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    server.stop().await;
}

#[tokio::test]
async fn handshakes_without_token_are_refused_when_required() {
    let server = TestServer::start(ServerSettings {
        require_token: true,
        ..fast_settings()
    })
    .await;

    assert!(connect_async(server.ws("userId=alice")).await.is_err());
    let (mut socket, _) = connect_async(server.ws("userId=alice&token=secret"))
        .await
        .unwrap();
    assert_eq!(next_envelope(&mut socket).await.kind, EventKind::System);

    let response = reqwest::get(server.http("/stream/sse")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    socket.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn push_stream_starts_with_connection_frame() {
    let server = TestServer::start(fast_settings()).await;
    let response = reqwest::get(server.http("/stream/sse?userId=bob&subscriptions=risk"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let mut body = response.bytes_stream();
    let mut text = String::new();
    while !text.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("timed out waiting for the first frame")
            .expect("stream ended")
            .unwrap();
        text.push_str(&String::from_utf8_lossy(&chunk));
    }

    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .expect("no data line");
    let first = EventEnvelope::from_json(data.trim()).unwrap();
    assert_eq!(first.kind, EventKind::Connection);
    assert_eq!(first.data["subscriptions"], json!(["risk"]));

    drop(body);
    server.stop().await;
}
