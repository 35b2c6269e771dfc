use crate::error::ServerError;
use crate::publisher::PublishRecord;
use crate::push::PushStreamHandler;
use crate::registry::ConnectionId;
use crate::transport::{ChannelSink, EventSink};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use events::{EventEnvelope, Topic, TopicSet};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Query string accepted by both stream endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub token: Option<String>,
    /// Comma-separated topic names. Fixed for a push stream; the initial set for a socket.
    pub subscriptions: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub socket_connections: usize,
    pub push_connections: usize,
    pub queue_depth: usize,
    pub dropped_events: u64,
}

/// The credential from `?token=` or, failing that, `Authorization: Bearer`.
fn bearer_token(params: &HandshakeParams, headers: &HeaderMap) -> Option<String> {
    params
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
}

fn authorize(
    state: &AppState,
    params: &HandshakeParams,
    headers: &HeaderMap,
) -> Result<(), ServerError> {
    if state.settings.require_token && bearer_token(params, headers).is_none() {
        return Err(ServerError::Unauthorized);
    }
    Ok(())
}

/// # GET /api/health
pub async fn health() -> &'static str {
    "OK"
}

/// # GET /api/stats
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StreamStats> {
    let manager = state.manager.stats().await;
    Json(StreamStats {
        socket_connections: manager.connections,
        push_connections: state.push.connection_count(),
        queue_depth: manager.queue_depth,
        dropped_events: manager.dropped_events,
    })
}

/// # POST /api/events
/// Producer ingress. Accepts `{eventType, data}` and publishes it on both transports.
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(record): Json<PublishRecord>,
) -> Result<(StatusCode, Json<Value>), ServerError> {
    let topic = state.publisher.publish_record(&record)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "eventType": topic }))))
}

/// # GET /stream/ws
/// Upgrades to the bidirectional event socket.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    authorize(&state, &params, &headers)?;
    let subscriptions = params.subscriptions.as_deref().map(Topic::parse_csv);
    let user_id = params.user_id;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user_id, subscriptions))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: Option<String>,
    subscriptions: Option<TopicSet>,
) {
    let (mut sender, mut receiver) = socket.split();

    // The writer owns the socket's write half; it stops once every sink clone is dropped.
    let (tx, mut rx) = mpsc::channel::<String>(state.settings.send_buffer);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let sink: Arc<dyn EventSink> = Arc::new(ChannelSink::new(tx));
    let connection_id = match state
        .manager
        .handle_connect_with(user_id, subscriptions, sink)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Socket handshake failed.");
            return;
        }
    };

    let shutdown = state.shutdown_requested();
    tokio::pin!(shutdown);

    loop {
        let message = tokio::select! {
            message = receiver.next() => message,
            _ = &mut shutdown => break,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                if !forward(&state, connection_id, &text).await {
                    break;
                }
            }
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => {
                    if !forward(&state, connection_id, &text).await {
                        break;
                    }
                }
                Err(_) => warn!(connection_id = %connection_id, "Ignoring non-UTF-8 frame."),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "Socket read failed.");
                break;
            }
        }
    }

    state.manager.handle_disconnect(connection_id).await;
}

/// Returns `false` once the manager no longer knows the connection (it was evicted).
async fn forward(state: &AppState, connection_id: ConnectionId, text: &str) -> bool {
    match state.manager.handle_message(connection_id, text).await {
        Ok(()) => true,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Closing evicted socket.");
            false
        }
    }
}

/// Unregisters a push stream when axum drops its response body.
struct PushGuard {
    push: Arc<PushStreamHandler>,
    id: ConnectionId,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        self.push.close(&self.id);
    }
}

/// # GET /stream/sse
/// Opens a one-way push stream. Each envelope becomes one `data:` frame.
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ServerError> {
    authorize(&state, &params, &headers)?;

    let subscriptions = params.subscriptions.as_deref().map(Topic::parse_csv);
    let (id, rx) = state.push.open(params.user_id, subscriptions);
    let guard = PushGuard {
        push: Arc::clone(&state.push),
        id,
    };

    let stream = ReceiverStream::new(rx)
        .take_until(state.shutdown_requested())
        .map(move |envelope: EventEnvelope| {
            let _open = &guard;
            Event::default().id(envelope.id.to_string()).json_data(&envelope)
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
