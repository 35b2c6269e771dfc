//! # Stream Server
//!
//! Real-time fan-out of pipeline events to connected clients over two
//! transports: a bidirectional WebSocket (`/stream/ws`) managed by the
//! `StreamingManager`, and one-way Server-Sent Events (`/stream/sse`) managed
//! by the `PushStreamHandler`. Domain code publishes through the `EventPublisher`.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use configuration::ServerSettings;
use events::Topic;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, Any, CorsLayer, ExposeHeaders},
    trace::TraceLayer,
};

pub mod error;
pub mod handlers;
pub mod manager;
pub mod publisher;
pub mod push;
pub mod queue;
pub mod registry;
pub mod transport;

pub use error::ServerError;
pub use manager::{ManagerStats, StreamingManager};
pub use publisher::{EventPublisher, PublishRecord};
pub use push::PushStreamHandler;
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use transport::{ChannelSink, DeliveryError, EventSink};

/// The shared application state that all handlers can access.
pub struct AppState {
    pub manager: Arc<StreamingManager>,
    pub push: Arc<PushStreamHandler>,
    pub publisher: EventPublisher,
    pub settings: ServerSettings,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(settings: ServerSettings) -> Self {
        let manager = Arc::new(StreamingManager::new(&settings));
        let push = Arc::new(PushStreamHandler::new(
            settings.send_buffer,
            Topic::parse_lenient(&settings.default_push_subscriptions),
        ));
        let publisher = EventPublisher::new(Arc::clone(&manager), Arc::clone(&push));
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            push,
            publisher,
            settings,
            shutdown,
        }
    }

    /// Resolves once shutdown has been requested. Open streams use it to end themselves.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static + use<> {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Builds the HTTP surface: health, stats, producer ingress and both stream endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(Any)
        .allow_headers(AllowHeaders::any())
        .expose_headers(ExposeHeaders::any());

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/events", post(handlers::publish_event))
        .route("/stream/ws", get(handlers::websocket_handler))
        .route("/stream/sse", get(handlers::sse_handler))
        .with_state(state)
        .layer(cors)
        // Logs every incoming request.
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024))
}

/// Serves on an already bound listener until `shutdown` resolves.
///
/// Starts the manager's background workers, and on shutdown ends every open
/// stream, flushes the outbound queue and waits for the workers to stop.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let workers = state.manager.spawn_workers(state.shutdown.subscribe());

    let trigger = Arc::clone(&state);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutdown requested, closing streams.");
            trigger.request_shutdown();
        })
        .await?;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Background worker panicked.");
        }
    }
    tracing::info!("Stream server stopped.");
    Ok(())
}

/// Binds `settings.bind_addr` and serves until `shutdown` resolves.
pub async fn run_server(
    settings: ServerSettings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Stream server listening.");
    serve(listener, Arc::new(AppState::new(settings)), shutdown).await
}
