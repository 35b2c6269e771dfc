use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Connection not found: {0}")]
    UnknownConnection(Uuid),
    #[error("Outbound queue is full, event {0} was rejected")]
    QueueFull(Uuid),
    #[error("Missing bearer token")]
    Unauthorized,
    #[error("Invalid event record: {0}")]
    InvalidRecord(String),
    #[error("Event error: {0}")]
    Events(#[from] events::EventsError),
}

/// Converts our custom `ServerError` into an HTTP response.
impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            ServerError::InvalidRecord(_) | ServerError::Events(_) => StatusCode::BAD_REQUEST,
            ServerError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Handshake(_) => {
                tracing::error!(error = %self, "Handshake error.");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
