use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("Failed to serialize event message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),
}
