use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid stream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Client is already connected")]
    AlreadyConnected,

    #[error("Push event exceeded {0} bytes without a terminating blank line")]
    EventTooLarge(usize),
}
