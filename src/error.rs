//! Crate-wide error type for the session client

use tokio_tungstenite::tungstenite::Error as WsError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No credential stored, sign in first")]
    MissingCredential,

    #[error("Credential contains characters that cannot go in a cookie")]
    InvalidCredential,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
