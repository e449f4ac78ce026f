//! Client error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsClientError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("connection timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("handshake rejected with HTTP {0}")]
    Rejected(u16),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,
}

impl WsClientError {
    /// The server refused the credentials; retrying with the same token cannot succeed.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Rejected(401 | 403))
    }
}

pub type Result<T> = std::result::Result<T, WsClientError>;
