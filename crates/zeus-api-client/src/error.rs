//! Normalized error shape for every failure surfaced by the API client.

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use zeus_client_core::{EnvelopeError, TokenStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// No response was received.
    Network,
    /// 401 from an auth endpoint: bad credentials.
    AuthError,
    /// 401 that could not be recovered by refreshing.
    Unauthorized,
    Forbidden,
    BadRequest,
    NotFound,
    Validation,
    TooManyRequests,
    Server,
    ServiceUnavailable,
    Api,
    Decode,
    InvalidRequest,
    /// Tokens could not be persisted locally.
    Storage,
    NoRefreshToken,
    RefreshFailed,
}

impl ApiErrorKind {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Network => "network_error",
            Self::AuthError => "auth_error",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Validation => "validation_error",
            Self::TooManyRequests => "too_many_requests",
            Self::Server => "server_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Api => "api_error",
            Self::Decode => "decode_error",
            Self::InvalidRequest => "invalid_request",
            Self::Storage => "storage_error",
            Self::NoRefreshToken => "no_refresh_token",
            Self::RefreshFailed => "token_refresh_failed",
        }
    }

    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            422 => Self::Validation,
            429 => Self::TooManyRequests,
            503 => Self::ServiceUnavailable,
            500..=599 => Self::Server,
            _ => Self::Api,
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            Self::Network => "no response from server",
            Self::AuthError => "Invalid credentials",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::BadRequest => "Bad request",
            Self::NotFound => "Resource not found",
            Self::Validation => "Validation error",
            Self::TooManyRequests => "Too many requests",
            Self::Server => "Internal server error",
            Self::ServiceUnavailable => "Service unavailable",
            Self::Api => "API request failed",
            Self::Decode => "Unexpected response body",
            Self::InvalidRequest => "Invalid request",
            Self::Storage => "Could not store session tokens",
            Self::NoRefreshToken => "Session expired",
            Self::RefreshFailed => "Session refresh failed",
        }
    }

    /// Failures after which the local session must be discarded.
    #[must_use]
    pub fn ends_session(self) -> bool {
        matches!(
            self,
            Self::Forbidden | Self::NoRefreshToken | Self::RefreshFailed
        )
    }
}

#[derive(Debug, Error)]
pub enum ApiErrorCause {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),
    #[error(transparent)]
    Refresh(#[from] RefreshFailure),
}

#[derive(Debug, Error)]
#[error("{}: {message}", .kind.code())]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    pub status: Option<StatusCode>,
    /// Parsed error body, when the server sent JSON.
    pub details: Option<Value>,
    #[source]
    pub cause: Option<ApiErrorCause>,
}

impl ApiError {
    #[must_use]
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            details: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn of_kind(kind: ApiErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<ApiErrorCause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn network(error: reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "request timed out".to_string()
        } else {
            format!("could not reach server: {error}")
        };
        Self::new(ApiErrorKind::Network, message).with_cause(error)
    }

    pub fn decode(error: impl Into<ApiErrorCause>) -> Self {
        let cause = error.into();
        Self::new(ApiErrorKind::Decode, cause.to_string()).with_cause(cause)
    }

    /// Build from a non-success status and raw body. The message prefers the
    /// server's `detail`/`message`/`error` field.
    #[must_use]
    pub fn from_response(kind: ApiErrorKind, status: StatusCode, body: &[u8]) -> Self {
        let details = serde_json::from_slice::<Value>(body).ok();
        let message = details
            .as_ref()
            .and_then(zeus_client_core::envelope::error_message)
            .unwrap_or_else(|| kind.default_message().to_string());
        Self::new(kind, message)
            .with_status(status)
            .with_details(details)
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<RefreshFailure> for ApiError {
    fn from(failure: RefreshFailure) -> Self {
        Self::new(failure.kind, failure.message.clone()).with_cause(failure)
    }
}

/// Cloneable outcome shared with every request waiting on one refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.code())]
pub struct RefreshFailure {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl RefreshFailure {
    #[must_use]
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn aborted() -> Self {
        Self::new(
            ApiErrorKind::RefreshFailed,
            "token refresh was abandoned before completing",
        )
    }
}
