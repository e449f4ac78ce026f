//! Normalization of the two response shapes the API uses: a
//! `{status, data, error, message}` envelope or a bare payload.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::token::{TokenPair, clean_token};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("success envelope without data")]
    MissingData,
    #[error("response did not include an access token")]
    MissingAccessToken,
    #[error("response did not include a refresh token")]
    MissingRefreshToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

impl Envelope {
    /// Most specific human-readable reason carried by an error envelope.
    #[must_use]
    pub fn reason(&self) -> String {
        self.error
            .as_ref()
            .and_then(describe)
            .or_else(|| self.message.clone().filter(|message| !message.trim().is_empty()))
            .or_else(|| self.detail.as_ref().and_then(describe))
            .unwrap_or_else(|| "request failed".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BareTokens {
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AuthResponse {
    Enveloped(Envelope),
    Bare(BareTokens),
}

/// Turn a login/refresh response into a canonical pair. `previous_refresh` is used
/// when a refresh response omits the refresh token.
pub fn normalize_token_response(
    value: Value,
    previous_refresh: Option<&str>,
) -> Result<TokenPair, EnvelopeError> {
    let response: AuthResponse = serde_json::from_value(value)
        .map_err(|error| EnvelopeError::Malformed(error.to_string()))?;
    let tokens = match response {
        AuthResponse::Bare(tokens) => tokens,
        AuthResponse::Enveloped(envelope) => match envelope.status {
            EnvelopeStatus::Error => return Err(EnvelopeError::Rejected(envelope.reason())),
            EnvelopeStatus::Success => {
                let data = envelope.data.ok_or(EnvelopeError::MissingData)?;
                serde_json::from_value::<BareTokens>(data)
                    .map_err(|error| EnvelopeError::Malformed(error.to_string()))?
            }
        },
    };

    let access_token = tokens
        .access_token
        .as_deref()
        .map(clean_token)
        .filter(|token| !token.is_empty())
        .ok_or(EnvelopeError::MissingAccessToken)?
        .to_string();
    let refresh_token = tokens
        .refresh_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .or_else(|| previous_refresh.map(str::trim).filter(|token| !token.is_empty()))
        .ok_or(EnvelopeError::MissingRefreshToken)?
        .to_string();

    Ok(TokenPair {
        access_token,
        refresh_token,
        expires_in: tokens.expires_in,
        token_type: tokens.token_type,
    })
}

/// Decode `T` from either an envelope's `data` or the bare value.
pub fn unwrap_envelope<T>(value: Value) -> Result<T, EnvelopeError>
where
    T: DeserializeOwned,
{
    let payload = if is_envelope(&value) {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|error| EnvelopeError::Malformed(error.to_string()))?;
        match envelope.status {
            EnvelopeStatus::Error => return Err(EnvelopeError::Rejected(envelope.reason())),
            EnvelopeStatus::Success => envelope.data.ok_or(EnvelopeError::MissingData)?,
        }
    } else {
        value
    };
    serde_json::from_value(payload).map_err(|error| EnvelopeError::Malformed(error.to_string()))
}

/// Pull a message out of an error body: `detail`, then `message`, then `error`.
#[must_use]
pub fn error_message(body: &Value) -> Option<String> {
    ["detail", "message", "error"]
        .iter()
        .find_map(|key| body.get(key).and_then(describe))
}

fn is_envelope(value: &Value) -> bool {
    matches!(
        value.get("status").and_then(Value::as_str),
        Some("success" | "error")
    )
}

fn describe(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("msg"))
            .and_then(describe)
            .or_else(|| Some(value.to_string())),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(describe).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("; "))
            }
        }
        other => Some(other.to_string()),
    }
}
