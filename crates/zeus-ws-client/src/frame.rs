//! Inbound frame routing.

use serde_json::{Value, json};

use crate::error::Result;
use crate::events::EventKey;

/// What the reader should do with one inbound text payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Dispatch to listeners of `key`.
    Dispatch { key: EventKey, payload: Value },
    /// Server keepalive; answer with [`pong_frame`].
    Ping,
    /// Answer to our own heartbeat.
    Pong,
}

/// Parse a text frame. Objects route by their `type` field; anything without
/// one goes to [`EventKey::Message`].
pub fn parse_inbound(text: &str) -> Result<Inbound> {
    let payload: Value = serde_json::from_str(text)?;
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kind| !kind.is_empty());
    Ok(match kind {
        Some("ping") => Inbound::Ping,
        Some("pong") => Inbound::Pong,
        Some(kind) => Inbound::Dispatch {
            key: EventKey::parse(kind),
            payload,
        },
        None => Inbound::Dispatch {
            key: EventKey::Message,
            payload,
        },
    })
}

/// Binary frames are accepted only when they carry UTF-8 JSON.
#[must_use]
pub fn parse_binary(bytes: &[u8]) -> Option<Inbound> {
    let text = std::str::from_utf8(bytes).ok()?;
    parse_inbound(text).ok()
}

#[must_use]
pub fn ping_frame(timestamp_ms: i64) -> String {
    json!({ "type": "ping", "timestamp": timestamp_ms }).to_string()
}

#[must_use]
pub fn pong_frame(timestamp_ms: i64) -> String {
    json!({ "type": "pong", "timestamp": timestamp_ms }).to_string()
}
