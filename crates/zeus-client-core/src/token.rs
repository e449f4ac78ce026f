//! Access/refresh token pair and best-effort inspection of signed tokens.
//!
//! Tokens are never verified here; the server owns signature checks. The client
//! only needs the payload to decide whether a token is worth sending.

use std::sync::atomic::{AtomicI64, Ordering};

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const BEARER_PREFIX: &str = "Bearer ";
pub const TEST_TOKEN_PREFIX: &str = "test_";

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl TokenPair {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_in: None,
            token_type: None,
        }
    }
}

/// Decoded middle segment of a signed token.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenPayload {
    #[serde(default, deserialize_with = "numeric_date")]
    pub exp: Option<i64>,
    #[serde(default, deserialize_with = "numeric_date")]
    pub iat: Option<i64>,
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl TokenPayload {
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.claims.get("email").and_then(Value::as_str)
    }

    #[must_use]
    pub fn roles(&self) -> Vec<&str> {
        string_list(self.claims.get("roles"))
    }

    #[must_use]
    pub fn permissions(&self) -> Vec<&str> {
        string_list(self.claims.get("permissions"))
    }
}

fn string_list(value: Option<&Value>) -> Vec<&str> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn numeric_date<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|seconds| seconds.floor() as i64)),
        _ => None,
    })
}

/// Whether the `test_` development prefix short-circuits expiry checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevTokenPolicy {
    #[default]
    Strict,
    AllowTestPrefix,
}

impl DevTokenPolicy {
    #[must_use]
    pub fn allows_test_prefix(self) -> bool {
        matches!(self, Self::AllowTestPrefix)
    }
}

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Settable clock for deterministic expiry checks.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    #[must_use]
    pub fn new(now_unix: i64) -> Self {
        Self {
            now: AtomicI64::new(now_unix),
        }
    }

    pub fn set(&self, now_unix: i64) {
        self.now.store(now_unix, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Trim whitespace and an optional `Bearer ` prefix.
#[must_use]
pub fn clean_token(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix(BEARER_PREFIX)
        .map_or(trimmed, str::trim_start)
}

/// Best-effort decode of the payload segment. Returns `None` on any malformed input.
#[must_use]
pub fn decode_payload(token: &str) -> Option<TokenPayload> {
    let token = clean_token(token);
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };
    if payload.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_LENIENT
        .decode(payload)
        .or_else(|_| STANDARD_LENIENT.decode(payload))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        value @ Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    }
}

#[must_use]
pub fn is_structurally_valid(token: &str) -> bool {
    decode_payload(token).is_some()
}

/// True when the token cannot be decoded, carries no `exp`, or `exp` is before `now_unix`.
#[must_use]
pub fn is_expired_at(token: &str, now_unix: i64, policy: DevTokenPolicy) -> bool {
    let token = clean_token(token);
    if token.is_empty() {
        return true;
    }
    if policy.allows_test_prefix() && token.starts_with(TEST_TOKEN_PREFIX) {
        return false;
    }
    match decode_payload(token).and_then(|payload| payload.exp) {
        Some(exp) => exp < now_unix,
        None => true,
    }
}

/// True when the token is expired or expires within `skew_seconds` of `now_unix`.
#[must_use]
pub fn expires_within(token: &str, now_unix: i64, skew_seconds: i64, policy: DevTokenPolicy) -> bool {
    is_expired_at(token, now_unix.saturating_add(skew_seconds), policy)
}

/// Short prefix suitable for log lines.
#[must_use]
pub fn redact(token: &str) -> String {
    let token = clean_token(token);
    let prefix: String = token.chars().take(10).collect();
    if prefix.len() < token.len() {
        format!("{prefix}…")
    } else {
        prefix
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{token_expiring_at, token_with_payload};
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn decode_payload_reads_claims() {
        let token = token_with_payload(&json!({
            "sub": "42",
            "email": "ops@zeus.test",
            "exp": NOW + 60,
            "iat": NOW,
            "roles": ["admin", 7, "ops"],
        }));
        let payload = decode_payload(&token).expect("payload");
        assert_eq!(payload.exp, Some(NOW + 60));
        assert_eq!(payload.iat, Some(NOW));
        assert_eq!(payload.subject(), Some("42"));
        assert_eq!(payload.email(), Some("ops@zeus.test"));
        assert_eq!(payload.roles(), vec!["admin", "ops"]);
        assert!(payload.permissions().is_empty());
    }

    #[test]
    fn decode_payload_accepts_bearer_prefix_and_padding() {
        let token = token_expiring_at(NOW);
        let payload = token.split('.').nth(1).expect("payload segment").to_string();
        let padding = "=".repeat((4 - payload.len() % 4) % 4);
        let padded = format!("h.{payload}{padding}.s");
        assert!(decode_payload(&format!("Bearer {token}")).is_some());
        assert!(decode_payload(&padded).is_some());
    }

    #[test]
    fn decode_payload_rejects_malformed_tokens() {
        let cases = [
            "",
            "only-one-segment",
            "two.segments",
            "a.b.c.d",
            "a..c",
            "a.!!!.c",
            // valid base64 but not JSON
            "a.bm90LWpzb24.c",
            // JSON but not an object
            "a.WzEsMiwzXQ.c",
        ];
        for case in cases {
            assert!(decode_payload(case).is_none(), "expected None for {case:?}");
        }
    }

    #[test]
    fn is_expired_compares_exp_with_now() {
        assert!(is_expired_at(&token_expiring_at(NOW - 1), NOW, DevTokenPolicy::Strict));
        assert!(!is_expired_at(&token_expiring_at(NOW + 1), NOW, DevTokenPolicy::Strict));
        assert!(!is_expired_at(&token_expiring_at(NOW), NOW, DevTokenPolicy::Strict));
    }

    #[test]
    fn is_expired_for_undecodable_or_exp_less_tokens() {
        assert!(is_expired_at("a.b", NOW, DevTokenPolicy::Strict));
        assert!(is_expired_at("   ", NOW, DevTokenPolicy::Strict));
        let no_exp = token_with_payload(&json!({ "sub": "1" }));
        assert!(is_expired_at(&no_exp, NOW, DevTokenPolicy::Strict));
        let string_exp = token_with_payload(&json!({ "exp": "tomorrow" }));
        assert!(is_expired_at(&string_exp, NOW, DevTokenPolicy::Strict));
    }

    #[test]
    fn fractional_exp_is_floored() {
        let token = token_with_payload(&json!({ "exp": (NOW as f64) + 0.75 }));
        assert_eq!(decode_payload(&token).and_then(|p| p.exp), Some(NOW));
    }

    #[test]
    fn test_prefix_bypass_requires_opt_in() {
        assert!(is_expired_at("test_token", NOW, DevTokenPolicy::Strict));
        assert!(!is_expired_at("test_token", NOW, DevTokenPolicy::AllowTestPrefix));
    }

    #[test]
    fn expires_within_applies_skew() {
        let token = token_expiring_at(NOW + 30);
        assert!(!expires_within(&token, NOW, 10, DevTokenPolicy::Strict));
        assert!(expires_within(&token, NOW, 60, DevTokenPolicy::Strict));
    }

    #[test]
    fn redact_keeps_short_prefix() {
        assert_eq!(redact("abc"), "abc");
        assert_eq!(redact("Bearer 0123456789abcdef"), "0123456789…");
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(NOW);
        clock.advance(5);
        assert_eq!(clock.now_unix(), NOW + 5);
        clock.set(1);
        assert_eq!(clock.now_unix(), 1);
    }
}
