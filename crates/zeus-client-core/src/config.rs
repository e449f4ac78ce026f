use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::token::DevTokenPolicy;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_WS_PATH: &str = "/api/v1/ws";

pub const ENV_API_BASE_URL: &str = "ZEUS_API_BASE_URL";
pub const ENV_API_BASE_URL_LEGACY: &str = "VITE_API_URL";
pub const ENV_WS_BASE_URL: &str = "ZEUS_WS_BASE_URL";
pub const ENV_WS_BASE_URL_LEGACY: &str = "VITE_WS_URL";
pub const ENV_API_TIMEOUT_MS: &str = "ZEUS_API_TIMEOUT_MS";
pub const ENV_WS_CONNECT_TIMEOUT_MS: &str = "ZEUS_WS_CONNECT_TIMEOUT_MS";
pub const ENV_WS_RECONNECT_BASE_MS: &str = "ZEUS_WS_RECONNECT_BASE_MS";
pub const ENV_WS_RECONNECT_MULTIPLIER: &str = "ZEUS_WS_RECONNECT_MULTIPLIER";
pub const ENV_WS_RECONNECT_MAX_MS: &str = "ZEUS_WS_RECONNECT_MAX_MS";
pub const ENV_WS_MAX_RECONNECT_ATTEMPTS: &str = "ZEUS_WS_MAX_RECONNECT_ATTEMPTS";
pub const ENV_WS_HEARTBEAT_INTERVAL_MS: &str = "ZEUS_WS_HEARTBEAT_INTERVAL_MS";
pub const ENV_TOKEN_DEV_BYPASS: &str = "ZEUS_TOKEN_DEV_BYPASS";
pub const ENV_TOKEN_STORE_PATH: &str = "ZEUS_TOKEN_STORE_PATH";

pub const DEFAULT_API_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WS_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: base url must not be empty")]
    EmptyBaseUrl { key: &'static str },
    #[error("{key}: base url must use one of {expected} and include a host, got `{value}`")]
    InvalidBaseUrl {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("invalid {key}: {message}")]
    InvalidNumber { key: &'static str, message: String },
    #[error("invalid {key}: expected a boolean, got `{value}`")]
    InvalidBool { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            multiplier: DEFAULT_RECONNECT_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub api_base_url_source: &'static str,
    pub ws_base_url: String,
    pub ws_base_url_source: &'static str,
    pub api_timeout: Duration,
    pub ws_connect_timeout: Duration,
    pub reconnect: ReconnectSettings,
    /// `None` disables the keepalive ping.
    pub heartbeat_interval: Option<Duration>,
    pub dev_token_policy: DevTokenPolicy,
    pub token_store_path: Option<PathBuf>,
}

impl ClientConfig {
    /// Defaults pointing at a local backend.
    pub fn local() -> Result<Self, ConfigError> {
        Self::from_lookup(|_| None)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_non_empty)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let (api_base_url, api_base_url_source) =
            if let Some(raw) = lookup(ENV_API_BASE_URL) {
                (normalize_http_base_url(ENV_API_BASE_URL, &raw)?, ENV_API_BASE_URL)
            } else if let Some(raw) = lookup(ENV_API_BASE_URL_LEGACY) {
                (
                    normalize_http_base_url(ENV_API_BASE_URL_LEGACY, &raw)?,
                    ENV_API_BASE_URL_LEGACY,
                )
            } else {
                (
                    normalize_http_base_url(ENV_API_BASE_URL, DEFAULT_API_BASE_URL)?,
                    "default_local",
                )
            };

        let (ws_base_url, ws_base_url_source) = if let Some(raw) = lookup(ENV_WS_BASE_URL) {
            (normalize_ws_base_url(ENV_WS_BASE_URL, &raw)?, ENV_WS_BASE_URL)
        } else if let Some(raw) = lookup(ENV_WS_BASE_URL_LEGACY) {
            (
                normalize_ws_base_url(ENV_WS_BASE_URL_LEGACY, &raw)?,
                ENV_WS_BASE_URL_LEGACY,
            )
        } else {
            (
                derive_ws_base_url(ENV_API_BASE_URL, &api_base_url)?,
                "derived_from_api",
            )
        };

        let api_timeout_ms = parse_u64(&lookup, ENV_API_TIMEOUT_MS, DEFAULT_API_TIMEOUT_MS)?;
        let ws_connect_timeout_ms = parse_u64(
            &lookup,
            ENV_WS_CONNECT_TIMEOUT_MS,
            DEFAULT_WS_CONNECT_TIMEOUT_MS,
        )?;
        let reconnect_base_ms =
            parse_u64(&lookup, ENV_WS_RECONNECT_BASE_MS, DEFAULT_RECONNECT_BASE_MS)?;
        let reconnect_max_ms =
            parse_u64(&lookup, ENV_WS_RECONNECT_MAX_MS, DEFAULT_RECONNECT_MAX_MS)?;
        let multiplier = parse_multiplier(&lookup)?;
        let max_attempts = parse_u64(
            &lookup,
            ENV_WS_MAX_RECONNECT_ATTEMPTS,
            u64::from(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        )?;
        let max_attempts =
            u32::try_from(max_attempts).map_err(|error| ConfigError::InvalidNumber {
                key: ENV_WS_MAX_RECONNECT_ATTEMPTS,
                message: error.to_string(),
            })?;
        let heartbeat_ms = parse_u64(
            &lookup,
            ENV_WS_HEARTBEAT_INTERVAL_MS,
            DEFAULT_HEARTBEAT_INTERVAL_MS,
        )?;
        let dev_bypass = parse_bool(&lookup, ENV_TOKEN_DEV_BYPASS, false)?;

        Ok(Self {
            api_base_url,
            api_base_url_source,
            ws_base_url,
            ws_base_url_source,
            api_timeout: Duration::from_millis(api_timeout_ms.max(250)),
            ws_connect_timeout: Duration::from_millis(ws_connect_timeout_ms.max(100)),
            reconnect: ReconnectSettings {
                base_delay: Duration::from_millis(reconnect_base_ms),
                multiplier,
                max_delay: Duration::from_millis(reconnect_max_ms.max(reconnect_base_ms)),
                max_attempts,
            },
            heartbeat_interval: (heartbeat_ms > 0).then(|| Duration::from_millis(heartbeat_ms)),
            dev_token_policy: if dev_bypass {
                DevTokenPolicy::AllowTestPrefix
            } else {
                DevTokenPolicy::Strict
            },
            token_store_path: lookup(ENV_TOKEN_STORE_PATH).map(PathBuf::from),
        })
    }
}

pub fn normalize_http_base_url(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    normalize_base_url(key, raw, &["http", "https"], "http:// or https://")
}

pub fn normalize_ws_base_url(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    normalize_base_url(key, raw, &["ws", "wss"], "ws:// or wss://")
}

fn normalize_base_url(
    key: &'static str,
    raw: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl { key });
    }
    let invalid = || ConfigError::InvalidBaseUrl {
        key,
        expected,
        value: trimmed.to_string(),
    };
    let parsed = Url::parse(trimmed).map_err(|_| invalid())?;
    if !schemes.contains(&parsed.scheme()) || parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(trimmed.to_string())
}

/// `http(s)://host[:port]/...` becomes `ws(s)://host[:port]/api/v1/ws`.
pub fn derive_ws_base_url(key: &'static str, api_base_url: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidBaseUrl {
        key,
        expected: "http:// or https://",
        value: api_base_url.to_string(),
    };
    let parsed = Url::parse(api_base_url).map_err(|_| invalid())?;
    let scheme = match parsed.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(invalid()),
    };
    let host = parsed.host_str().ok_or_else(invalid)?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!("{scheme}://{authority}{DEFAULT_WS_PATH}"))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|error| ConfigError::InvalidNumber {
            key,
            message: error.to_string(),
        }),
    }
}

fn parse_multiplier(lookup: &impl Fn(&str) -> Option<String>) -> Result<f64, ConfigError> {
    let Some(raw) = lookup(ENV_WS_RECONNECT_MULTIPLIER) else {
        return Ok(DEFAULT_RECONNECT_MULTIPLIER);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|error| ConfigError::InvalidNumber {
            key: ENV_WS_RECONNECT_MULTIPLIER,
            message: error.to_string(),
        })?;
    if !value.is_finite() || value <= 1.0 {
        return Err(ConfigError::InvalidNumber {
            key: ENV_WS_RECONNECT_MULTIPLIER,
            message: format!("multiplier must be greater than 1, got {value}"),
        });
    }
    Ok(value)
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { key, value: raw }),
    }
}
