//! Reconnect policy: close-code classification and exponential backoff.

use std::time::Duration;

use zeus_client_core::ReconnectSettings;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Private-range code recorded when the opening handshake does not finish in time.
pub const CLOSE_CONNECT_TIMEOUT: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Intentional close: settle in `Disconnected`.
    Normal,
    /// Credentials rejected: settle in `Error`, never retry with the same token.
    PolicyViolation,
    /// Opening handshake timed out.
    Timeout,
    /// Anything else, including a dropped transport.
    Abnormal,
}

impl CloseDisposition {
    #[must_use]
    pub fn classify(code: u16) -> Self {
        match code {
            CLOSE_NORMAL | CLOSE_GOING_AWAY => Self::Normal,
            CLOSE_POLICY_VIOLATION => Self::PolicyViolation,
            CLOSE_CONNECT_TIMEOUT => Self::Timeout,
            _ => Self::Abnormal,
        }
    }

    #[must_use]
    pub fn should_reconnect(self) -> bool {
        matches!(self, Self::Timeout | Self::Abnormal)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for BackoffPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            base: settings.base_delay,
            multiplier: settings.multiplier,
            max_delay: settings.max_delay,
            max_attempts: settings.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect `attempt` (1-based): `base * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max_delay.as_millis().max(self.base.as_millis()) as f64;
        Duration::from_millis((base_ms * factor).min(max_ms) as u64)
    }

    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
