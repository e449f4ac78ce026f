//! Single-flight access token refresh.
//!
//! The first request that needs a new token runs the refresh; every request that
//! arrives while it is in flight parks a oneshot in a FIFO queue and is released
//! with the same outcome once the refresh settles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeus_client_core::token::{clean_token, redact};
use zeus_client_core::{TokenPair, TokenStore, normalize_token_response};

use crate::error::{ApiError, ApiErrorKind, RefreshFailure};

pub type RefreshOutcome = Result<String, RefreshFailure>;

/// Why the session was dropped. Consumers route to their login surface on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnauthorizedReason {
    NoRefreshToken,
    RefreshFailed { message: String },
    Forbidden { path: String },
    LoggedOut,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a new pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;
}

/// Calls `POST {base}/auth/refresh-token` with `{"refresh_token": ...}`.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTokenRefresher {
    #[must_use]
    pub fn new(http: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let response = self
            .http
            .post(self.url.as_str())
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.timeout)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(ApiError::network)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(ApiError::network)?;
        if !status.is_success() {
            let error = ApiError::from_response(ApiErrorKind::RefreshFailed, status, &bytes);
            return Err(error);
        }

        let value = serde_json::from_slice(&bytes).map_err(ApiError::decode)?;
        normalize_token_response(value, Some(refresh_token)).map_err(|error| {
            ApiError::new(ApiErrorKind::RefreshFailed, error.to_string()).with_cause(error)
        })
    }
}

/// Waiters parked behind an in-flight refresh, released in arrival order.
#[derive(Debug, Default)]
pub struct PendingRequestQueue {
    waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

impl PendingRequestQueue {
    fn enqueue(&mut self) -> oneshot::Receiver<RefreshOutcome> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push_back(sender);
        receiver
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn settle(self, outcome: &RefreshOutcome) {
        for waiter in self.waiters {
            // A waiter whose request was dropped has nothing left to resume.
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    is_refreshing: bool,
    pending: PendingRequestQueue,
}

pub struct RefreshCoordinator {
    store: TokenStore,
    refresher: Arc<dyn TokenRefresher>,
    state: Mutex<RefreshState>,
    unauthorized: broadcast::Sender<UnauthorizedReason>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("RefreshCoordinator")
            .field("is_refreshing", &state.is_refreshing)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(
        store: TokenStore,
        refresher: Arc<dyn TokenRefresher>,
        unauthorized: broadcast::Sender<UnauthorizedReason>,
    ) -> Self {
        Self {
            store,
            refresher,
            state: Mutex::new(RefreshState::default()),
            unauthorized,
        }
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.lock_state().is_refreshing
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Return a freshly issued access token, joining an in-flight refresh when one
    /// exists. At most one refresh call runs at a time.
    pub async fn refreshed_token(&self) -> RefreshOutcome {
        let waiter = {
            let mut state = self.lock_state();
            if state.is_refreshing {
                Some(state.pending.enqueue())
            } else {
                state.is_refreshing = true;
                None
            }
        };

        if let Some(waiter) = waiter {
            debug!("joining in-flight token refresh");
            return waiter
                .await
                .unwrap_or_else(|_| Err(RefreshFailure::aborted()));
        }

        let flight = InFlight {
            coordinator: self,
            settled: false,
        };
        let outcome = self.run_refresh().await;
        flight.settle(&outcome);
        outcome
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.store.refresh_token() else {
            warn!("token refresh requested without a stored refresh token");
            return Err(RefreshFailure::new(
                ApiErrorKind::NoRefreshToken,
                "no refresh token available",
            ));
        };

        let pair = self
            .refresher
            .refresh(&refresh_token)
            .await
            .map_err(|error| {
                warn!(code = error.code(), error = %error.message, "token refresh failed");
                RefreshFailure::new(ApiErrorKind::RefreshFailed, error.message)
            })?;

        self.store.set_tokens(&pair).map_err(|error| {
            warn!(error = %error, "failed to persist refreshed tokens");
            RefreshFailure::new(
                ApiErrorKind::RefreshFailed,
                format!("could not persist refreshed tokens: {error}"),
            )
        })?;

        let access = clean_token(&pair.access_token).to_string();
        info!(access = %redact(&access), "access token refreshed");
        Ok(access)
    }

    /// Drop the session and tell subscribers why.
    pub fn end_session(&self, reason: UnauthorizedReason) {
        self.store.clear();
        debug!(?reason, "session ended");
        // No subscribers is fine; the cleared store is the durable signal.
        let _ = self.unauthorized.send(reason);
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, outcome: &RefreshOutcome) {
        let pending = {
            let mut state = self.lock_state();
            state.is_refreshing = false;
            std::mem::take(&mut state.pending)
        };
        if let Err(failure) = outcome {
            let reason = match failure.kind {
                ApiErrorKind::NoRefreshToken => UnauthorizedReason::NoRefreshToken,
                _ => UnauthorizedReason::RefreshFailed {
                    message: failure.message.clone(),
                },
            };
            self.end_session(reason);
        }
        debug!(waiters = pending.len(), ok = outcome.is_ok(), "releasing refresh waiters");
        pending.settle(outcome);
    }
}

/// Resets the coordinator if the refreshing future is dropped mid-flight.
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self, outcome: &RefreshOutcome) {
        self.settled = true;
        self.coordinator.finish(outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let pending = {
            let mut state = self.coordinator.lock_state();
            state.is_refreshing = false;
            std::mem::take(&mut state.pending)
        };
        warn!(waiters = pending.len(), "token refresh cancelled");
        pending.settle(&Err(RefreshFailure::aborted()));
    }
}
