//! Single source of truth for the current access/refresh token pair.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::storage::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, StorageError, TokenStorage};
use crate::token::{
    self, Clock, DevTokenPolicy, SystemClock, TokenPair, TokenPayload, clean_token,
};

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("access token must not be empty")]
    MissingAccessToken,
    #[error("refresh token must not be empty")]
    MissingRefreshToken,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Observable summary of the store, bumped on every write or clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub generation: u64,
    pub authenticated: bool,
}

/// Cheaply cloneable handle; all clones share storage, timers and change feed.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
    storage: Arc<dyn TokenStorage>,
    clock: Arc<dyn Clock>,
    policy: DevTokenPolicy,
    timers: Mutex<Vec<JoinHandle<()>>>,
    changes: watch::Sender<TokenSnapshot>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("policy", &self.inner.policy)
            .field("snapshot", &*self.inner.changes.borrow())
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(storage: Arc<dyn TokenStorage>) -> Self {
        Self::with_options(storage, Arc::new(SystemClock), DevTokenPolicy::Strict)
    }

    pub fn with_options(
        storage: Arc<dyn TokenStorage>,
        clock: Arc<dyn Clock>,
        policy: DevTokenPolicy,
    ) -> Self {
        let authenticated = read_key(storage.as_ref(), ACCESS_TOKEN_KEY).is_some();
        let (changes, _) = watch::channel(TokenSnapshot {
            generation: 0,
            authenticated,
        });
        Self {
            inner: Arc::new(TokenStoreInner {
                storage,
                clock,
                policy,
                timers: Mutex::new(Vec::new()),
                changes,
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> DevTokenPolicy {
        self.inner.policy
    }

    #[must_use]
    pub fn now_unix(&self) -> i64 {
        self.inner.clock.now_unix()
    }

    /// Persist both tokens. On a quota error every stored entry is cleared so the
    /// next write has room.
    pub fn set_tokens(&self, pair: &TokenPair) -> Result<(), TokenStoreError> {
        let access = clean_token(&pair.access_token);
        let refresh = pair.refresh_token.trim();
        if access.is_empty() {
            warn!("refusing to store token pair without an access token");
            return Err(TokenStoreError::MissingAccessToken);
        }
        if refresh.is_empty() {
            warn!("refusing to store token pair without a refresh token");
            return Err(TokenStoreError::MissingRefreshToken);
        }

        let storage = self.inner.storage.as_ref();
        let previous_access = read_key(storage, ACCESS_TOKEN_KEY);
        let written = storage.set(ACCESS_TOKEN_KEY, access).and_then(|()| {
            storage.set(REFRESH_TOKEN_KEY, refresh).inspect_err(|_| {
                restore_key(storage, ACCESS_TOKEN_KEY, previous_access.as_deref());
            })
        });
        if let Err(storage_error) = written {
            error!(error = %storage_error, "failed to persist token pair");
            if storage_error.is_quota_exceeded() {
                warn!("storage quota exceeded, clearing all stored session state");
                if let Err(clear_error) = storage.clear_all() {
                    error!(error = %clear_error, "failed to clear storage after quota error");
                }
            }
            self.publish();
            return Err(storage_error.into());
        }

        debug!(access = %token::redact(access), "stored token pair");
        self.publish();
        Ok(())
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        read_key(self.inner.storage.as_ref(), ACCESS_TOKEN_KEY)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        read_key(self.inner.storage.as_ref(), REFRESH_TOKEN_KEY)
    }

    /// Remove both tokens and cancel pending refresh timers.
    pub fn clear(&self) {
        let storage = self.inner.storage.as_ref();
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(storage_error) = storage.remove(key) {
                error!(key, error = %storage_error, "failed to remove stored token");
            }
        }
        let timers = std::mem::take(&mut *self.lock_timers());
        for timer in timers {
            timer.abort();
        }
        debug!("cleared stored tokens");
        self.publish();
    }

    /// Track a timer (for example a scheduled proactive refresh) so `clear` cancels it.
    pub fn register_timer(&self, timer: JoinHandle<()>) {
        let mut timers = self.lock_timers();
        timers.retain(|existing| !existing.is_finished());
        timers.push(timer);
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.lock_timers()
            .iter()
            .filter(|timer| !timer.is_finished())
            .count()
    }

    #[must_use]
    pub fn is_expired(&self, token: &str) -> bool {
        token::is_expired_at(token, self.now_unix(), self.inner.policy)
    }

    #[must_use]
    pub fn decode_payload(&self, token: &str) -> Option<TokenPayload> {
        token::decode_payload(token)
    }

    /// Stored access token is missing, expired, or expires within `skew_seconds`.
    #[must_use]
    pub fn needs_refresh(&self, skew_seconds: i64) -> bool {
        self.access_token().is_none_or(|access| {
            token::expires_within(&access, self.now_unix(), skew_seconds, self.inner.policy)
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> TokenSnapshot {
        *self.inner.changes.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TokenSnapshot> {
        self.inner.changes.subscribe()
    }

    fn publish(&self) {
        let authenticated = self.access_token().is_some();
        self.inner.changes.send_modify(|snapshot| {
            snapshot.generation += 1;
            snapshot.authenticated = authenticated;
        });
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_key(storage: &dyn TokenStorage, key: &str) -> Option<String> {
    match storage.get(key) {
        Ok(value) => value.filter(|value| !value.trim().is_empty()),
        Err(storage_error) => {
            warn!(key, error = %storage_error, "failed to read stored token");
            None
        }
    }
}

/// Put back the value a half-written pair replaced.
fn restore_key(storage: &dyn TokenStorage, key: &str, previous: Option<&str>) {
    let restored = match previous {
        Some(value) => storage.set(key, value),
        None => storage.remove(key),
    };
    if let Err(storage_error) = restored {
        error!(key, error = %storage_error, "failed to roll back partially stored token pair");
    }
}
