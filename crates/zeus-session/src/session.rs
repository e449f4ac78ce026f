//! One explicitly constructed session: token store, REST client and realtime
//! socket sharing a single lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use zeus_api_client::{ApiClient, ApiClientConfig, UnauthorizedReason};
use zeus_client_core::{ClientConfig, SystemClock, TokenPair, TokenStorage, TokenStore};
use zeus_ws_client::{EventRegistry, WsClient, WsConfig};

use crate::error::{Result, SessionError};

/// Access tokens expiring within this window are refreshed before use.
pub const REFRESH_SKEW_SECONDS: i64 = 60;

pub struct Session {
    config: ClientConfig,
    store: TokenStore,
    api: ApiClient,
    ws: WsClient,
    events: EventRegistry,
    watcher: Mutex<Option<JoinHandle<()>>>,
    refresh_timer: Mutex<Option<AbortHandle>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("api", &self.api)
            .field("ws", &self.ws)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build the session and start watching for lost authorization. Must run inside
    /// a tokio runtime.
    pub async fn init(config: ClientConfig, storage: Arc<dyn TokenStorage>) -> Result<Self> {
        let store =
            TokenStore::with_options(storage, Arc::new(SystemClock), config.dev_token_policy);
        let api = ApiClient::new(ApiClientConfig::from_client_config(&config), store.clone())?;
        let events = EventRegistry::new();
        let ws = WsClient::with_registry(WsConfig::from_client_config(&config), events.clone())?;

        let watcher = tokio::spawn(watch_unauthorized(api.subscribe_unauthorized(), ws.clone()));
        debug!(
            api = %config.api_base_url,
            ws = %config.ws_base_url,
            authenticated = store.snapshot().authenticated,
            "session initialised"
        );

        Ok(Self {
            config,
            store,
            api,
            ws,
            events,
            watcher: Mutex::new(Some(watcher)),
            refresh_timer: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub fn ws(&self) -> &WsClient {
        &self.ws
    }

    #[must_use]
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Fires when the session loses authorization; route the user to sign in.
    #[must_use]
    pub fn unauthorized(&self) -> broadcast::Receiver<UnauthorizedReason> {
        self.api.subscribe_unauthorized()
    }

    /// A stored access token exists and has not expired.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.store
            .access_token()
            .is_some_and(|token| !self.store.is_expired(&token))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair> {
        let pair = self.api.login(username, password).await?;
        self.schedule_proactive_refresh();
        Ok(pair)
    }

    pub async fn logout(&self) {
        self.cancel_refresh_timer();
        self.ws.disconnect().await;
        self.api.logout().await;
    }

    /// Open the realtime socket with a current access token, refreshing first when
    /// the stored one is expired or about to expire.
    pub async fn connect_realtime(&self) -> Result<()> {
        let token = self.fresh_access_token().await?;
        self.ws.connect(&token).await?;
        Ok(())
    }

    async fn fresh_access_token(&self) -> Result<String> {
        if self.store.access_token().is_none() {
            return Err(SessionError::NotAuthenticated);
        }
        if self.store.needs_refresh(REFRESH_SKEW_SECONDS) {
            info!("access token expired or expiring, refreshing before connect");
            let token = self.api.refresh().await?;
            self.schedule_proactive_refresh();
            return Ok(token);
        }
        self.store
            .access_token()
            .ok_or(SessionError::NotAuthenticated)
    }

    /// Refresh shortly before the access token expires, for as long as refreshes
    /// keep succeeding. The timer is registered with the store so `clear` stops it.
    pub fn schedule_proactive_refresh(&self) {
        self.cancel_refresh_timer();
        let store = self.store.clone();
        let api = self.api.clone();
        let timer = tokio::spawn(async move {
            while let Some(wait) = refresh_lead_time(&store) {
                debug!(wait_secs = wait.as_secs(), "proactive refresh scheduled");
                tokio::time::sleep(wait).await;
                if let Err(error) = api.refresh().await {
                    warn!(code = error.code(), error = %error.message, "proactive refresh failed");
                    return;
                }
            }
        });
        *lock(&self.refresh_timer) = Some(timer.abort_handle());
        self.store.register_timer(timer);
    }

    fn cancel_refresh_timer(&self) {
        if let Some(timer) = lock(&self.refresh_timer).take() {
            timer.abort();
        }
    }

    /// Disconnect the socket, stop background tasks and drop every listener.
    /// Stored tokens are kept.
    pub async fn dispose(&self) {
        self.cancel_refresh_timer();
        let watcher = lock(&self.watcher).take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.ws.disconnect().await;
        self.events.clear();
        debug!("session disposed");
    }
}

/// Time until the stored access token should be refreshed; `None` without a
/// decodable expiry.
fn refresh_lead_time(store: &TokenStore) -> Option<Duration> {
    let token = store.access_token()?;
    let exp = store.decode_payload(&token)?.exp?;
    let remaining = exp
        .saturating_sub(REFRESH_SKEW_SECONDS)
        .saturating_sub(store.now_unix());
    Some(Duration::from_secs(u64::try_from(remaining).unwrap_or(0).max(1)))
}

async fn watch_unauthorized(mut signals: broadcast::Receiver<UnauthorizedReason>, ws: WsClient) {
    loop {
        match signals.recv().await {
            Ok(reason) => {
                warn!(?reason, "session no longer authorized, closing realtime socket");
                ws.disconnect().await;
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "unauthorized signals lagged");
                ws.disconnect().await;
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
