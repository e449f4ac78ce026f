use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeus_client_core::{ClientConfig, TokenPair, TokenStore, normalize_token_response};

use crate::error::{ApiError, ApiErrorKind};
use crate::models::{SystemStatus, UserProfile};
use crate::refresh::{HttpTokenRefresher, RefreshCoordinator, TokenRefresher, UnauthorizedReason};
use crate::request::{ApiRequest, ApiResponse, RequestBody};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const LOGIN_PATH: &str = "/auth/login";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const REFRESH_PATH: &str = "/auth/refresh-token";
pub const CURRENT_USER_PATH: &str = "/auth/me";
pub const SYSTEM_STATUS_PATH: &str = "/system/status";

const UNAUTHORIZED_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub refresh_path: String,
}

impl ApiClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            refresh_path: REFRESH_PATH.to_string(),
        }
    }

    #[must_use]
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            timeout: config.api_timeout,
            refresh_path: REFRESH_PATH.to_string(),
        }
    }
}

/// REST client bound to one token store. Clones share the refresh coordinator, so
/// a burst of 401s across clones still produces a single refresh call.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiClientInner>,
}

struct ApiClientInner {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
    store: TokenStore,
    refresh: RefreshCoordinator,
    unauthorized: broadcast::Sender<UnauthorizedReason>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .field("timeout", &self.inner.timeout)
            .field("refresh", &self.inner.refresh)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    pub fn new(config: ApiClientConfig, store: TokenStore) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = build_http_client()?;
        let timeout = config.timeout.max(Duration::from_millis(250));
        let refresher = HttpTokenRefresher::new(
            http.clone(),
            join_url(&base_url, &config.refresh_path)?,
            timeout,
        );
        Ok(Self::assemble(base_url, timeout, http, store, Arc::new(refresher)))
    }

    /// Use a custom refresh implementation instead of the HTTP endpoint.
    pub fn with_refresher(
        config: ApiClientConfig,
        store: TokenStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = build_http_client()?;
        let timeout = config.timeout.max(Duration::from_millis(250));
        Ok(Self::assemble(base_url, timeout, http, store, refresher))
    }

    fn assemble(
        base_url: String,
        timeout: Duration,
        http: reqwest::Client,
        store: TokenStore,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let (unauthorized, _) = broadcast::channel(UNAUTHORIZED_CHANNEL_CAPACITY);
        let refresh = RefreshCoordinator::new(store.clone(), refresher, unauthorized.clone());
        Self {
            inner: Arc::new(ApiClientInner {
                base_url,
                timeout,
                http,
                store,
                refresh,
                unauthorized,
            }),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    #[must_use]
    pub fn token_store(&self) -> &TokenStore {
        &self.inner.store
    }

    #[must_use]
    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.inner.refresh
    }

    /// Notified whenever the session is dropped: failed refresh, 403, or logout.
    #[must_use]
    pub fn subscribe_unauthorized(&self) -> broadcast::Receiver<UnauthorizedReason> {
        self.inner.unauthorized.subscribe()
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        join_url(&self.inner.base_url, path).ok()
    }

    /// Send a request with the stored bearer token. A 401 on a refreshable request
    /// triggers one shared refresh and a single replay with the new token.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut request = request;
        let (response, used_token) = self.dispatch(&request).await?;
        if response.status != StatusCode::UNAUTHORIZED || !request.may_refresh() {
            return self.settle(&request, response);
        }

        let current = self.inner.store.access_token();
        if current.is_some() && current != used_token {
            debug!(path = %request.path, "access token changed while in flight, replaying");
        } else {
            debug!(path = %request.path, "access token rejected, refreshing");
            self.inner.refresh.refreshed_token().await?;
        }

        request.retried = true;
        let (replay, _) = self.dispatch(&request).await?;
        self.settle(&request, replay)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
    ) -> Result<(ApiResponse, Option<String>), ApiError> {
        let url = join_url(&self.inner.base_url, &request.path)?;
        let token = if request.is_auth_exempt() {
            None
        } else {
            self.inner.store.access_token()
        };

        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), url.as_str())
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .timeout(self.inner.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await.map_err(|error| {
            warn!(method = %request.method, path = %request.path, error = %error, "request failed without response");
            ApiError::network(error)
        })?;
        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::network)?.to_vec();
        debug!(method = %request.method, path = %request.path, status = status.as_u16(), retried = request.is_retry(), "api response");
        Ok((ApiResponse { status, body }, token))
    }

    fn settle(&self, request: &ApiRequest, response: ApiResponse) -> Result<ApiResponse, ApiError> {
        let status = response.status;
        if status.is_success() {
            return Ok(response);
        }

        let kind = match status {
            StatusCode::UNAUTHORIZED if request.is_auth_exempt() => ApiErrorKind::AuthError,
            other => ApiErrorKind::from_status(other),
        };
        let mut error = ApiError::from_response(kind, status, &response.body);
        match kind {
            ApiErrorKind::AuthError => {
                error.message = "Invalid credentials".to_string();
            }
            ApiErrorKind::Forbidden => {
                warn!(path = %request.path, "access forbidden, ending session");
                self.inner.refresh.end_session(UnauthorizedReason::Forbidden {
                    path: request.path.clone(),
                });
            }
            _ => {}
        }
        Err(error)
    }

    /// Exchange credentials for a token pair and persist it.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH).form([
            ("username", username),
            ("password", password),
            ("grant_type", "password"),
        ]);
        let response = self.send(request).await?;
        let value: Value = serde_json::from_slice(&response.body).map_err(ApiError::decode)?;
        let pair = normalize_token_response(value, None).map_err(|error| {
            ApiError::new(ApiErrorKind::AuthError, error.to_string()).with_cause(error)
        })?;
        self.inner.store.set_tokens(&pair).map_err(|error| {
            ApiError::new(ApiErrorKind::Storage, error.to_string()).with_cause(error)
        })?;
        info!(username, "login succeeded");
        Ok(pair)
    }

    /// Revoke the refresh token server side when possible, then always clear local state.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.inner.store.refresh_token() {
            let request = ApiRequest::post(LOGOUT_PATH)
                .json_value(json!({ "refresh_token": refresh_token }))
                .skip_auth_refresh();
            if let Err(error) = self.send(request).await {
                warn!(code = error.code(), error = %error.message, "server-side logout failed");
            }
        }
        self.inner.refresh.end_session(UnauthorizedReason::LoggedOut);
        info!("logged out");
    }

    /// Force a refresh, joining one already in flight.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        self.inner
            .refresh
            .refreshed_token()
            .await
            .map_err(ApiError::from)
    }

    pub async fn current_user(&self) -> Result<UserProfile, ApiError> {
        self.get_json(CURRENT_USER_PATH).await
    }

    pub async fn system_status(&self) -> Result<SystemStatus, ApiError> {
        self.get_json(SYSTEM_STATUS_PATH).await
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.send(ApiRequest::post(path).json(payload)?).await?.json()
    }

    pub async fn put_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.send(ApiRequest::put(path).json(payload)?).await?.json()
    }

    pub async fn patch_json<Req, Res>(&self, path: &str, payload: &Req) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.send(ApiRequest::patch(path).json(payload)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }
}

fn build_http_client() -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder().build().map_err(|error| {
        ApiError::new(ApiErrorKind::InvalidRequest, "could not build http client").with_cause(error)
    })
}

fn normalize_base_url(base_url: &str) -> Result<String, ApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ApiErrorKind::InvalidRequest,
            "api base url is missing",
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn join_url(base_url: &str, path: &str) -> Result<String, ApiError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ApiError::new(
            ApiErrorKind::InvalidRequest,
            "request path is empty",
        ));
    }
    if trimmed.starts_with('/') {
        Ok(format!("{base_url}{trimmed}"))
    } else {
        Ok(format!("{base_url}/{trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use zeus_client_core::MemoryStorage;

    use super::*;

    fn client(base_url: &str) -> ApiClient {
        ApiClient::new(
            ApiClientConfig::new(base_url),
            TokenStore::new(Arc::new(MemoryStorage::new())),
        )
        .expect("api client")
    }

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let client = client("https://api.zeus.test/api/v1/");

        assert_eq!(
            client.endpoint("/auth/me"),
            Some("https://api.zeus.test/api/v1/auth/me".to_string())
        );
        assert_eq!(
            client.endpoint("auth/me"),
            Some("https://api.zeus.test/api/v1/auth/me".to_string())
        );
        assert_eq!(client.endpoint(""), None);
    }

    #[test]
    fn base_url_missing_is_rejected() {
        let result = ApiClient::new(
            ApiClientConfig::new("   "),
            TokenStore::new(Arc::new(MemoryStorage::new())),
        );
        let error = result.expect_err("missing base url");
        assert_eq!(error.kind, ApiErrorKind::InvalidRequest);
    }

    #[test]
    fn config_follows_client_config() {
        let config = ClientConfig::from_lookup(|key| match key {
            "ZEUS_API_BASE_URL" => Some("https://api.zeus.test/api/v1".to_string()),
            "ZEUS_API_TIMEOUT_MS" => Some("1500".to_string()),
            _ => None,
        })
        .expect("config");
        let api = ApiClientConfig::from_client_config(&config);
        assert_eq!(api.base_url, "https://api.zeus.test/api/v1");
        assert_eq!(api.timeout, Duration::from_millis(1500));
        assert_eq!(api.refresh_path, REFRESH_PATH);
    }
}
