use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use zeus_api_client::{ApiClient, ApiClientConfig, ApiErrorKind, UnauthorizedReason};
use zeus_client_core::{MemoryStorage, TokenPair, TokenStore};

struct Backend {
    access_token: Mutex<String>,
    refresh_token: Mutex<String>,
    refresh_calls: AtomicUsize,
    refresh_delay: Duration,
    refresh_fails: AtomicBool,
    authorized_hits: AtomicUsize,
    logout_bodies: Mutex<Vec<Value>>,
}

impl Backend {
    fn new(refresh_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            access_token: Mutex::new("access-1".to_string()),
            refresh_token: Mutex::new("refresh-1".to_string()),
            refresh_calls: AtomicUsize::new(0),
            refresh_delay,
            refresh_fails: AtomicBool::new(false),
            authorized_hits: AtomicUsize::new(0),
            logout_bodies: Mutex::new(Vec::new()),
        })
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.access_token.lock().expect("lock"));
        let ok = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some(expected.as_str());
        if ok {
            self.authorized_hits.fetch_add(1, Ordering::SeqCst);
        }
        ok
    }
}

struct TestServer {
    base_url: String,
    backend: Arc<Backend>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn unauthorized(detail: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "detail": detail }))).into_response()
}

async fn login(State(backend): State<Arc<Backend>>, Form(form): Form<HashMap<String, String>>) -> Response {
    let valid = form.get("username").map(String::as_str) == Some("zeus")
        && form.get("password").map(String::as_str) == Some("olympus")
        && form.get("grant_type").map(String::as_str) == Some("password");
    if !valid {
        return unauthorized("Incorrect username or password");
    }
    let access = backend.access_token.lock().expect("lock").clone();
    let refresh = backend.refresh_token.lock().expect("lock").clone();
    Json(json!({ "access_token": access, "refresh_token": refresh, "token_type": "bearer" }))
        .into_response()
}

async fn refresh(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    let call = backend.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(backend.refresh_delay).await;
    if backend.refresh_fails.load(Ordering::SeqCst) {
        return unauthorized("invalid refresh token");
    }
    let presented = body.get("refresh_token").and_then(Value::as_str);
    let expected = backend.refresh_token.lock().expect("lock").clone();
    if presented != Some(expected.as_str()) {
        return unauthorized("unknown refresh token");
    }

    let access = format!("access-{}", call + 1);
    let rotated = format!("refresh-{}", call + 1);
    *backend.access_token.lock().expect("lock") = access.clone();
    *backend.refresh_token.lock().expect("lock") = rotated.clone();
    Json(json!({
        "status": "success",
        "data": { "access_token": access, "refresh_token": rotated }
    }))
    .into_response()
}

async fn me(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized("Could not validate credentials");
    }
    Json(json!({
        "status": "success",
        "data": { "id": 1, "username": "zeus", "email": "zeus@olympus.test", "is_active": true }
    }))
    .into_response()
}

async fn system_status(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized("Could not validate credentials");
    }
    Json(json!({
        "cpu_usage": 10.0,
        "active_users": 2,
        "services": { "api": "online", "ws": "degraded" }
    }))
    .into_response()
}

async fn admin() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "detail": "Not enough permissions" }))).into_response()
}

async fn logout(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    backend.logout_bodies.lock().expect("lock").push(body);
    Json(json!({ "status": "success", "data": null })).into_response()
}

async fn start_server(refresh_delay: Duration) -> TestServer {
    let backend = Backend::new(refresh_delay);
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh-token", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/auth/me", get(me))
        .route("/api/v1/system/status", get(system_status))
        .route("/api/v1/admin/users", get(admin))
        .with_state(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    TestServer {
        base_url: format!("http://{addr}/api/v1"),
        backend,
        shutdown: Some(shutdown_tx),
    }
}

fn client_for(server: &TestServer) -> ApiClient {
    let store = TokenStore::new(Arc::new(MemoryStorage::new()));
    ApiClient::new(ApiClientConfig::new(server.base_url.clone()), store).expect("client")
}

#[tokio::test]
async fn login_persists_tokens_and_attaches_bearer() {
    let server = start_server(Duration::ZERO).await;
    let client = client_for(&server);

    let pair = client.login("zeus", "olympus").await.expect("login");
    assert_eq!(pair.access_token, "access-1");
    assert_eq!(client.token_store().access_token().as_deref(), Some("access-1"));
    assert_eq!(client.token_store().refresh_token().as_deref(), Some("refresh-1"));

    let profile = client.current_user().await.expect("profile");
    assert_eq!(profile.id, "1");
    assert_eq!(profile.username.as_deref(), Some("zeus"));

    let status = client.system_status().await.expect("status");
    assert_eq!(status.active_users, 2);
    assert_eq!(server.backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bad_credentials_are_an_auth_error_without_refresh() {
    let server = start_server(Duration::ZERO).await;
    let client = client_for(&server);
    client
        .token_store()
        .set_tokens(&TokenPair::new("stale", "refresh-1"))
        .expect("seed");

    let error = client.login("zeus", "wrong").await.expect_err("rejected");
    assert_eq!(error.kind, ApiErrorKind::AuthError);
    assert_eq!(error.message, "Invalid credentials");
    assert_eq!(error.status.map(|status| status.as_u16()), Some(401));
    assert_eq!(server.backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_token_is_refreshed_and_request_replayed() {
    let server = start_server(Duration::ZERO).await;
    let client = client_for(&server);
    client
        .token_store()
        .set_tokens(&TokenPair::new("expired-access", "refresh-1"))
        .expect("seed");

    let profile = client.current_user().await.expect("replayed request succeeds");
    assert_eq!(profile.username.as_deref(), Some("zeus"));
    assert_eq!(server.backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.token_store().access_token().as_deref(), Some("access-2"));
    assert_eq!(client.token_store().refresh_token().as_deref(), Some("refresh-2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let server = start_server(Duration::from_millis(150)).await;
    let client = client_for(&server);
    client
        .token_store()
        .set_tokens(&TokenPair::new("expired-access", "refresh-1"))
        .expect("seed");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.current_user().await })
        })
        .collect();
    for task in tasks {
        let profile = task.await.expect("join").expect("request succeeds after refresh");
        assert_eq!(profile.id, "1");
    }

    assert_eq!(server.backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.backend.authorized_hits.load(Ordering::SeqCst), 8);
    assert!(!client.refresh_coordinator().is_refreshing());
}

#[tokio::test]
async fn failed_refresh_clears_session_and_signals() {
    let server = start_server(Duration::ZERO).await;
    server.backend.refresh_fails.store(true, Ordering::SeqCst);
    let client = client_for(&server);
    let mut unauthorized = client.subscribe_unauthorized();
    client
        .token_store()
        .set_tokens(&TokenPair::new("expired-access", "refresh-1"))
        .expect("seed");

    let error = client.current_user().await.expect_err("refresh fails");
    assert_eq!(error.kind, ApiErrorKind::RefreshFailed);
    assert_eq!(error.code(), "token_refresh_failed");
    assert_eq!(client.token_store().access_token(), None);
    assert_eq!(client.token_store().refresh_token(), None);
    assert_eq!(
        unauthorized.recv().await.expect("signal"),
        UnauthorizedReason::RefreshFailed {
            message: "invalid refresh token".to_string()
        }
    );
}

#[tokio::test]
async fn forbidden_ends_the_session() {
    let server = start_server(Duration::ZERO).await;
    let client = client_for(&server);
    let mut unauthorized = client.subscribe_unauthorized();
    client.login("zeus", "olympus").await.expect("login");

    let error = client
        .get_json::<Value>("/admin/users")
        .await
        .expect_err("forbidden");
    assert_eq!(error.kind, ApiErrorKind::Forbidden);
    assert_eq!(error.message, "Not enough permissions");
    assert_eq!(client.token_store().access_token(), None);
    assert_eq!(
        unauthorized.recv().await.expect("signal"),
        UnauthorizedReason::Forbidden {
            path: "/admin/users".to_string()
        }
    );
}

#[tokio::test]
async fn logout_revokes_and_clears_even_when_offline() {
    let server = start_server(Duration::ZERO).await;
    let client = client_for(&server);
    client.login("zeus", "olympus").await.expect("login");

    client.logout().await;
    assert_eq!(client.token_store().access_token(), None);
    assert_eq!(
        server.backend.logout_bodies.lock().expect("lock").as_slice(),
        &[json!({ "refresh_token": "refresh-1" })]
    );

    let offline = ApiClient::new(
        ApiClientConfig::new("http://127.0.0.1:9/api/v1"),
        TokenStore::new(Arc::new(MemoryStorage::new())),
    )
    .expect("client");
    offline
        .token_store()
        .set_tokens(&TokenPair::new("access", "refresh"))
        .expect("seed");
    offline.logout().await;
    assert_eq!(offline.token_store().refresh_token(), None);
}

#[tokio::test]
async fn unreachable_server_is_a_network_error_and_keeps_tokens() {
    let client = ApiClient::new(
        ApiClientConfig::new("http://127.0.0.1:9/api/v1"),
        TokenStore::new(Arc::new(MemoryStorage::new())),
    )
    .expect("client");
    let mut unauthorized = client.subscribe_unauthorized();
    client
        .token_store()
        .set_tokens(&TokenPair::new("access", "refresh"))
        .expect("seed");

    let error = client.current_user().await.expect_err("nothing listens on port 9");
    assert_eq!(error.kind, ApiErrorKind::Network);
    assert_eq!(error.status, None);
    assert!(!error.kind.ends_session());
    assert_eq!(client.token_store().access_token().as_deref(), Some("access"));
    assert!(unauthorized.try_recv().is_err());
}
