use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use zeus_session::api::{ApiErrorKind, UnauthorizedReason};
use zeus_session::core::{ClientConfig, MemoryStorage, TokenPair};
use zeus_session::ws::{ConnectionState, EventKey, SessionEvent};
use zeus_session::{Session, SessionError};

fn jwt(subject: &str, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({ "sub": subject, "exp": exp }).to_string());
    format!("{header}.{payload}.signature")
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Default)]
struct Backend {
    issued: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    socket_tokens: Mutex<Vec<String>>,
    socket_clients: Mutex<Vec<String>>,
}

impl Backend {
    fn issue(&self) -> Value {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        json!({
            "access_token": jwt(&format!("zeus-{n}"), now() + 3_600),
            "refresh_token": format!("refresh-{n}"),
            "token_type": "bearer"
        })
    }
}

struct TestServer {
    config: ClientConfig,
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

async fn login(State(backend): State<Arc<Backend>>, Form(form): Form<HashMap<String, String>>) -> Response {
    if form.get("password").map(String::as_str) != Some("olympus") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Incorrect username or password" })),
        )
            .into_response();
    }
    Json(backend.issue()).into_response()
}

async fn refresh(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if body.get("refresh_token").and_then(Value::as_str).is_none() {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "missing refresh token" })))
            .into_response();
    }
    Json(json!({ "status": "success", "data": backend.issue() })).into_response()
}

async fn logout(State(backend): State<Arc<Backend>>) -> Response {
    backend.logout_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "status": "success", "data": null })).into_response()
}

async fn admin() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "detail": "Not enough permissions" }))).into_response()
}

async fn realtime(
    State(backend): State<Arc<Backend>>,
    Path(client_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    backend
        .socket_tokens
        .lock()
        .expect("lock")
        .push(query.get("token").cloned().unwrap_or_default());
    backend.socket_clients.lock().expect("lock").push(client_id);
    ws.on_upgrade(greet_and_hold)
}

async fn greet_and_hold(mut socket: WebSocket) {
    let status = json!({ "type": "system_status", "data": { "api": "online" } });
    if socket.send(Message::Text(status.to_string())).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn start_server() -> TestServer {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh-token", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route("/api/v1/admin/users", get(admin))
        .route("/api/v1/ws/:client_id", get(realtime))
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

    let api_base = format!("http://{addr}/api/v1");
    let config = ClientConfig::from_lookup(|key| match key {
        "ZEUS_API_BASE_URL" => Some(api_base.clone()),
        "ZEUS_WS_HEARTBEAT_INTERVAL_MS" => Some("0".to_string()),
        "ZEUS_WS_MAX_RECONNECT_ATTEMPTS" => Some("0".to_string()),
        _ => None,
    })
    .expect("config");

    TestServer {
        config,
        backend,
        shutdown: Some(shutdown_tx),
    }
}

async fn session_for(server: &TestServer) -> Session {
    Session::init(server.config.clone(), Arc::new(MemoryStorage::new()))
        .await
        .expect("session")
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    timeout(Duration::from_secs(5), rx.wait_for(|state| *state == target))
        .await
        .expect("state change in time")
        .expect("state channel open");
}

#[tokio::test]
async fn login_then_realtime_uses_the_stored_token() {
    let server = start_server().await;
    let session = session_for(&server).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _listener = session.events().add_listener(EventKey::SystemStatus, move |event| {
        let _ = tx.send(event.clone());
    });

    assert!(!session.is_authenticated());
    session.login("zeus", "olympus").await.expect("login");
    assert!(session.is_authenticated());
    assert_eq!(session.store().pending_timers(), 1);

    session.connect_realtime().await.expect("connect");
    assert_eq!(session.ws().state(), ConnectionState::Connected);

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("status in time")
        .expect("status event");
    assert!(matches!(
        &event,
        SessionEvent::Message { key: EventKey::SystemStatus, payload, .. }
            if payload["data"]["api"] == "online"
    ));

    let tokens = server.backend.socket_tokens.lock().expect("lock").clone();
    assert_eq!(tokens, vec![session.store().access_token().expect("access")]);
    let clients = server.backend.socket_clients.lock().expect("lock").clone();
    assert_eq!(clients.first().cloned(), session.ws().client_id());
    assert_eq!(server.backend.refresh_calls.load(Ordering::SeqCst), 0);

    session.dispose().await;
}

#[tokio::test]
async fn expired_access_token_is_refreshed_before_connecting() {
    let server = start_server().await;
    let session = session_for(&server).await;
    let stale = jwt("zeus-0", now() - 30);
    session
        .store()
        .set_tokens(&TokenPair::new(stale.clone(), "refresh-0"))
        .expect("seed");

    session.connect_realtime().await.expect("connect");

    assert_eq!(server.backend.refresh_calls.load(Ordering::SeqCst), 1);
    let fresh = session.store().access_token().expect("access");
    assert_ne!(fresh, stale);
    assert_eq!(session.store().refresh_token().as_deref(), Some("refresh-1"));
    let tokens = server.backend.socket_tokens.lock().expect("lock").clone();
    assert_eq!(tokens, vec![fresh]);

    session.dispose().await;
}

#[tokio::test]
async fn realtime_requires_a_signed_in_session() {
    let server = start_server().await;
    let session = session_for(&server).await;

    let error = session.connect_realtime().await.expect_err("no tokens");
    assert!(matches!(error, SessionError::NotAuthenticated));
    assert_eq!(session.ws().state(), ConnectionState::Disconnected);
    assert!(server.backend.socket_tokens.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn bad_credentials_surface_as_api_errors() {
    let server = start_server().await;
    let session = session_for(&server).await;

    let error = session.login("zeus", "wrong").await.expect_err("rejected");
    match error {
        SessionError::Api(api) => assert_eq!(api.kind, ApiErrorKind::AuthError),
        other => assert!(matches!(other, SessionError::Api(_)), "{other}"),
    }
    assert!(!session.is_authenticated());
    assert_eq!(session.store().pending_timers(), 0);
}

#[tokio::test]
async fn forbidden_response_tears_down_the_socket() {
    let server = start_server().await;
    let session = session_for(&server).await;
    let mut unauthorized = session.unauthorized();
    session.login("zeus", "olympus").await.expect("login");
    session.connect_realtime().await.expect("connect");
    let mut state = session.ws().subscribe_state();

    let error = session
        .api()
        .get_json::<Value>("/admin/users")
        .await
        .expect_err("forbidden");
    assert_eq!(error.kind, ApiErrorKind::Forbidden);

    let reason = timeout(Duration::from_secs(5), unauthorized.recv())
        .await
        .expect("signal in time")
        .expect("signal");
    assert_eq!(
        reason,
        UnauthorizedReason::Forbidden {
            path: "/admin/users".to_string()
        }
    );
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    assert!(session.store().access_token().is_none());
    assert_eq!(session.store().pending_timers(), 0);
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn logout_closes_the_socket_and_clears_tokens() {
    let server = start_server().await;
    let session = session_for(&server).await;
    session.login("zeus", "olympus").await.expect("login");
    session.connect_realtime().await.expect("connect");

    session.logout().await;

    assert_eq!(session.ws().state(), ConnectionState::Disconnected);
    assert!(session.store().access_token().is_none());
    assert!(session.store().refresh_token().is_none());
    assert_eq!(server.backend.logout_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dispose_disconnects_and_drops_listeners_but_keeps_tokens() {
    let server = start_server().await;
    let session = session_for(&server).await;
    let _listener = session
        .events()
        .add_listener(EventKey::Disconnect, |_event| {});
    session.login("zeus", "olympus").await.expect("login");
    session.connect_realtime().await.expect("connect");

    session.dispose().await;

    assert_eq!(session.ws().state(), ConnectionState::Disconnected);
    assert_eq!(session.events().listener_count(&EventKey::Disconnect), 0);
    assert!(session.store().access_token().is_some());
}
