//! Authenticated real-time session socket.
//!
//! One [`WsClient`] owns at most one live connection. Abnormal closes are retried
//! by a supervisor task with exponential backoff using the last token passed to
//! [`WsClient::connect`]; a normal or policy-violation close is final.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use zeus_client_core::token::{self, TEST_TOKEN_PREFIX, clean_token, redact};
use zeus_client_core::{ClientConfig, DevTokenPolicy};

use crate::error::{Result, WsClientError};
use crate::events::{EventKey, EventRegistry, ListenerHandle, SessionEvent};
use crate::frame::{Inbound, parse_binary, parse_inbound, ping_frame, pong_frame};
use crate::reconnect::{
    BackoffPolicy, CLOSE_ABNORMAL, CLOSE_CONNECT_TIMEOUT, CLOSE_NO_STATUS, CLOSE_NORMAL,
    CloseDisposition,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const USER_DISCONNECT_REASON: &str = "User disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// `None` disables the keepalive ping.
    pub heartbeat_interval: Option<Duration>,
    pub dev_token_policy: DevTokenPolicy,
}

impl WsConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            dev_token_policy: DevTokenPolicy::Strict,
        }
    }

    #[must_use]
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            base_url: config.ws_base_url.clone(),
            connect_timeout: config.ws_connect_timeout,
            backoff: BackoffPolicy::from(&config.reconnect),
            heartbeat_interval: config.heartbeat_interval,
            dev_token_policy: config.dev_token_policy,
        }
    }
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    config: WsConfig,
    base_url: Url,
    events: EventRegistry,
    state: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
    last_token: Mutex<Option<String>>,
    client_id: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    tasks: Mutex<Tasks>,
    attempts: AtomicU32,
    /// Bumped by every open and by `disconnect`; stale readers compare against it.
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

impl WsClient {
    pub fn new(config: WsConfig) -> Result<Self> {
        Self::with_registry(config, EventRegistry::new())
    }

    /// Dispatch into an existing registry, so listeners outlive the client.
    pub fn with_registry(config: WsConfig, events: EventRegistry) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim())?;
        if base_url.scheme() != "ws" && base_url.scheme() != "wss" {
            return Err(WsClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                base_url.scheme()
            )));
        }
        if base_url.cannot_be_a_base() {
            return Err(WsClientError::InvalidUrl(base_url.to_string()));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                base_url,
                events,
                state,
                last_error: Mutex::new(None),
                last_token: Mutex::new(None),
                client_id: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.client_id).clone()
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(key, handler)
    }

    /// Open the socket with `token`. Malformed tokens are rejected before any state
    /// change. A failed open schedules background reconnects unless the server
    /// refused the credentials.
    pub async fn connect(&self, token: &str) -> Result<()> {
        let token = clean_token(token);
        validate_token(token, self.inner.config.dev_token_policy)?;
        if self.is_connected() {
            return Err(WsClientError::AlreadyConnected);
        }
        if token::is_expired_at(token, Utc::now().timestamp(), self.inner.config.dev_token_policy) {
            warn!(token = %redact(token), "connecting with an expired access token");
        }

        *lock(&self.inner.last_token) = Some(token.to_string());
        self.inner.cancel_reconnect();
        self.inner.attempts.store(0, Ordering::SeqCst);

        match self.inner.open(token).await {
            Ok(_) => Ok(()),
            Err(error) => {
                self.inner.after_failed_open(&error);
                Err(error)
            }
        }
    }

    /// Close intentionally with code 1000. Pending reconnects and the heartbeat stop.
    pub async fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let was_open = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting
        );
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in [tasks.reconnect, tasks.heartbeat].into_iter().flatten() {
            task.abort();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: USER_DISCONNECT_REASON.into(),
            };
            if let Err(error) = writer.send(Message::Close(Some(frame))).await {
                debug!(error = %error, "close frame not delivered");
            }
        }
        if let Some(reader) = tasks.reader {
            reader.abort();
        }

        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Disconnected);
        if was_open {
            info!("websocket disconnected by user");
            self.inner.emit(
                &EventKey::Disconnect,
                &SessionEvent::Disconnected {
                    code: CLOSE_NORMAL,
                    reason: USER_DISCONNECT_REASON.to_string(),
                    was_clean: true,
                },
            );
        }
    }

    pub async fn send<T>(&self, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let text = serde_json::to_string(payload)?;
        self.send_text(text).await
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(WsClientError::NotConnected);
        }
        self.inner.write(Message::Text(text.into())).await
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?*current, to = ?state, "websocket state change");
                *current = state;
                true
            }
        });
    }

    fn record_error(&self, message: impl Into<String>) {
        *lock(&self.last_error) = Some(message.into());
    }

    fn emit(&self, key: &EventKey, event: &SessionEvent) {
        self.events.emit(key, event);
    }

    fn emit_error(&self, key: EventKey, message: &str) {
        self.emit(
            &key,
            &SessionEvent::Error {
                message: message.to_string(),
            },
        );
    }

    fn connection_url(&self, client_id: &str, token: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| WsClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(client_id);
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    /// One connection attempt. Does not schedule reconnects on failure.
    async fn open(self: &Arc<Self>, token: &str) -> Result<String> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Connecting);

        let client_id = generate_client_id();
        let url = self.connection_url(&client_id, token)?;
        debug!(client_id = %client_id, base = %self.base_url, "opening websocket");

        let connected = match timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
            Err(_) => Err(WsClientError::ConnectTimeout(self.config.connect_timeout)),
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
                Err(WsClientError::Rejected(response.status().as_u16()))
            }
            Ok(Err(error)) => Err(WsClientError::WebSocket(error.to_string())),
            Ok(Ok((stream, _response))) => Ok(stream),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(error) => {
                self.set_state(ConnectionState::Error);
                self.record_error(error.to_string());
                self.emit_error(EventKey::ConnectionError, &error.to_string());
                return Err(error);
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            // `disconnect` ran while the handshake was in flight.
            let (mut writer, _) = stream.split();
            let _ = writer.send(Message::Close(None)).await;
            return Err(WsClientError::NotConnected);
        }

        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *lock(&self.client_id) = Some(client_id.clone());
        *lock(&self.last_error) = None;
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        {
            let mut tasks = lock(&self.tasks);
            if let Some(previous) = tasks.reader.replace(tokio::spawn(read_loop(
                Arc::clone(self),
                reader,
                generation,
            ))) {
                previous.abort();
            }
            if let Some(previous) = tasks.heartbeat.take() {
                previous.abort();
            }
            if let Some(interval) = self.config.heartbeat_interval {
                tasks.heartbeat = Some(tokio::spawn(heartbeat_loop(
                    Arc::clone(self),
                    interval,
                    generation,
                )));
            }
        }

        info!(client_id = %client_id, "websocket connected");
        self.emit(
            &EventKey::Connect,
            &SessionEvent::Connected {
                client_id: client_id.clone(),
            },
        );
        Ok(client_id)
    }

    fn after_failed_open(self: &Arc<Self>, error: &WsClientError) {
        match error {
            WsClientError::ConnectTimeout(_) => {
                self.emit(
                    &EventKey::Disconnect,
                    &SessionEvent::Disconnected {
                        code: CLOSE_CONNECT_TIMEOUT,
                        reason: "Connection timeout".to_string(),
                        was_clean: false,
                    },
                );
                self.schedule_reconnect();
            }
            error if error.is_auth_rejection() => {
                warn!(error = %error, "websocket credentials rejected");
                self.emit_error(EventKey::AuthError, &error.to_string());
            }
            WsClientError::Rejected(_) | WsClientError::WebSocket(_) => {
                self.schedule_reconnect();
            }
            _ => {}
        }
    }

    async fn write(&self, message: Message) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(WsClientError::NotConnected)?;
        writer
            .send(message)
            .await
            .map_err(|error| WsClientError::WebSocket(error.to_string()))
    }

    fn handle_inbound(&self, inbound: Inbound) -> Option<String> {
        match inbound {
            Inbound::Ping => Some(pong_frame(Utc::now().timestamp_millis())),
            Inbound::Pong => {
                debug!("heartbeat acknowledged");
                None
            }
            Inbound::Dispatch { key, payload } => {
                let event = SessionEvent::Message {
                    key: key.clone(),
                    payload,
                    received_at_ms: Utc::now().timestamp_millis(),
                };
                self.emit(&key, &event);
                None
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.writer.lock().await.take();
        if let Some(heartbeat) = lock(&self.tasks).heartbeat.take() {
            heartbeat.abort();
        }

        let disposition = CloseDisposition::classify(code);
        let was_clean = disposition == CloseDisposition::Normal;
        match disposition {
            CloseDisposition::Normal => {
                info!(code, reason = %reason, "websocket closed");
                self.set_state(ConnectionState::Disconnected);
            }
            CloseDisposition::PolicyViolation => {
                warn!(code, reason = %reason, "websocket closed for policy violation");
                self.record_error("invalid or expired token");
                self.set_state(ConnectionState::Error);
            }
            CloseDisposition::Timeout | CloseDisposition::Abnormal => {
                warn!(code, reason = %reason, "websocket closed abnormally");
                self.record_error(format!("connection closed abnormally (code {code})"));
                self.set_state(ConnectionState::Error);
            }
        }

        self.emit(
            &EventKey::Disconnect,
            &SessionEvent::Disconnected {
                code,
                reason: reason.clone(),
                was_clean,
            },
        );
        if disposition == CloseDisposition::PolicyViolation {
            self.emit_error(EventKey::AuthError, "invalid or expired token");
        }
        if disposition.should_reconnect() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let task = tokio::spawn(supervise_reconnect(Arc::clone(self)));
        if let Some(previous) = lock(&self.tasks).reconnect.replace(task) {
            previous.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = lock(&self.tasks).reconnect.take() {
            task.abort();
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: WsReader, generation: u64) {
    let mut close = (CLOSE_ABNORMAL, String::from("connection lost"));
    while let Some(frame) = reader.next().await {
        let reply = match frame {
            Ok(Message::Text(text)) => match parse_inbound(text.as_str()) {
                Ok(inbound) => inner.handle_inbound(inbound),
                Err(error) => {
                    warn!(error = %error, "dropping invalid websocket frame");
                    None
                }
            },
            Ok(Message::Binary(bytes)) => match parse_binary(&bytes) {
                Some(inbound) => inner.handle_inbound(inbound),
                None => {
                    debug!(bytes = bytes.len(), "ignoring non-JSON binary frame");
                    None
                }
            },
            Ok(Message::Ping(payload)) => {
                debug!(bytes = payload.len(), "received ping");
                None
            }
            Ok(Message::Pong(_) | Message::Frame(_)) => None,
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    close = (u16::from(frame.code), frame.reason.to_string());
                } else {
                    close = (CLOSE_NO_STATUS, String::new());
                }
                break;
            }
            Err(error) => {
                warn!(error = %error, "websocket read error");
                inner.emit_error(EventKey::Error, &error.to_string());
                break;
            }
        };
        if let Some(reply) = reply
            && let Err(error) = inner.write(Message::Text(reply.into())).await
        {
            debug!(error = %error, "failed to answer server ping");
        }
    }

    let (code, reason) = close;
    inner.handle_close(generation, code, reason).await;
}

async fn heartbeat_loop(inner: Arc<Inner>, interval: Duration, generation: u64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let frame = ping_frame(Utc::now().timestamp_millis());
        if let Err(error) = inner.write(Message::Text(frame.into())).await {
            debug!(error = %error, "heartbeat stopped");
            return;
        }
    }
}

async fn supervise_reconnect(inner: Arc<Inner>) {
    loop {
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !inner.config.backoff.allows(attempt) {
            let message = format!(
                "gave up reconnecting after {} attempts",
                inner.config.backoff.max_attempts
            );
            warn!("{message}");
            inner.record_error(message.clone());
            inner.set_state(ConnectionState::Error);
            inner.emit_error(EventKey::Error, &message);
            return;
        }

        let delay = inner.config.backoff.delay_for(attempt);
        inner.set_state(ConnectionState::Reconnecting);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling websocket reconnect");
        inner.emit(
            &EventKey::Reconnecting,
            &SessionEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
        );
        tokio::time::sleep(delay).await;

        let Some(token) = lock(&inner.last_token).clone() else {
            return;
        };
        match inner.open(&token).await {
            Ok(client_id) => {
                inner.emit(
                    &EventKey::Reconnect,
                    &SessionEvent::Reconnected {
                        client_id,
                        attempts: attempt,
                    },
                );
                return;
            }
            Err(error) if error.is_auth_rejection() => {
                warn!(error = %error, "reconnect rejected, giving up");
                inner.emit_error(EventKey::AuthError, &error.to_string());
                return;
            }
            Err(error) => {
                warn!(attempt, error = %error, "reconnect attempt failed");
            }
        }
    }
}

fn validate_token(token: &str, policy: DevTokenPolicy) -> Result<()> {
    if token.is_empty() {
        return Err(WsClientError::InvalidToken("token is empty".to_string()));
    }
    let bypass = policy.allows_test_prefix() && token.starts_with(TEST_TOKEN_PREFIX);
    if !bypass && !token::is_structurally_valid(token) {
        return Err(WsClientError::InvalidToken(
            "token is not a decodable JWT".to_string(),
        ));
    }
    Ok(())
}

/// `client-{unix_ms}-{9 random chars}`.
#[must_use]
pub fn generate_client_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "client-{}-{}",
        Utc::now().timestamp_millis(),
        &random[..9]
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
