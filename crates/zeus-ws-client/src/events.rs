//! Event dispatch between the socket and its consumers.
//!
//! Handlers are registered per [`EventKey`] and invoked synchronously, in
//! registration order. A panicking handler is logged and skipped; it never reaches
//! its siblings or the emitter.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Connect,
    Disconnect,
    Reconnecting,
    Reconnect,
    Error,
    AuthError,
    ConnectionError,
    Message,
    SystemStatus,
    AuthResponse,
    StatusUpdate,
    Custom(String),
}

impl EventKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reconnecting => "reconnecting",
            Self::Reconnect => "reconnect",
            Self::Error => "error",
            Self::AuthError => "auth_error",
            Self::ConnectionError => "connection_error",
            Self::Message => "message",
            Self::SystemStatus => "system_status",
            Self::AuthResponse => "auth_response",
            Self::StatusUpdate => "status_update",
            Self::Custom(name) => name.as_str(),
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "reconnecting" => Self::Reconnecting,
            "reconnect" => Self::Reconnect,
            "error" => Self::Error,
            "auth_error" => Self::AuthError,
            "connection_error" => Self::ConnectionError,
            "message" => Self::Message,
            "system_status" => Self::SystemStatus,
            "auth_response" => Self::AuthResponse,
            "status_update" => Self::StatusUpdate,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<&str> for EventKey {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        client_id: String,
    },
    Disconnected {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    Reconnected {
        client_id: String,
        attempts: u32,
    },
    Error {
        message: String,
    },
    /// A server frame, keyed by its `type` field.
    Message {
        key: EventKey,
        payload: Value,
        received_at_ms: i64,
    },
}

pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    handler: EventHandler,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKey, Vec<Listener>>>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKey, Vec<Listener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, key: &EventKey, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|listener| listener.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(key);
        }
        removed
    }
}

/// Shared handler table. Clones refer to the same listeners.
#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.inner.lock();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(key, entries)| (key.as_str(), entries.len()))
            .collect();
        f.debug_struct("EventRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, key: impl Into<EventKey>, handler: F) -> ListenerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.add_handler(key, Arc::new(handler))
    }

    /// Register a shared handler. Registering the same `Arc` twice under one key
    /// returns the existing registration.
    pub fn add_handler(&self, key: impl Into<EventKey>, handler: EventHandler) -> ListenerHandle {
        let key = key.into();
        let mut listeners = self.inner.lock();
        let entries = listeners.entry(key.clone()).or_default();
        let id = match entries
            .iter()
            .find(|listener| Arc::ptr_eq(&listener.handler, &handler))
        {
            Some(existing) => existing.id,
            None => {
                let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
                entries.push(Listener { id, handler });
                id
            }
        };
        ListenerHandle {
            registry: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    pub fn remove_listener(&self, key: &EventKey, id: ListenerId) -> bool {
        self.inner.remove(key, id)
    }

    /// Invoke every handler for `key`. Returns how many handlers ran to completion.
    pub fn emit(&self, key: &EventKey, event: &SessionEvent) -> usize {
        let handlers: Vec<EventHandler> = self
            .inner
            .lock()
            .get(key)
            .map(|entries| entries.iter().map(|listener| listener.handler.clone()).collect())
            .unwrap_or_default();

        let mut completed = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    error!(
                        event = %key,
                        panic = panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
        completed
    }

    #[must_use]
    pub fn listener_count(&self, key: &EventKey) -> usize {
        self.inner.lock().get(key).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Removes its listener on [`ListenerHandle::dispose`]. Dropping the handle leaves
/// the listener registered.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    registry: Weak<RegistryInner>,
    key: EventKey,
    id: ListenerId,
}

impl ListenerHandle {
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &EventKey {
        &self.key
    }

    /// Returns false if the listener was already gone.
    pub fn dispose(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(&self.key, self.id))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
