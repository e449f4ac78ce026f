//! Real-time session transport for Zeus.
//!
//! - [`WsClient`]: one authenticated WebSocket with bounded automatic reconnect
//! - [`EventRegistry`]: synchronous, panic-isolated fan-out of session events

pub mod client;
pub mod error;
pub mod events;
pub mod frame;
pub mod reconnect;

pub use client::{ConnectionState, WsClient, WsConfig, generate_client_id};
pub use error::{Result, WsClientError};
pub use events::{EventHandler, EventKey, EventRegistry, ListenerHandle, ListenerId, SessionEvent};
pub use reconnect::{BackoffPolicy, CloseDisposition};
