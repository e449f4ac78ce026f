//! Shared client core for Zeus: token pair handling, persistent token store,
//! response normalization and environment configuration.

pub mod config;
pub mod envelope;
pub mod storage;
pub mod store;
pub mod token;

pub use config::{ClientConfig, ConfigError, ReconnectSettings};
pub use envelope::{EnvelopeError, normalize_token_response, unwrap_envelope};
pub use storage::{FileStorage, MemoryStorage, StorageError, TokenStorage};
pub use store::{TokenSnapshot, TokenStore, TokenStoreError};
pub use token::{Clock, DevTokenPolicy, FixedClock, SystemClock, TokenPair, TokenPayload};
