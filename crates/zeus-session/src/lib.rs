//! Session composition root for Zeus clients.

mod error;
mod session;

pub use error::{Result, SessionError};
pub use session::{REFRESH_SKEW_SECONDS, Session};

pub use zeus_api_client as api;
pub use zeus_client_core as core;
pub use zeus_ws_client as ws;
