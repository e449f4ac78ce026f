use thiserror::Error;
use zeus_api_client::ApiError;
use zeus_client_core::ConfigError;
use zeus_ws_client::WsClientError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Socket(#[from] WsClientError),

    #[error("not signed in")]
    NotAuthenticated,
}

pub type Result<T> = std::result::Result<T, SessionError>;
