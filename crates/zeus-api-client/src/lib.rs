//! HTTP client for the Zeus API: bearer attachment, single-flight token refresh on
//! 401 and a normalized error taxonomy.

mod client;
mod error;
mod models;
mod refresh;
mod request;

pub use client::{
    ApiClient, ApiClientConfig, CURRENT_USER_PATH, DEFAULT_TIMEOUT_MS, LOGIN_PATH, LOGOUT_PATH,
    REFRESH_PATH, SYSTEM_STATUS_PATH,
};
pub use error::{ApiError, ApiErrorCause, ApiErrorKind, RefreshFailure};
pub use models::{ServiceHealth, SystemStatus, UserProfile};
pub use refresh::{
    HttpTokenRefresher, PendingRequestQueue, RefreshCoordinator, RefreshOutcome, TokenRefresher,
    UnauthorizedReason,
};
pub use request::{ApiRequest, ApiResponse, RequestBody, is_auth_exempt_path};
