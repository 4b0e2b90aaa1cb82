//! Network utilities and helpers

use std::time::Duration;

use crate::core::models::{AppError, AppResult};

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Get user agent string
pub fn get_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Build the shared HTTP client used for direct requests
pub fn build_http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(get_user_agent())
        .connect_timeout(timeout.min(DEFAULT_TIMEOUT))
        .build()
        .map_err(|e| AppError::System(format!("Failed to build HTTP client: {}", e)))
}
