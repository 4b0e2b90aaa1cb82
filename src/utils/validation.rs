//! URL and input validation utilities

use url::Url;

use crate::core::models::{AppError, AppResult};

/// Parse a URL entered by the user
pub fn validate_url(url: &str) -> AppResult<Url> {
    let parsed =
        Url::parse(url.trim()).map_err(|e| AppError::Parse(format!("Invalid URL format: {}", e)))?;

    if !is_valid_video_url(parsed.as_str()) {
        return Err(AppError::Parse(format!(
            "Unsupported URL scheme '{}': only http and https are accepted",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

/// Check if URL is a valid video URL
pub fn is_valid_video_url(url: &str) -> bool {
    if let Ok(parsed) = Url::parse(url) {
        let scheme = parsed.scheme();
        scheme == "http" || scheme == "https"
    } else {
        false
    }
}
