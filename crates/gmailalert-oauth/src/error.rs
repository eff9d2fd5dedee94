//! Error types for `OAuth2` operations.

use std::io;
use std::time::Duration;

use crate::redirect::RedirectError;
use crate::store::StoreError;

/// Result type alias for `OAuth2` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `OAuth2` error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (binding or serving the redirect listener).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `OAuth2` error from the token endpoint (rejected code, bad client, ...).
    #[error("OAuth2 error: {error} - {description}")]
    OAuth {
        /// Error code (e.g., `invalid_grant`).
        error: String,
        /// Human-readable description.
        description: String,
    },

    /// No refresh token available.
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Invalid token response.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// Waiting for the authorization redirect timed out.
    #[error("Authorization timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid or missing configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Redirect listener port outside the unprivileged range.
    #[error("port must be in the range 1024-65535 (got {0})")]
    InvalidPort(u32),

    /// The redirect request was rejected.
    #[error("Redirect rejected: {0}")]
    Redirect(#[from] RedirectError),

    /// Token cache error.
    #[error("Token store error: {0}")]
    Store(#[from] StoreError),

    /// The redirect listener stopped before delivering an outcome.
    #[error("Redirect listener closed before an authorization code or error was received")]
    ListenerClosed,

    /// URL parsing error.
    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),
}

impl Error {
    /// Creates an OAuth error from error code and description.
    #[must_use]
    pub fn oauth_error(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::OAuth {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Returns true for configuration errors that are fatal before any
    /// network activity.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::InvalidPort(_) | Self::UrlError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_port_names_value() {
        let err = Error::InvalidPort(70000);
        assert_eq!(
            err.to_string(),
            "port must be in the range 1024-65535 (got 70000)"
        );
        assert!(err.is_config());
    }

    #[test]
    fn test_oauth_error() {
        let err = Error::oauth_error("invalid_grant", "Bad Request");
        assert_eq!(err.to_string(), "OAuth2 error: invalid_grant - Bad Request");
        assert!(!err.is_config());
    }

    #[test]
    fn test_timeout_keeps_sub_second_precision() {
        let err = Error::Timeout(Duration::from_millis(50));
        assert_eq!(err.to_string(), "Authorization timed out after 50ms");
        assert_eq!(
            Error::Timeout(Duration::from_secs(120)).to_string(),
            "Authorization timed out after 120s"
        );
    }
}
