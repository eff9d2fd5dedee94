//! Cached `OAuth2` credential and token endpoint payloads.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds before the recorded expiry at which a credential counts as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// `OAuth2` access/refresh token pair with expiry.
///
/// Serialized as `{"access_token", "token_type", "refresh_token", "expiry"}`,
/// the layout of the on-disk token cache. The `Debug` output redacts both
/// tokens so credentials can be logged structurally.
///
/// `expiry` is held in UTC. A cache written with another offset (for example
/// `2024-03-01T07:00:00-05:00`) loads as the same instant but is written back
/// in `Z` form, so only caches produced by this crate round-trip byte for byte.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Access token string.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default)]
    pub token_type: String,
    /// Refresh token for obtaining new access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration time, normalized to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Creates a new credential.
    #[must_use]
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            refresh_token: None,
            expiry: None,
        }
    }

    /// Creates a credential from a token endpoint response.
    ///
    /// # Errors
    ///
    /// Returns an error if the response carries no access token.
    pub fn from_response(response: TokenResponse) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(Error::InvalidResponse(
                "token endpoint returned an empty access_token".into(),
            ));
        }

        let expiry = response
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(i64::from(secs)));

        Ok(Self {
            access_token: response.access_token,
            token_type: response.token_type,
            refresh_token: response.refresh_token,
            expiry,
        })
    }

    /// Sets the refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Sets the expiration time.
    #[must_use]
    pub const fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Checks if the token is expired (with 60 second buffer).
    ///
    /// Credentials without an expiry never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expiry
            .is_some_and(|exp| Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) >= exp)
    }

    /// Returns the refresh token if available.
    ///
    /// # Errors
    ///
    /// Returns an error if no refresh token is available.
    pub fn refresh_token(&self) -> Result<&str> {
        self.refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(Error::NoRefreshToken)
    }

    /// Returns the `Authorization` header value for this credential.
    ///
    /// An empty or lowercase `bearer` type is normalized to `Bearer`.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        let kind = if self.token_type.is_empty() || self.token_type.eq_ignore_ascii_case("bearer")
        {
            "Bearer"
        } else {
            self.token_type.as_str()
        };
        format!("{kind} {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Token response from `OAuth2` server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type.
    #[serde(default)]
    pub token_type: String,
    /// Expires in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u32>,
    /// Refresh token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Error response from `OAuth2` server.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub error: String,
    /// Error description.
    #[serde(default)]
    pub error_description: String,
}

impl ErrorResponse {
    /// Converts to an Error.
    #[must_use]
    pub fn into_error(self) -> Error {
        Error::oauth_error(self.error, self.error_description)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_json_layout() {
        let expiry = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let credential = Credential::new("ya29.access", "Bearer")
            .with_refresh_token("1//refresh")
            .with_expiry(expiry);

        let json = serde_json::to_string(&credential).unwrap();
        assert_eq!(
            json,
            r#"{"access_token":"ya29.access","token_type":"Bearer","refresh_token":"1//refresh","expiry":"2024-03-01T12:00:00Z"}"#
        );
    }

    #[test]
    fn test_credential_optional_fields_omitted() {
        let json = serde_json::to_string(&Credential::new("a", "Bearer")).unwrap();
        assert_eq!(json, r#"{"access_token":"a","token_type":"Bearer"}"#);
    }

    #[test]
    fn test_credential_accepts_offset_expiry() {
        let json = r#"{"access_token":"a","token_type":"Bearer","expiry":"2024-03-01T07:00:00-05:00"}"#;
        let credential: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(
            credential.expiry.unwrap().to_rfc3339(),
            "2024-03-01T12:00:00+00:00"
        );

        let rewritten = serde_json::to_string(&credential).unwrap();
        assert!(rewritten.contains(r#""expiry":"2024-03-01T12:00:00Z""#), "{rewritten}");
    }

    #[test]
    fn test_credential_expiration() {
        let expired =
            Credential::new("a", "Bearer").with_expiry(Utc::now() - Duration::seconds(120));
        assert!(expired.is_expired());

        let almost = Credential::new("a", "Bearer").with_expiry(Utc::now() + Duration::seconds(30));
        assert!(almost.is_expired());

        let valid = Credential::new("a", "Bearer").with_expiry(Utc::now() + Duration::seconds(3600));
        assert!(!valid.is_expired());

        assert!(!Credential::new("a", "Bearer").is_expired());
    }

    #[test]
    fn test_refresh_token_required() {
        let credential = Credential::new("a", "Bearer");
        assert!(matches!(
            credential.refresh_token(),
            Err(Error::NoRefreshToken)
        ));
        let credential = credential.with_refresh_token("r");
        assert_eq!(credential.refresh_token().unwrap(), "r");
    }

    #[test]
    fn test_authorization_header_normalizes_type() {
        assert_eq!(
            Credential::new("abc", "bearer").authorization_header(),
            "Bearer abc"
        );
        assert_eq!(Credential::new("abc", "").authorization_header(), "Bearer abc");
        assert_eq!(Credential::new("abc", "MAC").authorization_header(), "MAC abc");
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = Credential::new("secret-access", "Bearer").with_refresh_token("secret-refresh");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_credential_from_response() {
        let response = TokenResponse {
            access_token: "test_token".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            refresh_token: Some("refresh".to_string()),
            scope: Some("email".to_string()),
        };

        let credential = Credential::from_response(response).unwrap();
        assert_eq!(credential.access_token, "test_token");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh"));
        assert!(credential.expiry.is_some());
        assert!(!credential.is_expired());
    }

    #[test]
    fn test_credential_from_empty_response_rejected() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"","token_type":"Bearer"}"#).unwrap();
        assert!(matches!(
            Credential::from_response(response),
            Err(Error::InvalidResponse(_))
        ));
    }
}
