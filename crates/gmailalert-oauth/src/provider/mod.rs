//! `OAuth2` provider configuration parsed from a client credentials document.

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Read-only Gmail scope, the only one the alerter needs.
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Client credentials document as downloaded from the Google Cloud console.
#[derive(Debug, Deserialize)]
struct ClientDocument {
    installed: Option<ClientSection>,
    web: Option<ClientSection>,
}

#[derive(Debug, Deserialize)]
struct ClientSection {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    auth_uri: String,
    #[serde(default)]
    token_uri: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

/// Everything needed to send the user to the provider and redeem the code.
///
/// Immutable once parsed; [`with_redirect_uri`](Self::with_redirect_uri)
/// returns a modified copy.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Client ID from provider.
    pub client_id: String,
    /// Client secret (optional for public clients).
    pub client_secret: Option<String>,
    /// Authorization endpoint URL.
    pub auth_url: Url,
    /// Token endpoint URL.
    pub token_url: Url,
    /// Redirect URI registered with the provider.
    pub redirect_uri: Option<String>,
    /// Requested scopes.
    pub scopes: Vec<String>,
}

impl AuthorizationRequest {
    /// Creates a new authorization request.
    ///
    /// # Errors
    ///
    /// Returns an error if URLs are invalid or the client ID is empty.
    pub fn new(
        client_id: impl Into<String>,
        auth_url: impl AsRef<str>,
        token_url: impl AsRef<str>,
    ) -> Result<Self> {
        let request = Self {
            client_id: client_id.into(),
            client_secret: None,
            auth_url: Url::parse(auth_url.as_ref())?,
            token_url: Url::parse(token_url.as_ref())?,
            redirect_uri: None,
            scopes: Vec::new(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Parses a Google client credentials document (`installed` or `web`
    /// application type) and attaches the given scopes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the document is empty, is not
    /// JSON, has neither an `installed` nor a `web` section, or lacks a
    /// client ID or endpoint.
    pub fn from_json(document: &[u8], scopes: &[&str]) -> Result<Self> {
        if document.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::InvalidConfig(
                "provider configuration must not be empty".into(),
            ));
        }

        let doc: ClientDocument = serde_json::from_slice(document).map_err(|e| {
            Error::InvalidConfig(format!("provider configuration is not valid JSON: {e}"))
        })?;

        let section = doc.installed.or(doc.web).ok_or_else(|| {
            Error::InvalidConfig(
                "provider configuration must contain an \"installed\" or \"web\" section".into(),
            )
        })?;

        if section.auth_uri.is_empty() || section.token_uri.is_empty() {
            return Err(Error::InvalidConfig(
                "provider configuration must contain auth_uri and token_uri".into(),
            ));
        }

        let mut request = Self::new(section.client_id, &section.auth_uri, &section.token_uri)?
            .with_scopes(scopes.iter().map(ToString::to_string).collect());

        if !section.client_secret.is_empty() {
            request = request.with_client_secret(section.client_secret);
        }
        if let Some(uri) = section.redirect_uris.into_iter().next() {
            request = request.with_redirect_uri(uri);
        }

        Ok(request)
    }

    /// Sets the client secret.
    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets the redirect URI.
    #[must_use]
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }

    /// Sets the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Validates that required fields are set.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::InvalidConfig("client_id is empty".into()));
        }
        if self.auth_url.as_str().is_empty() {
            return Err(Error::InvalidConfig("auth_url is empty".into()));
        }
        if self.token_url.as_str().is_empty() {
            return Err(Error::InvalidConfig("token_url is empty".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("auth_url", &self.auth_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
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

    const INSTALLED: &str = r#"{"installed":{"client_id":"ID","project_id":"PROJECTID","auth_uri":"https://accounts.google.com/o/oauth2/auth","token_uri":"https://oauth2.googleapis.com/token","auth_provider_x509_cert_url":"https://www.googleapis.com/oauth2/v1/certs","client_secret":"SECRET","redirect_uris":["http://localhost:9999"]}}"#;

    #[test]
    fn test_from_installed_document() {
        let request =
            AuthorizationRequest::from_json(INSTALLED.as_bytes(), &[GMAIL_READONLY_SCOPE]).unwrap();
        assert_eq!(request.client_id, "ID");
        assert_eq!(request.client_secret.as_deref(), Some("SECRET"));
        assert_eq!(
            request.auth_url.as_str(),
            "https://accounts.google.com/o/oauth2/auth"
        );
        assert_eq!(request.token_url.as_str(), "https://oauth2.googleapis.com/token");
        assert_eq!(request.redirect_uri.as_deref(), Some("http://localhost:9999"));
        assert_eq!(request.scopes, vec![GMAIL_READONLY_SCOPE.to_string()]);
    }

    #[test]
    fn test_from_web_document() {
        let doc = r#"{"web":{"client_id":"WEB","auth_uri":"https://auth.example.com/a","token_uri":"https://auth.example.com/t"}}"#;
        let request = AuthorizationRequest::from_json(doc.as_bytes(), &[]).unwrap();
        assert_eq!(request.client_id, "WEB");
        assert!(request.client_secret.is_none());
        assert!(request.redirect_uri.is_none());
    }

    #[test]
    fn test_from_json_error_cases() {
        let cases: [&[u8]; 5] = [
            b"",
            b"  \n",
            b"this-is-not-json",
            br#"{"other":{}}"#,
            br#"{"installed":{"client_id":"","auth_uri":"https://a.example.com","token_uri":"https://t.example.com"}}"#,
        ];
        for doc in cases {
            let err = AuthorizationRequest::from_json(doc, &[]).unwrap_err();
            assert!(err.is_config(), "expected config error, got {err}");
        }
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let doc = br#"{"installed":{"client_id":"ID","auth_uri":"https://a.example.com"}}"#;
        assert!(matches!(
            AuthorizationRequest::from_json(doc, &[]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let request = AuthorizationRequest::from_json(INSTALLED.as_bytes(), &[]).unwrap();
        let debug = format!("{request:?}");
        assert!(!debug.contains("SECRET"));
    }
}
