//! Token endpoint client: authorization-code exchange and refresh.

mod code;

use std::future::Future;

use reqwest::Client;
use tracing::debug;

use crate::credential::{Credential, ErrorResponse, TokenResponse};
use crate::error::{Error, Result};
use crate::provider::AuthorizationRequest;

/// Redeems an authorization code for a credential.
///
/// The coordinator only talks to the token endpoint through this trait, so
/// the exchange can be intercepted without a live provider.
pub trait CodeExchanger {
    /// Exchanges `code`, obtained through `redirect_uri`, for a credential.
    fn exchange(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> impl Future<Output = Result<Credential>> + Send;
}

/// `OAuth2` client bound to one provider configuration.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    request: AuthorizationRequest,
    http_client: Client,
}

impl OAuthClient {
    /// Creates a new OAuth client.
    #[must_use]
    pub fn new(request: AuthorizationRequest) -> Self {
        Self {
            request,
            http_client: Client::new(),
        }
    }

    /// Uses the given HTTP client instead of a fresh one.
    #[must_use]
    pub fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = http_client;
        self
    }

    /// Returns the provider configuration.
    #[must_use]
    pub const fn request(&self) -> &AuthorizationRequest {
        &self.request
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the token endpoint rejects the code or cannot be reached.
    pub async fn exchange_code(&self, code: &str, redirect_uri: Option<&str>) -> Result<Credential> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.request.client_id.as_str()),
        ];

        if let Some(uri) = redirect_uri.or(self.request.redirect_uri.as_deref()) {
            params.push(("redirect_uri", uri));
        }

        if let Some(secret) = &self.request.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        debug!(token_url = %self.request.token_url, "Exchanging authorization code");
        let response = self.token_request(&params).await?;
        Credential::from_response(response)
    }

    /// Refreshes an access token using a refresh token.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails or if the credential has no refresh token.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        let refresh_token = credential.refresh_token()?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.request.client_id.as_str()),
        ];

        if let Some(secret) = &self.request.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        debug!(token_url = %self.request.token_url, "Refreshing access token");
        let response = self.token_request(&params).await?;
        let mut refreshed = Credential::from_response(response)?;

        // Preserve refresh token if not returned
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token.clone_from(&credential.refresh_token);
        }

        Ok(refreshed)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http_client
            .post(self.request.token_url.clone())
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(serde_json::from_str::<ErrorResponse>(&body).map_or_else(
                |_| Error::oauth_error(status.as_str(), body.trim()),
                ErrorResponse::into_error,
            ));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidResponse(format!("malformed token response: {e}")))
    }
}

impl CodeExchanger for OAuthClient {
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<Credential> {
        self.exchange_code(code, Some(redirect_uri)).await
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
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OAuthClient {
        let request = AuthorizationRequest::new(
            "test_client",
            format!("{}/auth", server.uri()),
            format!("{}/token", server.uri()),
        )
        .unwrap()
        .with_client_secret("secret");
        OAuthClient::new(request)
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .and(body_string_contains("client_secret=secret"))
            .and(body_string_contains("redirect_uri=http%3A%2F%2Flocalhost%3A9999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "token_type": "Bearer",
                "expires_in": 3599,
                "refresh_token": "1//refresh",
                "scope": "https://www.googleapis.com/auth/gmail.readonly"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credential = client_for(&server)
            .exchange("abc123", "http://localhost:9999")
            .await
            .unwrap();
        assert_eq!(credential.access_token, "ya29.token");
        assert_eq!(credential.refresh_token.as_deref(), Some("1//refresh"));
        assert!(!credential.is_expired());
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Bad Request"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_code("used-code", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OAuth { ref error, .. } if error == "invalid_grant"));
    }

    #[tokio::test]
    async fn test_exchange_code_non_json_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_code("code", None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::OAuth { ref error, ref description } if error == "502" && description == "upstream down")
        );
    }

    #[tokio::test]
    async fn test_refresh_preserves_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=keep-me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let stale = Credential::new("stale", "Bearer").with_refresh_token("keep-me");
        let refreshed = client_for(&server).refresh(&stale).await.unwrap();
        assert_eq!(refreshed.access_token, "fresh");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("keep-me"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let server = MockServer::start().await;
        let err = client_for(&server)
            .refresh(&Credential::new("a", "Bearer"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRefreshToken));
    }
}
