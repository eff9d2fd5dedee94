//! HTTP client that authenticates outbound requests with a [`Credential`].

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::flow::OAuthClient;
use crate::provider::AuthorizationRequest;

/// Builds [`AuthorizedClient`]s sharing one connection pool.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedClientFactory {
    http_client: Client,
}

impl AuthorizedClientFactory {
    /// Creates a factory with a fresh HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given HTTP client for both API calls and token refreshes.
    #[must_use]
    pub fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = http_client;
        self
    }

    /// Wraps `credential` into a client for the provider in `request`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the client ID, token URL, or
    /// access token is empty.
    pub fn build_client(
        &self,
        request: &AuthorizationRequest,
        credential: Credential,
    ) -> Result<AuthorizedClient> {
        if request.client_id.trim().is_empty() {
            return Err(Error::InvalidConfig("client_id is empty".into()));
        }
        if request.token_url.as_str().is_empty() {
            return Err(Error::InvalidConfig("token_url is empty".into()));
        }
        if credential.access_token.is_empty() {
            return Err(Error::InvalidConfig("access token is empty".into()));
        }

        Ok(AuthorizedClient {
            oauth: OAuthClient::new(request.clone()).with_http_client(self.http_client.clone()),
            credential: Mutex::new(credential),
            http_client: self.http_client.clone(),
        })
    }
}

/// Attaches `Authorization` headers, refreshing the token when it expires.
#[derive(Debug)]
pub struct AuthorizedClient {
    oauth: OAuthClient,
    credential: Mutex<Credential>,
    http_client: Client,
}

impl AuthorizedClient {
    /// Underlying HTTP client, for building requests.
    #[must_use]
    pub const fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Snapshot of the current credential.
    pub async fn credential(&self) -> Credential {
        self.credential.lock().await.clone()
    }

    /// Returns the `Authorization` header value, refreshing first when the
    /// token has expired and can be refreshed.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    pub async fn bearer(&self) -> Result<String> {
        let mut credential = self.credential.lock().await;

        if credential.is_expired() && credential.refresh_token().is_ok() {
            debug!("Access token expired, refreshing");
            let refreshed = self.oauth.refresh(&credential).await?;
            *credential = refreshed;
            info!("Access token refreshed");
        }

        Ok(credential.authorization_header())
    }

    /// Sends `request` with the `Authorization` header attached.
    ///
    /// # Errors
    ///
    /// Returns an error if refreshing the token or sending the request fails.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let header = self.bearer().await?;
        Ok(request.header(AUTHORIZATION, header).send().await?)
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
    use chrono::{Duration, Utc};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_for(server: &MockServer) -> AuthorizationRequest {
        AuthorizationRequest::new(
            "client",
            format!("{}/auth", server.uri()),
            format!("{}/token", server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_client_rejects_empty_token() {
        let server = MockServer::start().await;
        let err = AuthorizedClientFactory::new()
            .build_client(&request_for(&server), Credential::new("", "Bearer"))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_build_client_rejects_empty_client_id() {
        let server = MockServer::start().await;
        let mut request = request_for(&server);
        request.client_id = " ".into();
        let err = AuthorizedClientFactory::new()
            .build_client(&request, Credential::new("a", "Bearer"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_send_attaches_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .and(header("authorization", "Bearer ya29.valid"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = AuthorizedClientFactory::new()
            .build_client(&request_for(&server), Credential::new("ya29.valid", ""))
            .unwrap();
        let response = client
            .send(client.http_client().get(format!("{}/api", server.uri())))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=1%2F%2Fr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let expired = Credential::new("stale", "Bearer")
            .with_refresh_token("1//r")
            .with_expiry(Utc::now() - Duration::minutes(5));
        let client = AuthorizedClientFactory::new()
            .build_client(&request_for(&server), expired)
            .unwrap();

        assert_eq!(client.bearer().await.unwrap(), "Bearer fresh");
        // Second call uses the replaced credential
        assert_eq!(client.bearer().await.unwrap(), "Bearer fresh");

        let current = client.credential().await;
        assert_eq!(current.refresh_token.as_deref(), Some("1//r"));
        assert!(!current.is_expired());
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_used_as_is() {
        let server = MockServer::start().await;
        let expired =
            Credential::new("old", "Bearer").with_expiry(Utc::now() - Duration::minutes(5));
        let client = AuthorizedClientFactory::new()
            .build_client(&request_for(&server), expired)
            .unwrap();
        assert_eq!(client.bearer().await.unwrap(), "Bearer old");
    }
}
