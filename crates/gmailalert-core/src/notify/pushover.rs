//! Pushover message API client.

use std::fmt;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{DeliveryError, Notifier};
use crate::alert::Notification;
use crate::error::{Error, Result};

/// Pushover message endpoint.
pub const PUSHOVER_MESSAGES_URL: &str = "https://api.pushover.net/1/messages.json";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

/// Sends notifications through one Pushover application.
#[derive(Clone)]
pub struct PushoverClient {
    token: String,
    endpoint: String,
    http_client: Client,
}

impl PushoverClient {
    /// Creates a client for the application identified by `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `token` is empty.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::Config("token argument must be non-empty".into()));
        }
        Ok(Self {
            token,
            endpoint: PUSHOVER_MESSAGES_URL.to_string(),
            http_client: Client::new(),
        })
    }

    /// Posts messages to `endpoint` instead of the Pushover API.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Uses the given HTTP client.
    #[must_use]
    pub fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = http_client;
        self
    }
}

impl fmt::Debug for PushoverClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushoverClient")
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Notifier for PushoverClient {
    async fn notify(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
        notification
            .validate()
            .map_err(|e| DeliveryError::Invalid(e.to_string()))?;

        let form = [
            ("token", self.token.as_str()),
            ("user", notification.recipient.as_str()),
            ("title", notification.title.as_str()),
            ("message", notification.message.as_str()),
            ("sound", notification.sound.as_str()),
        ];
        debug!(title = %notification.title, "Sending pushover message");

        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        let api: Option<ApiResponse> = serde_json::from_slice(&body).ok();

        match api {
            Some(api) if status.is_success() && api.status == 1 => {
                debug!(title = %notification.title, "Pushover message accepted");
                Ok(())
            }
            Some(api) => Err(DeliveryError::Rejected {
                status: status.as_u16(),
                errors: api.errors.join("; "),
            }),
            None => Err(DeliveryError::Rejected {
                status: status.as_u16(),
                errors: String::from_utf8_lossy(&body).trim().to_string(),
            }),
        }
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

    fn notification() -> Notification {
        Notification {
            recipient: "user-key".into(),
            title: "Bank".into(),
            message: "found 2 emails matching query \"from:bank\"".into(),
            sound: "siren".into(),
        }
    }

    fn client_for(server: &MockServer) -> PushoverClient {
        PushoverClient::new("app-token")
            .unwrap()
            .with_endpoint(format!("{}/1/messages.json", server.uri()))
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(PushoverClient::new(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_debug_redacts_token() {
        let client = PushoverClient::new("app-token").unwrap();
        assert!(!format!("{client:?}").contains("app-token"));
    }

    #[tokio::test]
    async fn test_notify_posts_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/1/messages.json"))
            .and(body_string_contains("token=app-token"))
            .and(body_string_contains("user=user-key"))
            .and(body_string_contains("title=Bank"))
            .and(body_string_contains("sound=siren"))
            .and(body_string_contains("message=found+2+emails"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": 1, "request": "abc"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).notify(&notification()).await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "user": "invalid",
                "errors": ["user identifier is invalid"],
                "status": 0
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).notify(&notification()).await.unwrap_err();
        assert!(
            matches!(err, DeliveryError::Rejected { status: 400, ref errors } if errors == "user identifier is invalid")
        );
    }

    #[tokio::test]
    async fn test_notify_status_zero_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 0})))
            .mount(&server)
            .await;

        let err = client_for(&server).notify(&notification()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_invalid_notification_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut invalid = notification();
        invalid.recipient.clear();
        let err = client_for(&server).notify(&invalid).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Invalid(_)));
    }
}
