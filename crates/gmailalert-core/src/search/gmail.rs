//! Gmail `users.messages.list` client.

use std::sync::Arc;

use gmailalert_oauth::AuthorizedClient;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{MailSearch, QueryError};
use crate::error::{Error, Result};

/// Production Gmail API endpoint.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com";

const MESSAGES_PATH: &str = "gmail/v1/users/me/messages";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Searches the authorized user's mailbox.
#[derive(Debug, Clone)]
pub struct GmailClient {
    client: Arc<AuthorizedClient>,
    messages_url: Url,
}

impl GmailClient {
    /// Creates a client for the production Gmail API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint URL cannot be built.
    pub fn new(client: Arc<AuthorizedClient>) -> Result<Self> {
        Self::with_base_url(client, GMAIL_API_BASE)
    }

    /// Creates a client for the API rooted at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base` is not a valid URL.
    pub fn with_base_url(client: Arc<AuthorizedClient>, base: &str) -> Result<Self> {
        let base = if base.ends_with('/') {
            Url::parse(base)
        } else {
            Url::parse(&format!("{base}/"))
        };
        let messages_url = base
            .and_then(|base| base.join(MESSAGES_PATH))
            .map_err(|e| Error::Config(format!("invalid gmail API base URL: {e}")))?;
        Ok(Self {
            client,
            messages_url,
        })
    }

    fn page_url(&self, query: &str, page_token: Option<&str>) -> Url {
        let mut url = self.messages_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }
        url
    }
}

impl MailSearch for GmailClient {
    async fn find(&self, query: &str) -> std::result::Result<Vec<String>, QueryError> {
        let transport = |source: gmailalert_oauth::Error| QueryError::Transport {
            query: query.to_string(),
            source,
        };

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let url = self.page_url(query, page_token.as_deref());
            let response = self
                .client
                .send(self.client.http_client().get(url))
                .await
                .map_err(transport)?;

            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| transport(e.into()))?;

            if !status.is_success() {
                return Err(QueryError::Status {
                    query: query.to_string(),
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).trim().to_string(),
                });
            }

            let page: ListResponse =
                serde_json::from_slice(&body).map_err(|source| QueryError::Decode {
                    query: query.to_string(),
                    source,
                })?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(query, matches = ids.len(), "Gmail query finished");
        Ok(ids)
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
    use gmailalert_oauth::{AuthorizationRequest, AuthorizedClientFactory, Credential};
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gmail_for(server: &MockServer) -> GmailClient {
        let request = AuthorizationRequest::new(
            "client",
            format!("{}/auth", server.uri()),
            format!("{}/token", server.uri()),
        )
        .unwrap();
        let client = AuthorizedClientFactory::new()
            .build_client(&request, Credential::new("ya29.gmail", "Bearer"))
            .unwrap();
        GmailClient::with_base_url(Arc::new(client), &server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_find_returns_message_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "is:unread from:bank"))
            .and(header("authorization", "Bearer ya29.gmail"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [
                    {"id": "18c1", "threadId": "t1"},
                    {"id": "18c2", "threadId": "t2"}
                ],
                "resultSizeEstimate": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ids = gmail_for(&server).find("is:unread from:bank").await.unwrap();
        assert_eq!(ids, vec!["18c1".to_string(), "18c2".to_string()]);
    }

    #[tokio::test]
    async fn test_find_without_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"resultSizeEstimate": 0})),
            )
            .mount(&server)
            .await;

        assert!(gmail_for(&server).find("label:none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "a"}],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "b"}]
            })))
            .mount(&server)
            .await;

        let ids = gmail_for(&server).find("in:inbox").await.unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_find_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("insufficient scope"))
            .mount(&server)
            .await;

        let err = gmail_for(&server).find("is:unread").await.unwrap_err();
        assert!(
            matches!(err, QueryError::Status { ref query, status: 403, ref body } if query == "is:unread" && body == "insufficient scope")
        );
    }

    #[tokio::test]
    async fn test_find_reports_bad_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = gmail_for(&server).find("is:unread").await.unwrap_err();
        assert!(matches!(err, QueryError::Decode { .. }));
    }

    #[test]
    fn test_invalid_base_url() {
        let request = AuthorizationRequest::new(
            "client",
            "https://auth.example.com/a",
            "https://auth.example.com/t",
        )
        .unwrap();
        let client = AuthorizedClientFactory::new()
            .build_client(&request, Credential::new("a", "Bearer"))
            .unwrap();
        assert!(matches!(
            GmailClient::with_base_url(Arc::new(client), "not a url"),
            Err(Error::Config(_))
        ));
    }
}
