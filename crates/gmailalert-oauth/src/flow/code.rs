//! Authorization URL for the authorization-code flow.

use url::Url;

use crate::provider::AuthorizationRequest;

impl AuthorizationRequest {
    /// Builds the URL the user opens to grant access.
    ///
    /// Requests offline access so the provider issues a refresh token, and
    /// embeds `state` for the redirect listener to verify.
    #[must_use]
    pub fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.auth_url.clone();

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("access_type", "offline")
                .append_pair("client_id", &self.client_id);

            if let Some(redirect_uri) = &self.redirect_uri {
                pairs.append_pair("redirect_uri", redirect_uri);
            }

            pairs.append_pair("response_type", "code");

            let scope = self.scopes.join(" ");
            if !scope.is_empty() {
                pairs.append_pair("scope", &scope);
            }

            pairs.append_pair("state", state);
        }

        url
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
    use crate::provider::{AuthorizationRequest, GMAIL_READONLY_SCOPE};

    fn request() -> AuthorizationRequest {
        AuthorizationRequest::new(
            "test_client",
            "https://accounts.google.com/o/oauth2/auth",
            "https://oauth2.googleapis.com/token",
        )
        .unwrap()
    }

    #[test]
    fn test_authorization_url() {
        let url = request()
            .with_redirect_uri("http://localhost:9999")
            .with_scopes(vec![GMAIL_READONLY_SCOPE.to_string()])
            .authorization_url("state-token");

        assert_eq!(
            url.as_str(),
            "https://accounts.google.com/o/oauth2/auth?access_type=offline&client_id=test_client\
             &redirect_uri=http%3A%2F%2Flocalhost%3A9999&response_type=code\
             &scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fgmail.readonly&state=state-token"
        );
    }

    #[test]
    fn test_authorization_url_without_redirect_or_scope() {
        let url = request().authorization_url("s");
        let query = url.query().unwrap();
        assert!(!query.contains("redirect_uri"));
        assert!(!query.contains("scope"));
        assert!(query.ends_with("state=s"));
    }

    #[test]
    fn test_authorization_url_joins_scopes() {
        let url = request()
            .with_scopes(vec!["email".to_string(), "profile".to_string()])
            .authorization_url("s");

        // Space becomes + in query parameters
        assert!(url.as_str().contains("scope=email+profile"));
    }

    #[test]
    fn test_authorization_url_keeps_existing_query() {
        let request = AuthorizationRequest::new(
            "c",
            "https://auth.example.com/authorize?tenant=x",
            "https://auth.example.com/token",
        )
        .unwrap();
        let url = request.authorization_url("s");
        assert!(url.as_str().starts_with("https://auth.example.com/authorize?tenant=x&access_type=offline"));
    }
}
