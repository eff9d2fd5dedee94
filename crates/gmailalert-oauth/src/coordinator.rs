//! Token acquisition: cached token first, browser round trip otherwise.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span, warn};
use url::Url;

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::flow::CodeExchanger;
use crate::provider::AuthorizationRequest;
use crate::redirect::{
    ListenerConfig, Notifications, RedirectListener, RedirectOutcome, STATE_TOKEN,
};
use crate::store::{StoreError, TokenStore};

/// Settings for one [`OAuth2Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    request: AuthorizationRequest,
    listener: ListenerConfig,
    open_browser: bool,
    wait_timeout: Option<Duration>,
}

impl CoordinatorConfig {
    /// Creates a configuration. Waits for the redirect without a deadline
    /// and does not open a browser.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the provider configuration is
    /// incomplete.
    pub fn new(request: AuthorizationRequest, listener: ListenerConfig) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            request,
            listener,
            open_browser: false,
            wait_timeout: None,
        })
    }

    /// Opens the authorization URL in the default browser.
    #[must_use]
    pub const fn with_open_browser(mut self, open: bool) -> Self {
        self.open_browser = open;
        self
    }

    /// Gives up waiting for the redirect after `timeout`.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Provider configuration.
    #[must_use]
    pub const fn request(&self) -> &AuthorizationRequest {
        &self.request
    }

    /// Redirect listener settings.
    #[must_use]
    pub const fn listener(&self) -> &ListenerConfig {
        &self.listener
    }
}

/// Where the coordinator is in acquiring a token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// Reading the token cache.
    LoadingLocalToken,
    /// A usable token was cached.
    TokenFound,
    /// The user has to authorize in the browser.
    NeedsRemoteExchange,
    /// Waiting for the provider redirect.
    ListenerActive,
    /// Redeeming the authorization code.
    ExchangingCode,
    /// A credential is available. Terminal when persisting it failed.
    TokenReady,
    /// The fetched credential was written to the cache.
    Persisted,
    /// Acquisition failed for the given reason.
    Failed(String),
}

/// Drives the `OAuth2` authorization-code flow.
///
/// ```ignore
/// let config = CoordinatorConfig::new(request, ListenerConfig::new(9999)?)?;
/// let coordinator = OAuth2Coordinator::new(config, FileTokenStore::default(), OAuthClient::new(request));
/// let credential = coordinator.resolve_token().await?;
/// ```
#[derive(Debug)]
pub struct OAuth2Coordinator<S, E> {
    config: CoordinatorConfig,
    store: S,
    exchanger: E,
    state: Mutex<AuthState>,
    span: Span,
}

impl<S: TokenStore, E: CodeExchanger> OAuth2Coordinator<S, E> {
    /// Creates a coordinator in the [`AuthState::Idle`] state.
    pub fn new(config: CoordinatorConfig, store: S, exchanger: E) -> Self {
        Self {
            config,
            store,
            exchanger,
            state: Mutex::new(AuthState::Idle),
            span: info_span!("oauth2_coordinator"),
        }
    }

    /// Emits events inside `span` instead of the default one.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the cached credential, or runs the browser flow when nothing
    /// usable is cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the browser flow fails. See
    /// [`remote_exchange`](Self::remote_exchange).
    pub async fn resolve_token(&self) -> Result<Credential> {
        self.set_state(AuthState::LoadingLocalToken);

        match self.store.load().instrument(self.span.clone()).await {
            Ok(credential) => {
                self.set_state(AuthState::TokenFound);
                info!(parent: &self.span, "Using cached token");
                self.set_state(AuthState::TokenReady);
                return Ok(credential);
            }
            Err(StoreError::NotFound(location)) => {
                debug!(parent: &self.span, %location, "No cached token");
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Ignoring unusable cached token");
            }
        }

        self.set_state(AuthState::NeedsRemoteExchange);
        self.remote_exchange().await
    }

    /// Sends the user through the browser, redeems the returned code and
    /// caches the resulting credential.
    ///
    /// Failing to cache the credential is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound, the redirect is
    /// rejected, the wait times out, or the token endpoint refuses the code.
    pub async fn remote_exchange(&self) -> Result<Credential> {
        let credential = match self.fetch_remote().await {
            Ok(credential) => credential,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.persist(&credential).await;
        Ok(credential)
    }

    /// Writes `credential` to the token cache.
    ///
    /// Returns whether it was saved. A failure is logged and leaves the
    /// state at [`AuthState::TokenReady`].
    pub async fn persist(&self, credential: &Credential) -> bool {
        match self.store.save(credential).instrument(self.span.clone()).await {
            Ok(()) => {
                self.set_state(AuthState::Persisted);
                info!(parent: &self.span, "Cached new token");
                true
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Failed to cache token, continuing without it");
                false
            }
        }
    }

    async fn fetch_remote(&self) -> Result<Credential> {
        let listener_span = info_span!(
            parent: &self.span,
            "redirect_listener",
            port = self.config.listener.port()
        );
        let listener =
            Arc::new(RedirectListener::bind_in(self.config.listener.clone(), listener_span).await?);
        let notifications = listener.notifications().ok_or(Error::ListenerClosed)?;

        let serving = Arc::clone(&listener);
        let mut serve_task = tokio::spawn(async move { serving.serve().await });
        self.set_state(AuthState::ListenerActive);

        let redirect_uri = listener.config().redirect_uri();
        let url = self
            .config
            .request
            .clone()
            .with_redirect_uri(redirect_uri.as_str())
            .authorization_url(STATE_TOKEN);
        self.present(&url);

        let outcome = self.await_outcome(notifications, &mut serve_task).await;

        if let Err(e) = listener.shutdown().await {
            warn!(parent: &self.span, error = %e, "Redirect listener did not stop, aborting it");
            serve_task.abort();
        }

        let code = match outcome? {
            RedirectOutcome::Code(code) => code,
            RedirectOutcome::Failure(reason) => return Err(reason.into()),
        };

        self.set_state(AuthState::ExchangingCode);
        let credential = self
            .exchanger
            .exchange(&code, &redirect_uri)
            .instrument(self.span.clone())
            .await?;
        self.set_state(AuthState::TokenReady);
        info!(parent: &self.span, "Authorization code exchanged");
        Ok(credential)
    }

    async fn await_outcome(
        &self,
        notifications: Notifications,
        serve_task: &mut JoinHandle<Result<()>>,
    ) -> Result<RedirectOutcome> {
        let wait_timeout = self.config.wait_timeout;
        let wait = async move {
            match wait_timeout {
                Some(limit) => tokio::time::timeout(limit, notifications.wait())
                    .await
                    .unwrap_or_else(|_| Err(Error::Timeout(limit))),
                None => notifications.wait().await,
            }
        };

        tokio::select! {
            outcome = wait => outcome,
            served = serve_task => match served {
                Ok(Ok(())) => Err(Error::ListenerClosed),
                Ok(Err(e)) => Err(e),
                Err(join) => Err(Error::Io(io::Error::other(join))),
            },
        }
    }

    fn present(&self, url: &Url) {
        println!("Go to the following link in your browser:\n\n{url}\n");
        info!(parent: &self.span, %url, "Waiting for the authorization redirect");

        if self.config.open_browser {
            if let Err(e) = open::that(url.as_str()) {
                warn!(parent: &self.span, error = %e, "Could not open a browser");
            }
        }
    }

    fn set_state(&self, state: AuthState) {
        debug!(parent: &self.span, ?state, "Coordinator state");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn fail(&self, error: &Error) {
        warn!(parent: &self.span, %error, "Token acquisition failed");
        self.set_state(AuthState::Failed(error.to_string()));
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
    use crate::store::StoreResult;

    struct MemoryStore {
        cached: Mutex<Option<Credential>>,
        fail_save: bool,
    }

    impl MemoryStore {
        fn new(cached: Option<Credential>) -> Self {
            Self {
                cached: Mutex::new(cached),
                fail_save: false,
            }
        }
    }

    impl TokenStore for MemoryStore {
        async fn load(&self) -> StoreResult<Credential> {
            self.cached
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| StoreError::NotFound("memory".into()))
        }

        async fn save(&self, credential: &Credential) -> StoreResult<()> {
            if self.fail_save {
                return Err(StoreError::Io {
                    location: "memory".into(),
                    source: io::Error::other("read-only"),
                });
            }
            *self.cached.lock().unwrap() = Some(credential.clone());
            Ok(())
        }
    }

    struct PanickingExchanger;

    impl CodeExchanger for PanickingExchanger {
        async fn exchange(&self, _code: &str, _redirect_uri: &str) -> Result<Credential> {
            panic!("exchange must not be called");
        }
    }

    struct FixedExchanger;

    impl CodeExchanger for FixedExchanger {
        async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<Credential> {
            assert!(redirect_uri.starts_with("http://localhost:"));
            Ok(Credential::new(format!("token-for-{code}"), "Bearer"))
        }
    }

    fn config(port: u32) -> CoordinatorConfig {
        let request = AuthorizationRequest::new(
            "client",
            "https://accounts.example.com/auth",
            "https://accounts.example.com/token",
        )
        .unwrap();
        CoordinatorConfig::new(request, ListenerConfig::new(port).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_cached_token_short_circuits() {
        let cached = Credential::new("cached", "Bearer");
        let coordinator = OAuth2Coordinator::new(
            config(19200),
            MemoryStore::new(Some(cached.clone())),
            PanickingExchanger,
        );
        assert_eq!(coordinator.state(), AuthState::Idle);

        let credential = coordinator.resolve_token().await.unwrap();
        assert_eq!(credential, cached);
        assert_eq!(coordinator.state(), AuthState::TokenReady);
    }

    async fn redirect(port: u16, query: &str) -> reqwest::StatusCode {
        let url = format!("http://127.0.0.1:{port}/{query}");
        loop {
            match reqwest::get(&url).await {
                Ok(response) => return response.status(),
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    #[tokio::test]
    async fn test_remote_exchange_persists() {
        let coordinator = OAuth2Coordinator::new(
            config(19201),
            MemoryStore::new(None),
            FixedExchanger,
        );

        let (credential, status) = tokio::join!(
            coordinator.resolve_token(),
            redirect(19201, "?state=state-token&code=xyz")
        );
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(credential.unwrap().access_token, "token-for-xyz");
        assert_eq!(coordinator.state(), AuthState::Persisted);
        assert_eq!(
            coordinator.store.load().await.unwrap().access_token,
            "token-for-xyz"
        );
    }

    #[tokio::test]
    async fn test_failed_save_keeps_credential() {
        let mut store = MemoryStore::new(None);
        store.fail_save = true;
        let coordinator = OAuth2Coordinator::new(config(19205), store, FixedExchanger)
            .with_span(info_span!("test"));

        let (credential, _) = tokio::join!(
            coordinator.remote_exchange(),
            redirect(19205, "?state=state-token&code=abc")
        );
        assert_eq!(credential.unwrap().access_token, "token-for-abc");
        assert_eq!(coordinator.state(), AuthState::TokenReady);
    }

    #[tokio::test]
    async fn test_rejected_redirect_fails() {
        let coordinator = OAuth2Coordinator::new(
            config(19202),
            MemoryStore::new(None),
            PanickingExchanger,
        );

        let (result, status) = tokio::join!(
            coordinator.resolve_token(),
            redirect(19202, "?state=state-token")
        );
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        assert!(matches!(result, Err(Error::Redirect(_))));
        assert!(matches!(coordinator.state(), AuthState::Failed(_)));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let coordinator = OAuth2Coordinator::new(
            config(19203).with_wait_timeout(Duration::from_millis(50)),
            MemoryStore::new(None),
            PanickingExchanger,
        );

        let err = coordinator.resolve_token().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(limit) if limit == Duration::from_millis(50)));
        assert_eq!(err.to_string(), "Authorization timed out after 50ms");
        assert!(matches!(coordinator.state(), AuthState::Failed(_)));
    }

    #[tokio::test]
    async fn test_port_in_use_fails_before_waiting() {
        let _held = tokio::net::TcpListener::bind(("127.0.0.1", 19204)).await.unwrap();
        let coordinator = OAuth2Coordinator::new(
            config(19204),
            MemoryStore::new(None),
            PanickingExchanger,
        );

        assert!(matches!(
            coordinator.resolve_token().await,
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_config_builders() {
        let config = config(9999)
            .with_open_browser(true)
            .with_wait_timeout(Duration::from_secs(30));
        assert!(config.open_browser);
        assert_eq!(config.wait_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.listener().port(), 9999);
        assert_eq!(config.request().client_id, "client");
    }
}
