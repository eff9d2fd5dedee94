//! Local HTTP listener terminating the `OAuth2` redirect leg.
//!
//! The provider redirects the user's browser to
//! `http://localhost:<port>/?state=state-token&code=<code>`. The listener
//! validates that request, answers the browser, and hands the code (or the
//! reason the request was rejected) to whoever is waiting on its
//! [`Notifications`].

mod conn;
mod handler;

use std::future::IntoFuture;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use conn::Connections;
pub use handler::Notifications;
use handler::Sinks;

use crate::error::{Error, Result};

/// Fixed anti-CSRF value embedded in the authorization URL.
pub const STATE_TOKEN: &str = "state-token";

/// How long a graceful shutdown may take before open connections are severed.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_PORT: u32 = 1024;
const MAX_PORT: u32 = 65535;

/// Why a redirect request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RedirectError {
    /// The request was not a GET.
    #[error("request method must be an http get (got {0})")]
    MethodNotAllowed(String),

    /// The `state` parameter was missing or wrong.
    #[error("request must contain a query parameter \"state=state-token\" (got {0:?})")]
    InvalidState(String),

    /// The `code` parameter was missing or empty.
    #[error("request must contain a non-empty query parameter \"code\"")]
    MissingCode,
}

impl RedirectError {
    /// HTTP status answered to the browser for this rejection.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidState(_) | Self::MissingCode => StatusCode::BAD_REQUEST,
        }
    }
}

/// Result of one authorization attempt as seen by the redirect listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// The provider redirected back with an authorization code.
    Code(String),
    /// The redirect request was rejected.
    Failure(RedirectError),
}

impl Notifications {
    /// Waits for whichever sink fires first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerClosed`] if both sinks close without a value.
    pub async fn wait(mut self) -> Result<RedirectOutcome> {
        tokio::select! {
            Ok(code) = &mut self.auth_code => Ok(RedirectOutcome::Code(code)),
            Ok(error) = &mut self.error => Ok(RedirectOutcome::Failure(error)),
            else => Err(Error::ListenerClosed),
        }
    }
}

/// Validated listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    port: u16,
}

impl ListenerConfig {
    /// Creates a configuration for the given port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPort`] unless `port` is within 1024-65535.
    pub fn new(port: u32) -> Result<Self> {
        if !(MIN_PORT..=MAX_PORT).contains(&port) {
            return Err(Error::InvalidPort(port));
        }
        let port = u16::try_from(port).map_err(|_| Error::InvalidPort(port))?;
        Ok(Self { port })
    }

    /// Port the listener binds on loopback.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// State value the callback must carry.
    #[must_use]
    pub const fn state(&self) -> &'static str {
        STATE_TOKEN
    }

    /// Redirect URI to register in the authorization URL.
    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

/// Short-lived loopback HTTP server receiving one `OAuth2` redirect.
///
/// Create it with [`bind`](Self::bind), take the receivers with
/// [`notifications`](Self::notifications), run [`serve`](Self::serve) on its
/// own task and call [`shutdown`](Self::shutdown) once an outcome arrived.
#[derive(Debug)]
pub struct RedirectListener {
    config: ListenerConfig,
    local_addr: SocketAddr,
    tcp: Mutex<Option<TcpListener>>,
    sinks: Arc<Sinks>,
    notifications: Mutex<Option<Notifications>>,
    shutdown_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    connections: CancellationToken,
    shut_down: AtomicBool,
    span: Span,
}

impl RedirectListener {
    /// Validates `port` and binds the listener on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPort`] for ports outside 1024-65535, or an
    /// I/O error if the port cannot be bound.
    pub async fn start(port: u32) -> Result<Self> {
        Self::bind(ListenerConfig::new(port)?).await
    }

    /// Binds `127.0.0.1:<port>`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the port cannot be bound.
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        let span = info_span!("redirect_listener", port = config.port());
        Self::bind_in(config, span).await
    }

    /// Binds like [`bind`](Self::bind), emitting events inside `span`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the port cannot be bound.
    pub async fn bind_in(config: ListenerConfig, span: Span) -> Result<Self> {
        let tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port()))
            .instrument(span.clone())
            .await?;
        let local_addr = tcp.local_addr()?;
        span.in_scope(|| debug!(%local_addr, "Redirect listener bound"));

        let (sinks, notifications) = Sinks::new();
        Ok(Self {
            config,
            local_addr,
            tcp: Mutex::new(Some(tcp)),
            sinks: Arc::new(sinks),
            notifications: Mutex::new(Some(notifications)),
            shutdown_tx: watch::Sender::new(false),
            stopped_tx: watch::Sender::new(false),
            connections: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            span,
        })
    }

    /// Listener settings.
    #[must_use]
    pub const fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Takes the receiving halves of the sinks. Returns `None` after the
    /// first call.
    pub fn notifications(&self) -> Option<Notifications> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Accepts redirect requests until [`shutdown`](Self::shutdown) is called.
    ///
    /// Once shutdown is requested, in-flight connections get
    /// [`SHUTDOWN_TIMEOUT`] to finish. Whatever is still open after that,
    /// or when this future is dropped, is closed without a response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ListenerClosed`] if the listener was already served
    /// or shut down, or the I/O error that stopped the accept loop.
    pub async fn serve(&self) -> Result<()> {
        let tcp = self
            .tcp
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::ListenerClosed)?;

        let mut graceful_rx = self.shutdown_tx.subscribe();
        let mut forced_rx = self.shutdown_tx.subscribe();
        let _sever = self.connections.clone().drop_guard();

        let listener = Connections::new(tcp, self.connections.clone());
        let server = axum::serve(listener, handler::router(Arc::clone(&self.sinks)))
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.wait_for(|requested| *requested).await;
            })
            .into_future();
        let deadline = async move {
            let _ = forced_rx.wait_for(|requested| *requested).await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        };

        info!(parent: &self.span, addr = %self.local_addr, "Redirect listener serving");
        let result = tokio::select! {
            served = server => served.map_err(Error::from),
            () = deadline => {
                warn!(parent: &self.span, "Graceful shutdown timed out, severing open connections");
                Ok(())
            }
        };
        self.connections.cancel();

        self.stopped_tx.send_replace(true);
        debug!(parent: &self.span, "Redirect listener stopped");
        result
    }

    /// Closes the sinks and stops the listener.
    ///
    /// Only the first call has an effect; later or concurrent calls return
    /// immediately. Waits for [`serve`](Self::serve) to wind down when it is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the accept loop did not stop within the
    /// forced-stop window.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.sinks.close();
        self.shutdown_tx.send_replace(true);

        let never_served = self
            .tcp
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_served {
            debug!(parent: &self.span, "Redirect listener shut down before serving");
            return Ok(());
        }

        let mut stopped_rx = self.stopped_tx.subscribe();
        let bound = SHUTDOWN_TIMEOUT + Duration::from_secs(1);
        match tokio::time::timeout(bound, stopped_rx.wait_for(|stopped| *stopped)).await {
            Ok(_) => {
                info!(parent: &self.span, "Redirect listener shut down");
                Ok(())
            }
            Err(_) => Err(Error::Timeout(bound)),
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
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::Instant;

    proptest! {
        #[test]
        fn prop_ports_outside_range_rejected(port in prop_oneof![0u32..MIN_PORT, (MAX_PORT + 1)..=u32::MAX]) {
            prop_assert!(matches!(ListenerConfig::new(port), Err(Error::InvalidPort(p)) if p == port));
        }

        #[test]
        fn prop_ports_inside_range_accepted(port in MIN_PORT..=MAX_PORT) {
            let config = ListenerConfig::new(port).unwrap();
            prop_assert_eq!(u32::from(config.port()), port);
        }
    }

    #[test]
    fn test_wait_pending_until_signal() {
        let (sinks, notifications) = Sinks::new();
        let mut wait = tokio_test::task::spawn(notifications.wait());
        tokio_test::assert_pending!(wait.poll());

        assert!(sinks.send_code("abc".into()));
        assert!(wait.is_woken());
        let outcome = tokio_test::assert_ready!(wait.poll());
        assert_eq!(outcome.unwrap(), RedirectOutcome::Code("abc".into()));
    }

    #[test]
    fn test_wait_reports_error_signal() {
        let (sinks, notifications) = Sinks::new();
        assert!(sinks.send_error(RedirectError::MissingCode));
        sinks.close();

        let mut wait = tokio_test::task::spawn(notifications.wait());
        let outcome = tokio_test::assert_ready!(wait.poll());
        assert_eq!(
            outcome.unwrap(),
            RedirectOutcome::Failure(RedirectError::MissingCode)
        );
    }

    #[test]
    fn test_redirect_uri() {
        let config = ListenerConfig::new(9999).unwrap();
        assert_eq!(config.redirect_uri(), "http://localhost:9999");
        assert_eq!(config.state(), "state-token");
    }

    async fn start(port: u32) -> (Arc<RedirectListener>, Notifications) {
        let listener = Arc::new(
            RedirectListener::bind(ListenerConfig::new(port).unwrap())
                .await
                .unwrap(),
        );
        let notifications = listener.notifications().unwrap();
        let serving = Arc::clone(&listener);
        tokio::spawn(async move { serving.serve().await });
        (listener, notifications)
    }

    fn url(listener: &RedirectListener, query: &str) -> String {
        format!("http://{}/{query}", listener.local_addr())
    }

    #[tokio::test]
    async fn test_valid_redirect_signals_code() {
        let (listener, mut notifications) = start(19101).await;

        let response = reqwest::get(url(&listener, "?state=state-token&code=ABC123"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), handler::SUCCESS_BODY);

        assert_eq!(notifications.auth_code.try_recv().unwrap(), "ABC123");
        assert!(notifications.error.try_recv().is_err());

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_state_signals_error() {
        let (listener, mut notifications) = start(19102).await;

        let response = reqwest::get(url(&listener, "?code=asdfadsf_afsa4234l"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(response.text().await.unwrap().contains("state=state-token"));

        assert!(matches!(
            notifications.error.try_recv().unwrap(),
            RedirectError::InvalidState(_)
        ));
        assert!(notifications.auth_code.try_recv().is_err());

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_code_signals_error() {
        let (listener, notifications) = start(19103).await;

        let response = reqwest::get(url(&listener, "?state=state-token&code="))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let outcome = notifications.wait().await.unwrap();
        assert_eq!(outcome, RedirectOutcome::Failure(RedirectError::MissingCode));

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_head_request_signals_error() {
        let (listener, mut notifications) = start(19104).await;

        let response = reqwest::Client::new()
            .head(url(&listener, "?state=state-token&code=x"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        assert_eq!(
            notifications.error.try_recv().unwrap(),
            RedirectError::MethodNotAllowed("HEAD".into())
        );
        assert!(notifications.auth_code.try_recv().is_err());

        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_error_is_not_signalled() {
        let (listener, mut notifications) = start(19105).await;
        let client = reqwest::Client::new();

        for _ in 0..2 {
            let response = client.get(url(&listener, "?state=nope")).send().await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        }

        assert!(notifications.error.try_recv().is_ok());
        listener.shutdown().await.unwrap();
        assert!(notifications.error.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (listener, notifications) = start(19106).await;

        let (first, second) = tokio::join!(listener.shutdown(), listener.shutdown());
        first.unwrap();
        second.unwrap();
        listener.shutdown().await.unwrap();

        assert!(matches!(
            notifications.wait().await,
            Err(Error::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_refused() {
        let (listener, _notifications) = start(19107).await;
        let target = url(&listener, "?state=state-token&code=late");
        listener.shutdown().await.unwrap();

        assert!(reqwest::get(target).await.is_err());
    }

    const PARTIAL_REQUEST: &[u8] = b"GET /?state=state-token&code=late HTTP/1.1\r\nHost: localhost\r\n";

    #[tokio::test]
    async fn test_stalled_connection_is_severed_at_deadline() {
        let (listener, mut notifications) = start(19111).await;
        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        stream.write_all(PARTIAL_REQUEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        listener.shutdown().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= SHUTDOWN_TIMEOUT, "{elapsed:?}");
        assert!(elapsed < SHUTDOWN_TIMEOUT + Duration::from_millis(900), "{elapsed:?}");

        let _ = stream.write_all(b"\r\n").await;
        let mut answer = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut answer)).await;
        assert!(read.is_ok(), "connection still open after shutdown");
        assert!(answer.is_empty(), "{}", String::from_utf8_lossy(&answer));
        assert!(notifications.auth_code.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_finishing_during_shutdown_is_refused() {
        let (listener, mut notifications) = start(19112).await;
        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        stream.write_all(PARTIAL_REQUEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopping = Arc::clone(&listener);
        let shutdown = tokio::spawn(async move { stopping.shutdown().await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        stream.write_all(b"\r\n").await.unwrap();
        let mut answer = Vec::new();
        stream.read_to_end(&mut answer).await.unwrap();
        let answer = String::from_utf8_lossy(&answer);
        assert!(answer.starts_with("HTTP/1.1 503"), "{answer}");
        assert!(answer.contains(handler::CLOSED_BODY));

        shutdown.await.unwrap().unwrap();
        assert!(notifications.auth_code.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let listener = RedirectListener::bind(ListenerConfig::new(19108).unwrap())
            .await
            .unwrap();
        listener.shutdown().await.unwrap();
        assert!(matches!(listener.serve().await, Err(Error::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_start_rejects_privileged_port() {
        assert!(matches!(
            RedirectListener::start(80).await,
            Err(Error::InvalidPort(80))
        ));
    }

    #[tokio::test]
    async fn test_notifications_taken_once() {
        let listener = RedirectListener::bind(ListenerConfig::new(19109).unwrap())
            .await
            .unwrap();
        assert!(listener.notifications().is_some());
        assert!(listener.notifications().is_none());
        listener.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let first = RedirectListener::bind(ListenerConfig::new(19110).unwrap())
            .await
            .unwrap();
        let second = RedirectListener::bind(ListenerConfig::new(19110).unwrap()).await;
        assert!(matches!(second, Err(Error::Io(_))));
        first.shutdown().await.unwrap();
    }
}
