//! Callback validation and the one-shot notification sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{RedirectError, STATE_TOKEN};

/// Body returned to the browser once the code has been captured.
pub(crate) const SUCCESS_BODY: &str =
    "Successfully read authorization code sent by OAuth2 resource provider! You may close this window.";

/// Body returned for requests arriving after the listener closed its sinks.
pub(crate) const CLOSED_BODY: &str = "authorization listener is shutting down";

/// Receiving halves of the listener's sinks.
///
/// Each receiver yields at most one value. Both report closed once the
/// listener shuts down.
#[derive(Debug)]
pub struct Notifications {
    /// Authorization code extracted from a valid redirect.
    pub auth_code: oneshot::Receiver<String>,
    /// First rejected redirect.
    pub error: oneshot::Receiver<RedirectError>,
}

/// Sending halves, shared with the request handler.
///
/// A sender is taken out of its slot on first use, so every sink fires at
/// most once and closing is idempotent.
#[derive(Debug)]
pub(crate) struct Sinks {
    auth_code: Mutex<Option<oneshot::Sender<String>>>,
    error: Mutex<Option<oneshot::Sender<RedirectError>>>,
    closed: AtomicBool,
}

impl Sinks {
    pub(crate) fn new() -> (Self, Notifications) {
        let (code_tx, code_rx) = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let sinks = Self {
            auth_code: Mutex::new(Some(code_tx)),
            error: Mutex::new(Some(error_tx)),
            closed: AtomicBool::new(false),
        };
        let notifications = Notifications {
            auth_code: code_rx,
            error: error_rx,
        };
        (sinks, notifications)
    }

    /// Returns false when the sink already fired or was closed.
    pub(crate) fn send_code(&self, code: String) -> bool {
        take(&self.auth_code).is_some_and(|tx| tx.send(code).is_ok())
    }

    /// Returns false when the sink already fired or was closed.
    pub(crate) fn send_error(&self, error: RedirectError) -> bool {
        take(&self.error).is_some_and(|tx| tx.send(error).is_ok())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        drop(take(&self.auth_code));
        drop(take(&self.error));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Checks a redirect request and extracts the authorization code.
///
/// `state` and `code` are read from the first occurrence of each query
/// parameter.
pub(crate) fn validate_callback(method: &Method, query: Option<&str>) -> Result<String, RedirectError> {
    if *method != Method::GET {
        return Err(RedirectError::MethodNotAllowed(method.to_string()));
    }

    let mut state = None;
    let mut code = None;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "state" if state.is_none() => state = Some(value.into_owned()),
            "code" if code.is_none() => code = Some(value.into_owned()),
            _ => {}
        }
    }

    let state = state.unwrap_or_default();
    if state != STATE_TOKEN {
        return Err(RedirectError::InvalidState(state));
    }

    match code {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(RedirectError::MissingCode),
    }
}

pub(crate) fn router(sinks: Arc<Sinks>) -> Router {
    Router::new().fallback(callback).with_state(sinks)
}

async fn callback(State(sinks): State<Arc<Sinks>>, method: Method, uri: Uri) -> Response {
    if sinks.is_closed() {
        debug!(%method, "Redirect request after shutdown, not signalled");
        return (StatusCode::SERVICE_UNAVAILABLE, CLOSED_BODY).into_response();
    }

    match validate_callback(&method, uri.query()) {
        Ok(code) => {
            if sinks.send_code(code) {
                info!("Received authorization code from redirect");
            } else {
                debug!("Authorization code received after the outcome was settled, ignoring");
            }
            (StatusCode::OK, SUCCESS_BODY).into_response()
        }
        Err(error) => {
            warn!(%method, %error, "Rejected redirect request");
            let response = (error.status_code(), error.to_string()).into_response();
            if !sinks.send_error(error) {
                debug!("Redirect error received after the outcome was settled, ignoring");
            }
            response
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

    #[test]
    fn test_valid_callback() {
        let code = validate_callback(&Method::GET, Some("state=state-token&code=ABC123")).unwrap();
        assert_eq!(code, "ABC123");
    }

    #[test]
    fn test_code_is_percent_decoded() {
        let code =
            validate_callback(&Method::GET, Some("code=4%2F0Ab_x&state=state-token&scope=x")).unwrap();
        assert_eq!(code, "4/0Ab_x");
    }

    #[test]
    fn test_first_parameter_wins() {
        let code =
            validate_callback(&Method::GET, Some("state=state-token&code=first&code=second")).unwrap();
        assert_eq!(code, "first");
    }

    #[test]
    fn test_non_get_rejected() {
        for method in [Method::HEAD, Method::POST, Method::PUT, Method::DELETE] {
            let err = validate_callback(&method, Some("state=state-token&code=x")).unwrap_err();
            assert_eq!(err.status_code(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(
                err.to_string(),
                format!("request method must be an http get (got {method})")
            );
        }
    }

    #[test]
    fn test_state_checks() {
        let cases = [None, Some(""), Some("code=asdfadsf_afsa4234l"), Some("state=other&code=x")];
        for query in cases {
            let err = validate_callback(&Method::GET, query).unwrap_err();
            assert!(matches!(err, RedirectError::InvalidState(_)), "{query:?}");
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
            assert!(err.to_string().contains("state=state-token"));
        }
    }

    #[test]
    fn test_code_checks() {
        for query in ["state=state-token", "state=state-token&code="] {
            let err = validate_callback(&Method::GET, Some(query)).unwrap_err();
            assert!(matches!(err, RedirectError::MissingCode));
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
            assert!(err.to_string().contains("\"code\""));
        }
    }

    #[test]
    fn test_sinks_fire_once() {
        let (sinks, mut notifications) = Sinks::new();
        assert!(sinks.send_code("one".into()));
        assert!(!sinks.send_code("two".into()));
        assert_eq!(notifications.auth_code.try_recv().unwrap(), "one");

        assert!(sinks.send_error(RedirectError::MissingCode));
        assert!(!sinks.send_error(RedirectError::MissingCode));
        assert!(matches!(
            notifications.error.try_recv().unwrap(),
            RedirectError::MissingCode
        ));
    }

    #[test]
    fn test_closed_sinks_drop_signals() {
        let (sinks, mut notifications) = Sinks::new();
        sinks.close();
        sinks.close();
        assert!(!sinks.send_code("late".into()));
        assert!(!sinks.send_error(RedirectError::MissingCode));
        assert!(notifications.auth_code.try_recv().is_err());
        assert!(notifications.error.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_sinks_never_confirm_code() {
        let (sinks, mut notifications) = Sinks::new();
        let sinks = Arc::new(sinks);
        sinks.close();

        let response = callback(
            State(Arc::clone(&sinks)),
            Method::GET,
            Uri::from_static("/?state=state-token&code=late"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(notifications.auth_code.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_sinks_confirm_code() {
        let (sinks, mut notifications) = Sinks::new();
        let response = callback(
            State(Arc::new(sinks)),
            Method::GET,
            Uri::from_static("/?state=state-token&code=now"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(notifications.auth_code.try_recv().unwrap(), "now");
    }
}
