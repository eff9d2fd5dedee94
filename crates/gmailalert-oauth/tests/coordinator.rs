//! End-to-end tests for token acquisition.
//!
//! The provider is replaced by a recording [`CodeExchanger`] and the browser
//! by a plain HTTP request against the redirect listener.

#![allow(clippy::unwrap_used)]

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use gmailalert_oauth::{
    AuthState, AuthorizationRequest, CodeExchanger, CoordinatorConfig, Credential, Error,
    FileTokenStore, ListenerConfig, OAuth2Coordinator, Result, TokenStore,
};

/// Records every code it is asked to redeem.
#[derive(Default)]
struct RecordingExchanger {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingExchanger {
    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CodeExchanger for &RecordingExchanger {
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<Credential> {
        self.calls
            .lock()
            .unwrap()
            .push((code.to_string(), redirect_uri.to_string()));
        Ok(Credential::new(format!("access-{code}"), "Bearer").with_refresh_token("refresh"))
    }
}

fn request() -> AuthorizationRequest {
    AuthorizationRequest::from_json(
        br#"{"installed":{"client_id":"ID","client_secret":"SECRET","auth_uri":"https://accounts.google.com/o/oauth2/auth","token_uri":"https://oauth2.googleapis.com/token","redirect_uris":["urn:ietf:wg:oauth:2.0:oob"]}}"#,
        &[gmailalert_oauth::GMAIL_READONLY_SCOPE],
    )
    .unwrap()
}

fn config(port: u32) -> CoordinatorConfig {
    CoordinatorConfig::new(request(), ListenerConfig::new(port).unwrap())
        .unwrap()
        .with_wait_timeout(Duration::from_secs(30))
}

fn token_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "gmailalert-it-{}-{name}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

/// Simulates the browser following the provider redirect, retrying until the
/// listener is up.
async fn follow_redirect(url: &str) -> reqwest::StatusCode {
    for _ in 0..250 {
        match reqwest::get(url).await {
            Ok(response) => return response.status(),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("redirect listener never came up at {url}");
}

#[tokio::test]
async fn test_no_cache_runs_browser_flow() {
    let path = token_path("fresh");
    let exchanger = RecordingExchanger::default();
    let coordinator = OAuth2Coordinator::new(config(9001), FileTokenStore::new(&path), &exchanger);

    let (credential, status) = tokio::join!(
        coordinator.resolve_token(),
        follow_redirect("http://localhost:9001/?state=state-token&code=testcode123")
    );

    assert_eq!(status, reqwest::StatusCode::OK);
    let credential = credential.unwrap();
    assert_eq!(credential.access_token, "access-testcode123");
    assert_eq!(
        exchanger.calls(),
        vec![("testcode123".to_string(), "http://localhost:9001".to_string())]
    );
    assert_eq!(coordinator.state(), AuthState::Persisted);

    let saved = FileTokenStore::new(&path).load().await.unwrap();
    assert_eq!(saved, credential);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_cached_token_skips_listener() {
    let path = token_path("cached");
    let cached = Credential::new("cached-access", "Bearer").with_refresh_token("cached-refresh");
    FileTokenStore::new(&path).save(&cached).await.unwrap();
    let before = std::fs::read(&path).unwrap();

    let exchanger = RecordingExchanger::default();
    let coordinator = OAuth2Coordinator::new(config(9002), FileTokenStore::new(&path), &exchanger);

    let credential = coordinator.resolve_token().await.unwrap();
    assert_eq!(credential, cached);
    assert!(exchanger.calls().is_empty());
    assert_eq!(coordinator.state(), AuthState::TokenReady);

    // Nothing listens on the configured port
    assert!(tokio::net::TcpStream::connect("127.0.0.1:9002").await.is_err());
    // Cache file untouched
    assert_eq!(std::fs::read(&path).unwrap(), before);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_corrupt_cache_falls_back_to_browser_flow() {
    let path = token_path("corrupt");
    std::fs::write(&path, "this-is-not-json").unwrap();

    let exchanger = RecordingExchanger::default();
    let coordinator = OAuth2Coordinator::new(config(9003), FileTokenStore::new(&path), &exchanger);

    let (credential, _) = tokio::join!(
        coordinator.resolve_token(),
        follow_redirect("http://localhost:9003/?state=state-token&code=again")
    );

    assert_eq!(credential.unwrap().access_token, "access-again");
    let saved = FileTokenStore::new(&path).load().await.unwrap();
    assert_eq!(saved.access_token, "access-again");
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_wrong_state_fails_without_exchange() {
    let path = token_path("bad-state");
    let exchanger = RecordingExchanger::default();
    let coordinator = OAuth2Coordinator::new(config(9004), FileTokenStore::new(&path), &exchanger);

    let (result, status) = tokio::join!(
        coordinator.resolve_token(),
        follow_redirect("http://localhost:9004/?state=forged&code=testcode123")
    );

    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert!(matches!(result, Err(Error::Redirect(_))));
    assert!(matches!(coordinator.state(), AuthState::Failed(_)));
    assert!(exchanger.calls().is_empty());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_unwritable_cache_is_not_fatal() {
    let path = token_path("missing-dir").join("token.json");
    let exchanger = RecordingExchanger::default();
    let coordinator = OAuth2Coordinator::new(config(9005), FileTokenStore::new(&path), &exchanger);

    let (credential, _) = tokio::join!(
        coordinator.resolve_token(),
        follow_redirect("http://localhost:9005/?state=state-token&code=kept")
    );

    assert_eq!(credential.unwrap().access_token, "access-kept");
    assert_eq!(coordinator.state(), AuthState::TokenReady);
}
