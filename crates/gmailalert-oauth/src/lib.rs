//! # gmailalert-oauth
//!
//! `OAuth2` authorization-code flow for command-line tools.
//!
//! ## Features
//!
//! - **Redirect listener**: loopback HTTP server receiving the provider redirect
//! - **Token cache**: JSON file (owner-only permissions) or platform keyring
//! - **Coordinator**: cached token first, browser round trip on a miss
//! - **Authorized client**: attaches the bearer token and refreshes it on expiry
//!
//! ## Quick Start
//!
//! ```ignore
//! use gmailalert_oauth::{
//!     AuthorizationRequest, AuthorizedClientFactory, CoordinatorConfig, FileTokenStore,
//!     GMAIL_READONLY_SCOPE, ListenerConfig, OAuth2Coordinator, OAuthClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let document = std::fs::read("credentials.json")?;
//!     let request = AuthorizationRequest::from_json(&document, &[GMAIL_READONLY_SCOPE])?;
//!
//!     let config = CoordinatorConfig::new(request.clone(), ListenerConfig::new(9999)?)?;
//!     let coordinator = OAuth2Coordinator::new(
//!         config,
//!         FileTokenStore::default(),
//!         OAuthClient::new(request.clone()),
//!     );
//!
//!     // Prints the authorization URL when no token is cached
//!     let credential = coordinator.resolve_token().await?;
//!
//!     let client = AuthorizedClientFactory::new().build_client(&request, credential)?;
//!     let response = client
//!         .send(client.http_client().get("https://gmail.googleapis.com/gmail/v1/users/me/profile"))
//!         .await?;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod client;
pub mod coordinator;
pub mod credential;
mod error;
pub mod flow;
pub mod provider;
pub mod redirect;
pub mod store;

pub use client::{AuthorizedClient, AuthorizedClientFactory};
pub use coordinator::{AuthState, CoordinatorConfig, OAuth2Coordinator};
pub use credential::Credential;
pub use error::{Error, Result};
pub use flow::{CodeExchanger, OAuthClient};
pub use provider::{AuthorizationRequest, GMAIL_READONLY_SCOPE};
pub use redirect::{
    ListenerConfig, Notifications, RedirectError, RedirectListener, RedirectOutcome, STATE_TOKEN,
};
pub use store::{
    FileTokenStore, KeyringTokenStore, StoreError, StoreResult, TokenBackend, TokenStore,
};
