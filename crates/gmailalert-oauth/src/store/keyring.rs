//! Token cache in the platform credential store.
//!
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use keyring::Entry;
use tracing::debug;

use super::{StoreError, StoreResult, TokenStore};
use crate::credential::Credential;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "gmailalert";

/// Stores the credential JSON under one keyring entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringTokenStore {
    account: String,
}

impl KeyringTokenStore {
    /// Creates a store for the given keyring account name.
    #[must_use]
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    /// Keyring account name.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    fn location(&self) -> String {
        format!("keyring:{SERVICE_NAME}/{}", self.account)
    }

    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> keyring::Result<T> + Send + 'static,
    {
        let account = self.account.clone();
        let task = tokio::task::spawn_blocking(move || {
            let entry = Entry::new(SERVICE_NAME, &account)?;
            op(entry)
        });
        match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(keyring::Error::NoEntry)) => Err(StoreError::NotFound(self.location())),
            Ok(Err(e)) => Err(e.into()),
            Err(join) => Err(StoreError::Io {
                location: self.location(),
                source: std::io::Error::other(join),
            }),
        }
    }
}

impl TokenStore for KeyringTokenStore {
    async fn load(&self) -> StoreResult<Credential> {
        let secret = self.blocking(|entry| entry.get_password()).await?;
        let credential =
            serde_json::from_str(&secret).map_err(|source| StoreError::Decode {
                location: self.location(),
                source,
            })?;
        debug!(account = %self.account, "Loaded token from keyring");
        Ok(credential)
    }

    async fn save(&self, credential: &Credential) -> StoreResult<()> {
        let secret = serde_json::to_string(credential).map_err(|e| StoreError::Io {
            location: self.location(),
            source: e.into(),
        })?;
        self.blocking(move |entry| entry.set_password(&secret)).await?;
        debug!(account = %self.account, "Stored token in keyring");
        Ok(())
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
    fn test_location() {
        let store = KeyringTokenStore::new("me@example.com");
        assert_eq!(store.account(), "me@example.com");
        assert_eq!(store.location(), "keyring:gmailalert/me@example.com");
    }

    // Requires a running Secret Service / Keychain
    #[tokio::test]
    #[ignore = "requires a platform credential store"]
    async fn test_keyring_roundtrip() {
        let store = KeyringTokenStore::new("gmailalert-test");
        let credential = Credential::new("ya29.access", "Bearer").with_refresh_token("r");
        store.save(&credential).await.unwrap();
        assert_eq!(store.load().await.unwrap(), credential);
    }

    #[tokio::test]
    #[ignore = "requires a platform credential store"]
    async fn test_keyring_missing_entry() {
        let store = KeyringTokenStore::new("gmailalert-test-missing");
        assert!(store.load().await.unwrap_err().is_not_found());
    }
}
