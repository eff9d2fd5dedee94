//! Persistent token cache.
//!
//! A cached [`Credential`] lets later runs skip the browser round trip. The
//! file format is the credential's JSON encoding followed by a newline.

mod keyring;

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::credential::Credential;

pub use self::keyring::KeyringTokenStore;

/// Token cache error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing is cached yet.
    #[error("no cached token at {0}")]
    NotFound(String),

    /// The cached bytes are not a valid credential.
    #[error("cached token at {location} could not be decoded: {source}")]
    Decode {
        /// Where the token was read from.
        location: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },

    /// Reading or writing the cache failed.
    #[error("failed to access token cache at {location}: {source}")]
    Io {
        /// Where the token was read from or written to.
        location: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The platform credential store failed.
    #[error("keyring error: {0}")]
    Keyring(#[from] ::keyring::Error),
}

impl StoreError {
    /// Returns true when the cache is simply empty.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for token cache operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Loads and saves the cached credential.
pub trait TokenStore {
    /// Loads the cached credential.
    ///
    /// Fails with [`StoreError::NotFound`] when nothing is cached and
    /// [`StoreError::Decode`] when the cache is corrupt.
    fn load(&self) -> impl Future<Output = StoreResult<Credential>> + Send;

    /// Replaces the cached credential.
    fn save(&self, credential: &Credential) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Token cache backed by a JSON file, `token.json` by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Default cache file name.
    pub const DEFAULT_PATH: &'static str = "token.json";

    /// Creates a store reading and writing `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(self.location())
        } else {
            StoreError::Io {
                location: self.location(),
                source,
            }
        }
    }
}

impl Default for FileTokenStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl TokenStore for FileTokenStore {
    async fn load(&self) -> StoreResult<Credential> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        let credential = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            location: self.location(),
            source,
        })?;
        debug!(path = %self.path.display(), "Loaded cached token");
        Ok(credential)
    }

    async fn save(&self, credential: &Credential) -> StoreResult<()> {
        let mut bytes = serde_json::to_vec(credential).map_err(|e| StoreError::Io {
            location: self.location(),
            source: e.into(),
        })?;
        bytes.push(b'\n');

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let write = async {
            let mut file = options.open(&self.path).await?;
            file.write_all(&bytes).await?;
            file.flush().await
        };
        write.await.map_err(|source| StoreError::Io {
            location: self.location(),
            source,
        })?;

        debug!(path = %self.path.display(), "Saved token");
        Ok(())
    }
}

/// Token cache chosen at startup.
#[derive(Debug, Clone)]
pub enum TokenBackend {
    /// JSON file on disk.
    File(FileTokenStore),
    /// Platform credential store.
    Keyring(KeyringTokenStore),
}

impl TokenStore for TokenBackend {
    async fn load(&self) -> StoreResult<Credential> {
        match self {
            Self::File(store) => store.load().await,
            Self::Keyring(store) => store.load().await,
        }
    }

    async fn save(&self, credential: &Credential) -> StoreResult<()> {
        match self {
            Self::File(store) => store.save(credential).await,
            Self::Keyring(store) => store.save(credential).await,
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
    use chrono::{TimeZone, Utc};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gmailalert-store-{}-{name}", std::process::id()))
    }

    fn credential() -> Credential {
        Credential::new("ya29.access", "Bearer")
            .with_refresh_token("1//refresh")
            .with_expiry(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let path = temp_path("roundtrip.json");
        let store = FileTokenStore::new(&path);

        store.save(&credential()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), credential());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "{\"access_token\":\"ya29.access\",\"token_type\":\"Bearer\",\"refresh_token\":\"1//refresh\",\"expiry\":\"2024-03-01T12:00:00Z\"}\n"
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_save_truncates_previous_content() {
        let path = temp_path("truncate.json");
        std::fs::write(&path, "x".repeat(4096)).unwrap();
        let store = FileTokenStore::new(&path);

        store.save(&Credential::new("a", "Bearer")).await.unwrap();
        assert_eq!(store.load().await.unwrap().access_token, "a");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let store = FileTokenStore::new(temp_path("missing.json"));
        let err = store.load().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_load_corrupt_file() {
        let path = temp_path("corrupt.json");
        std::fs::write(&path, "this-is-not-json").unwrap();

        let err = FileTokenStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_save_into_missing_directory() {
        let store = FileTokenStore::new(temp_path("no-such-dir").join("token.json"));
        let err = store.save(&credential()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("mode.json");
        FileTokenStore::new(&path).save(&credential()).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_backend_delegates_to_file() {
        let path = temp_path("backend.json");
        let backend = TokenBackend::File(FileTokenStore::new(&path));

        backend.save(&credential()).await.unwrap();
        assert_eq!(backend.load().await.unwrap(), credential());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_default_path() {
        assert_eq!(FileTokenStore::default().path(), Path::new("token.json"));
    }
}
