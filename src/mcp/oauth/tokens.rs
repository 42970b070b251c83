//! Persistence for OAuth tokens obtained from target servers.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::core::config::{ConfigError, GatewayConfig, OAuthConfig, TokenStorage};
use crate::core::sync;

pub const KEYRING_SERVICE: &str = "gatehouse-oauth";

/// Access and refresh tokens for one target server, plus what is needed to
/// refresh them later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_epoch_s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl OAuthTokens {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: Some("Bearer".to_string()),
            scope: None,
            expires_at_epoch_s: None,
            client_id: None,
            token_endpoint: None,
            redirect_uri: None,
        }
    }

    /// True once the token is inside `safety_window_s` of its expiry.
    /// Tokens without an expiry never need a refresh.
    pub fn needs_refresh(&self, now_epoch_s: i64, safety_window_s: i64) -> bool {
        match self.expires_at_epoch_s {
            Some(expires_at) => expires_at <= now_epoch_s.saturating_add(safety_window_s),
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token data for '{server}' is unreadable: {source}")]
    Serialize {
        server: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("keyring access failed: {source}")]
    Keyring {
        recoverable: bool,
        #[source]
        source: keyring::Error,
    },
}

impl From<keyring::Error> for TokenStoreError {
    fn from(source: keyring::Error) -> Self {
        let recoverable = matches!(
            source,
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_)
        );
        TokenStoreError::Keyring {
            recoverable,
            source,
        }
    }
}

pub trait TokenStore: Send + Sync {
    fn load(&self, server: &str) -> Result<Option<OAuthTokens>, TokenStoreError>;

    fn save(&self, server: &str, tokens: &OAuthTokens) -> Result<(), TokenStoreError>;

    /// Returns whether anything was removed.
    fn remove(&self, server: &str) -> Result<bool, TokenStoreError>;
}

pub type SharedTokenStore = Arc<dyn TokenStore>;

/// Builds the store selected by `[oauth].storage`.
pub fn token_store_for(config: &OAuthConfig) -> Result<SharedTokenStore, ConfigError> {
    Ok(match config.storage {
        TokenStorage::Memory => Arc::new(MemoryTokenStore::default()),
        TokenStorage::Keyring => Arc::new(KeyringTokenStore::new(KEYRING_SERVICE)),
        TokenStorage::File => {
            let dir = match &config.tokens_dir {
                Some(dir) => dir.clone(),
                None => GatewayConfig::default_tokens_dir()?,
            };
            Arc::new(FileTokenStore::new(dir))
        }
    })
}

/// File names only keep ASCII alphanumerics, `-` and `_`.
pub fn sanitize_server_name(server: &str) -> String {
    server
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// One JSON file per server under a directory.
pub struct FileTokenStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, server: &str) -> PathBuf {
        self.dir
            .join(format!("{}-tokens.json", sanitize_server_name(server)))
    }

    fn io_error(path: &Path, source: std::io::Error) -> TokenStoreError {
        TokenStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, server: &str) -> Result<Option<OAuthTokens>, TokenStoreError> {
        let path = self.path_for(server);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(&path, err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| TokenStoreError::Serialize {
                server: server.to_string(),
                source,
            })
    }

    fn save(&self, server: &str, tokens: &OAuthTokens) -> Result<(), TokenStoreError> {
        let _guard = sync::lock(&self.write_lock);
        let path = self.path_for(server);
        let payload =
            serde_json::to_vec_pretty(tokens).map_err(|source| TokenStoreError::Serialize {
                server: server.to_string(),
                source,
            })?;

        std::fs::create_dir_all(&self.dir).map_err(|err| Self::io_error(&self.dir, err))?;
        let mut temp_file = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|err| Self::io_error(&self.dir, err))?;
        temp_file
            .write_all(&payload)
            .and_then(|_| temp_file.as_file().sync_all())
            .map_err(|err| Self::io_error(temp_file.path(), err))?;
        temp_file
            .persist(&path)
            .map_err(|err| Self::io_error(&path, err.error))?;
        debug!(server, path = %path.display(), "OAuth tokens saved");
        Ok(())
    }

    fn remove(&self, server: &str) -> Result<bool, TokenStoreError> {
        let _guard = sync::lock(&self.write_lock);
        let path = self.path_for(server);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }
}

/// Stores the serialized tokens as the keyring secret for `(service, server)`.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self, server: &str) -> Result<Option<OAuthTokens>, TokenStoreError> {
        let entry = Entry::new(&self.service, server)?;
        let secret = match entry.get_password() {
            Ok(secret) => secret,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&secret)
            .map(Some)
            .map_err(|source| TokenStoreError::Serialize {
                server: server.to_string(),
                source,
            })
    }

    fn save(&self, server: &str, tokens: &OAuthTokens) -> Result<(), TokenStoreError> {
        let secret =
            serde_json::to_string(tokens).map_err(|source| TokenStoreError::Serialize {
                server: server.to_string(),
                source,
            })?;
        let entry = Entry::new(&self.service, server)?;
        entry.set_password(&secret).map_err(TokenStoreError::from)
    }

    fn remove(&self, server: &str) -> Result<bool, TokenStoreError> {
        let entry = Entry::new(&self.service, server)?;
        match entry.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, OAuthTokens>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, server: &str) -> Result<Option<OAuthTokens>, TokenStoreError> {
        Ok(sync::lock(&self.tokens).get(server).cloned())
    }

    fn save(&self, server: &str, tokens: &OAuthTokens) -> Result<(), TokenStoreError> {
        sync::lock(&self.tokens).insert(server.to_string(), tokens.clone());
        Ok(())
    }

    fn remove(&self, server: &str) -> Result<bool, TokenStoreError> {
        Ok(sync::lock(&self.tokens).remove(server).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> OAuthTokens {
        OAuthTokens {
            refresh_token: Some("refresh".to_string()),
            expires_at_epoch_s: Some(1_000),
            token_endpoint: Some("https://auth.example.com/token".to_string()),
            ..OAuthTokens::bearer("access")
        }
    }

    #[test]
    fn refresh_window_is_inclusive() {
        let tokens = sample();
        assert!(tokens.needs_refresh(940, 60));
        assert!(!tokens.needs_refresh(939, 60));
        assert!(!OAuthTokens::bearer("forever").needs_refresh(i64::MAX - 1, 60));
    }

    #[test]
    fn file_store_persists_per_server() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(temp_dir.path().join("tokens"));
        assert_eq!(store.load("linear").unwrap(), None);

        store.save("linear", &sample()).expect("save");
        assert_eq!(store.load("linear").unwrap(), Some(sample()));
        assert_eq!(store.load("slack").unwrap(), None);
        assert!(store.path_for("linear").ends_with("linear-tokens.json"));

        assert!(store.remove("linear").unwrap());
        assert!(!store.remove("linear").unwrap());
        assert_eq!(store.load("linear").unwrap(), None);
    }

    #[test]
    fn file_store_reports_corrupt_files() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = FileTokenStore::new(temp_dir.path());
        std::fs::write(store.path_for("linear"), "{not json").expect("write");
        assert!(matches!(
            store.load("linear"),
            Err(TokenStoreError::Serialize { .. })
        ));
    }

    #[test]
    fn server_names_are_sanitized_for_paths() {
        assert_eq!(sanitize_server_name("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_server_name("my-server_1"), "my-server_1");
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryTokenStore::default();
        store.save("a", &sample()).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(sample()));
        assert!(store.remove("a").unwrap());
        assert_eq!(store.load("a").unwrap(), None);
    }

    #[test]
    fn configured_storage_selects_store() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = OAuthConfig {
            tokens_dir: Some(temp_dir.path().to_path_buf()),
            ..OAuthConfig::default()
        };
        let store = token_store_for(&config).expect("store");
        store.save("x", &sample()).unwrap();
        assert!(temp_dir.path().join("x-tokens.json").exists());
    }
}
