use crate::core::config::data::GatewayConfig;
use crate::core::config::io::ConfigError;
use crate::core::config::source::ConfigSource;
use crate::core::sync;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{info, warn};

struct FileCacheState {
    config: Arc<GatewayConfig>,
    modified: Option<SystemTime>,
    version: u64,
}

/// Configuration backed by a TOML file, reloaded when its mtime changes.
///
/// A reload that fails to parse keeps serving the last good snapshot.
pub struct FileConfigSource {
    path: PathBuf,
    state: Mutex<FileCacheState>,
}

impl FileConfigSource {
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let modified = Self::modified_time(&path);
        let config = GatewayConfig::load_from_path(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(FileCacheState {
                config: Arc::new(config),
                modified,
                version: 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads when the file changed on disk; returns whether the version moved.
    pub fn refresh(&self) -> Result<bool, ConfigError> {
        let mut state = sync::lock(&self.state);
        let disk_modified = Self::modified_time(&self.path);
        if state.modified == disk_modified {
            return Ok(false);
        }
        let config = GatewayConfig::load_from_path(&self.path)?;
        state.modified = disk_modified;
        state.config = Arc::new(config);
        state.version += 1;
        info!(path = %self.path.display(), version = state.version, "Reloaded gateway config");
        Ok(true)
    }

    fn modified_time(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).ok()?.modified().ok()
    }
}

impl ConfigSource for FileConfigSource {
    fn current(&self) -> (u64, Arc<GatewayConfig>) {
        if let Err(err) = self.refresh() {
            warn!(path = %self.path.display(), error = %err, "Keeping previous gateway config");
        }
        let state = sync::lock(&self.state);
        (state.version, state.config.clone())
    }
}
