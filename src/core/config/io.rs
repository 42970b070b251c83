use crate::core::config::data::{
    is_valid_server_name, normalize_server_name, path_display, GatewayConfig,
};
use directories::ProjectDirs;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors raised while loading, saving or compiling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    #[error("Failed to parse config at {}: {source}", path_display(.path))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to write config at {}: {reason}", path_display(.path))]
    Write { path: PathBuf, reason: String },

    #[error("Required ToolGroup {group} not found, review config")]
    UnknownToolGroup { group: String },

    #[error("Tool group {group} has invalid selector {value:?} for service {service}; use \"*\" or a list of tool names")]
    InvalidToolSelector {
        group: String,
        service: String,
        value: String,
    },

    #[error("Target server {name} is configured more than once")]
    DuplicateTargetServer { name: String },

    #[error("Target server name {name:?} is invalid: {reason}")]
    InvalidTargetServer { name: String, reason: String },

    #[error("Unable to determine a config directory for this platform")]
    NoConfigDirectory,
}

impl GatewayConfig {
    /// Loads the config at `config_path`, or the defaults when it does not exist.
    pub fn load_from_path(config_path: &Path) -> Result<GatewayConfig, ConfigError> {
        if !config_path.exists() {
            return Ok(GatewayConfig::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: GatewayConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: config_path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let write_error = |reason: String| ConfigError::Write {
            path: config_path.to_path_buf(),
            reason,
        };
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(|err| write_error(err.to_string()))?;
        }

        let contents = toml::to_string_pretty(self).map_err(|err| write_error(err.to_string()))?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(|err| write_error(err.to_string()))?;

        temp_file
            .write_all(contents.as_bytes())
            .map_err(|err| write_error(err.to_string()))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(|err| write_error(err.to_string()))?;
        temp_file
            .persist(config_path)
            .map_err(|err| write_error(err.to_string()))?;
        Ok(())
    }

    /// Structural checks that do not need the permission compiler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.target_servers {
            if !is_valid_server_name(&server.name) {
                return Err(ConfigError::InvalidTargetServer {
                    name: server.name.clone(),
                    reason: format!(
                        "names must be non-empty and must not contain {:?}",
                        crate::mcp::TOOL_NAMESPACE_DELIMITER
                    ),
                });
            }
            if !seen.insert(normalize_server_name(&server.name)) {
                return Err(ConfigError::DuplicateTargetServer {
                    name: server.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    pub fn default_tokens_dir() -> Result<PathBuf, ConfigError> {
        Ok(project_dirs()?.data_dir().join("tokens"))
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("org", "gatehouse", "gatehouse").ok_or(ConfigError::NoConfigDirectory)
}
