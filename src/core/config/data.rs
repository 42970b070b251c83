use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::mcp::TOOL_NAMESPACE_DELIMITER;

pub const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_PROBE_GRACE_MS: u64 = 10_000;
pub const DEFAULT_MAX_EVENTS_PER_STREAM: usize = 500;
pub const DEFAULT_MAX_EVENT_AGE_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_OAUTH_POLLING_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_OAUTH_POLLING_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_OAUTH_DISCOVERY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_OAUTH_CALLBACK_URL: &str = "http://127.0.0.1:9000/oauth/callback";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub permissions: PermissionsConfig,
    pub tool_groups: Vec<ToolGroup>,
    pub target_servers: Vec<TargetServerDescriptor>,
    pub sessions: SessionsConfig,
    pub event_store: EventStoreConfig,
    pub oauth: OAuthConfig,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PermissionsConfig {
    pub default: ConsumerConfig,
    pub consumers: BTreeMap<String, ConsumerConfig>,
}

/// Per-consumer policy as written in configuration.
///
/// With only `block` present the consumer is default-allow; with only `allow`
/// present it is default-block. Otherwise `type` decides, and an absent `type`
/// means default-block.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ConsumerConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ConsumerPolicyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumerPolicyKind {
    DefaultAllow,
    DefaultBlock,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolGroup {
    pub name: String,
    #[serde(default)]
    pub services: BTreeMap<String, ToolSelector>,
}

/// `"*"` for every tool of a service, or an explicit list of tool names.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ToolSelector {
    Pattern(String),
    Tools(Vec<String>),
}

/// Immutable description of one downstream server. Replaced wholesale on update.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TargetServerDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, EnvValue>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv { from_env: String },
}

impl TargetServerDescriptor {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
            },
        }
    }

    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::StreamableHttp {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Sse {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self.transport, TransportConfig::Stdio { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                Some(url)
            }
        }
    }

    /// Returns a copy keyed by the normalized server name.
    pub fn normalized(&self) -> Self {
        Self {
            name: normalize_server_name(&self.name),
            transport: self.transport.clone(),
        }
    }

    /// Copy with `values` merged into the stdio environment as literals.
    ///
    /// A name matching a `from_env` variable fills every entry that reads
    /// it. Any other name is taken as an env key.
    pub fn with_env(&self, values: &BTreeMap<String, String>) -> Self {
        let mut descriptor = self.clone();
        if let TransportConfig::Stdio { env, .. } = &mut descriptor.transport {
            let mut resolved = BTreeSet::new();
            for entry in env.values_mut() {
                let supplied = match entry {
                    EnvValue::FromEnv { from_env } => values
                        .get(from_env)
                        .map(|value| (from_env.clone(), value.clone())),
                    EnvValue::Literal(_) => None,
                };
                if let Some((variable, value)) = supplied {
                    *entry = EnvValue::Literal(value);
                    resolved.insert(variable);
                }
            }
            for (key, value) in values {
                if !resolved.contains(key) {
                    env.insert(key.clone(), EnvValue::Literal(value.clone()));
                }
            }
        }
        descriptor
    }

    pub fn transport_label(&self) -> &'static str {
        match self.transport {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamable-http",
        }
    }
}

/// Lowercases and trims a server name, replacing spaces and dots with `-`.
pub fn normalize_server_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|ch| match ch {
            ' ' | '.' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

pub fn is_valid_server_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(TOOL_NAMESPACE_DELIMITER)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Zero disables per-session pings.
    pub ping_interval_ms: u64,
    /// Zero disables idle collection and liveness tracking.
    pub idle_ttl_ms: u64,
    /// Defaults to the TTL.
    pub sweep_interval_ms: Option<u64>,
    pub probe_grace_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            idle_ttl_ms: 0,
            sweep_interval_ms: None,
            probe_grace_ms: DEFAULT_PROBE_GRACE_MS,
        }
    }
}

impl SessionsConfig {
    pub fn effective_sweep_interval_ms(&self) -> u64 {
        self.sweep_interval_ms.unwrap_or(self.idle_ttl_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Zero keeps every event.
    pub max_events_per_stream: usize,
    /// Zero disables age-based eviction.
    pub max_event_age_ms: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_events_per_stream: DEFAULT_MAX_EVENTS_PER_STREAM,
            max_event_age_ms: DEFAULT_MAX_EVENT_AGE_MS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TokenStorage {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OAuthConfig {
    pub storage: TokenStorage,
    pub tokens_dir: Option<PathBuf>,
    pub callback_url: String,
    pub polling_interval_ms: u64,
    pub polling_max_attempts: u32,
    pub discovery_timeout_ms: u64,
    pub client_name: String,
    pub client_id: Option<String>,
    pub scope: Option<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            storage: TokenStorage::File,
            tokens_dir: None,
            callback_url: DEFAULT_OAUTH_CALLBACK_URL.to_string(),
            polling_interval_ms: DEFAULT_OAUTH_POLLING_INTERVAL_MS,
            polling_max_attempts: DEFAULT_OAUTH_POLLING_MAX_ATTEMPTS,
            discovery_timeout_ms: DEFAULT_OAUTH_DISCOVERY_TIMEOUT_MS,
            client_name: "gatehouse".to_string(),
            client_id: None,
            scope: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

pub fn path_display(path: &Path) -> String {
    path.display().to_string()
}
