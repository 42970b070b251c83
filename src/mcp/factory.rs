//! Builds connected, initialized target-server sessions from descriptors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::config::{ConnectionConfig, EnvValue, TargetServerDescriptor, TransportConfig};
use crate::mcp::connection::{McpConnection, SharedTargetConnection};
use crate::mcp::oauth::tokens::OAuthTokens;
use crate::mcp::transport::http::build_http_client;
use crate::mcp::transport::sse::SseChannel;
use crate::mcp::transport::stdio::{StdioChannel, StdioLaunch};
use crate::mcp::transport::streamable_http::StreamableHttpChannel;
use crate::mcp::transport::{RpcChannel, TransportError};

#[async_trait]
pub trait TargetConnectionFactory: Send + Sync {
    /// Opens the transport and completes the initialize handshake.
    async fn connect(
        &self,
        descriptor: &TargetServerDescriptor,
        tokens: Option<&OAuthTokens>,
    ) -> Result<SharedTargetConnection, TransportError>;
}

pub type SharedConnectionFactory = Arc<dyn TargetConnectionFactory>;

/// Resolves the stdio environment against a snapshot of ambient values.
/// Every `from_env` reference must resolve; the missing ones are reported
/// together.
pub fn resolve_stdio_env(
    env: &BTreeMap<String, EnvValue>,
    ambient: &HashMap<String, String>,
) -> Result<HashMap<String, String>, TransportError> {
    let mut resolved = HashMap::with_capacity(env.len());
    let mut missing = Vec::new();
    for (key, value) in env {
        match value {
            EnvValue::Literal(literal) => {
                resolved.insert(key.clone(), literal.clone());
            }
            EnvValue::FromEnv { from_env } => match ambient.get(from_env) {
                Some(found) => {
                    resolved.insert(key.clone(), found.clone());
                }
                None => missing.push(from_env.clone()),
            },
        }
    }
    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(TransportError::MissingInput { variables: missing })
    }
}

/// Rewrites the OS error for a failed spawn into something an operator can act on.
fn describe_spawn_error(command: &str, source: std::io::Error) -> TransportError {
    let message = match source.kind() {
        std::io::ErrorKind::NotFound => {
            format!("command '{command}' not found; check that it is installed and on PATH")
        }
        std::io::ErrorKind::PermissionDenied => {
            format!("permission denied running '{command}'; check that it is executable")
        }
        _ => format!("failed to start '{command}': {source}"),
    };
    TransportError::Spawn { message, source }
}

pub struct McpConnectionFactory {
    environment: HashMap<String, String>,
    client: reqwest::Client,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl McpConnectionFactory {
    /// `environment` is the snapshot `from_env` values resolve against.
    pub fn new(
        connection: &ConnectionConfig,
        environment: HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            environment,
            client: build_http_client()?,
            connect_timeout: Duration::from_millis(connection.connect_timeout_ms),
            request_timeout: Duration::from_millis(connection.request_timeout_ms),
        })
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    async fn open_channel(
        &self,
        descriptor: &TargetServerDescriptor,
        bearer_token: Option<String>,
    ) -> Result<Arc<dyn RpcChannel>, TransportError> {
        let name = descriptor.name.as_str();
        match &descriptor.transport {
            TransportConfig::Stdio { command, args, env } => {
                let launch = StdioLaunch {
                    command: command.clone(),
                    args: args.clone(),
                    env: resolve_stdio_env(env, &self.environment)?,
                };
                let channel = StdioChannel::spawn(name, &launch, self.request_timeout).map_err(
                    |err| match err {
                        TransportError::Spawn { source, .. } => {
                            describe_spawn_error(&launch.command, source)
                        }
                        other => other,
                    },
                )?;
                Ok(channel)
            }
            TransportConfig::StreamableHttp { url, headers } => {
                Ok(Arc::new(StreamableHttpChannel::new(
                    name,
                    self.client.clone(),
                    url,
                    headers.clone(),
                    bearer_token,
                    self.request_timeout,
                )))
            }
            TransportConfig::Sse { url, headers } => {
                let channel = SseChannel::connect(
                    name,
                    self.client.clone(),
                    url,
                    headers.clone(),
                    bearer_token,
                    self.connect_timeout,
                )
                .await?;
                Ok(channel)
            }
        }
    }
}

#[async_trait]
impl TargetConnectionFactory for McpConnectionFactory {
    async fn connect(
        &self,
        descriptor: &TargetServerDescriptor,
        tokens: Option<&OAuthTokens>,
    ) -> Result<SharedTargetConnection, TransportError> {
        debug!(
            server = %descriptor.name,
            transport = descriptor.transport_label(),
            with_token = tokens.is_some(),
            "Connecting to target server"
        );
        let bearer_token = tokens.map(|tokens| tokens.access_token.clone());
        let channel = self.open_channel(descriptor, bearer_token).await?;
        let connection =
            McpConnection::establish(&descriptor.name, channel, self.connect_timeout)
                .await
                .map_err(|err| {
                    if err.is_unauthorized() {
                        TransportError::Unauthorized
                    } else {
                        err
                    }
                })?;
        Ok(Arc::new(connection))
    }
}
