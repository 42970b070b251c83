//! The gateway facade: one merged, permission-filtered tool catalog over
//! every connected target server, with session-aware dispatch.

use std::sync::Arc;

use rust_mcp_schema::{CallToolResult, Tool};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::audit::{report_tool_call, SharedAuditSink, ToolCallEvent, ToolCallOutcome};
use crate::core::clock::SharedClock;
use crate::core::config::SharedConfigSource;
use crate::core::{EntityKind, GatewayError, GatewayResult};
use crate::event_store::InMemoryEventStore;
use crate::mcp::factory::SharedConnectionFactory;
use crate::mcp::oauth::flows::OAuthFlowRegistry;
use crate::mcp::oauth::tokens::SharedTokenStore;
use crate::mcp::oauth::{polling_options, OAuthConnectionHandler, SharedAuthorizer};
use crate::mcp::targets::{TargetConnectionManager, TargetPhase};
use crate::mcp::TOOL_NAMESPACE_DELIMITER;
use crate::permissions::PermissionEngine;
use crate::sessions::{SessionsManager, TouchSource};

/// Collaborators a [`Gateway`] is assembled from.
pub struct GatewayParts {
    pub config: SharedConfigSource,
    pub factory: SharedConnectionFactory,
    pub authorizer: SharedAuthorizer,
    pub tokens: SharedTokenStore,
    pub clock: SharedClock,
    pub audit: SharedAuditSink,
}

pub struct Gateway {
    config: SharedConfigSource,
    permissions: PermissionEngine,
    targets: TargetConnectionManager,
    sessions: SessionsManager,
    events: InMemoryEventStore,
    audit: SharedAuditSink,
}

/// Splits `service__tool` at the first delimiter.
pub fn split_tool_name(namespaced: &str) -> Option<(&str, &str)> {
    namespaced
        .split_once(TOOL_NAMESPACE_DELIMITER)
        .filter(|(service, tool)| !service.is_empty() && !tool.is_empty())
}

pub fn namespaced_tool_name(service: &str, tool: &str) -> String {
    format!("{service}{TOOL_NAMESPACE_DELIMITER}{tool}")
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Self {
        let config = parts.config.snapshot();
        let oauth = OAuthConnectionHandler::new(
            parts.factory.clone(),
            parts.authorizer,
            parts.tokens,
            Arc::new(OAuthFlowRegistry::new()),
            polling_options(&config.oauth),
        );
        Self {
            permissions: PermissionEngine::new(parts.config.clone()),
            targets: TargetConnectionManager::new(parts.factory, oauth, parts.audit.clone()),
            sessions: SessionsManager::new(
                config.sessions.clone(),
                parts.clock.clone(),
                parts.audit.clone(),
            ),
            events: InMemoryEventStore::new(&config.event_store, parts.clock),
            audit: parts.audit,
            config: parts.config,
        }
    }

    /// Compiles the permission policy, starts session monitoring and
    /// connects every configured target server. Per-server outcomes are
    /// returned rather than failing the whole start.
    pub async fn start(&self) -> GatewayResult<Vec<(String, GatewayResult<TargetPhase>)>> {
        self.permissions.initialize()?;
        self.sessions.start();
        let descriptors = self.config.snapshot().target_servers.clone();
        info!(servers = descriptors.len(), "Connecting target servers");
        Ok(self.targets.connect_all(descriptors).await)
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn targets(&self) -> &TargetConnectionManager {
        &self.targets
    }

    pub fn sessions(&self) -> &SessionsManager {
        &self.sessions
    }

    pub fn events(&self) -> &InMemoryEventStore {
        &self.events
    }

    /// Every tool `consumer` may call, named `<service>__<tool>`. Servers that
    /// are not connected or fail to list are skipped.
    pub async fn list_tools(&self, consumer: Option<&str>) -> GatewayResult<Vec<Tool>> {
        let policy = self.permissions.current_policy()?;
        let mut catalog = Vec::new();
        for service in self.targets.connected_servers() {
            let tools = match self.targets.list_tools(&service).await {
                Ok(tools) => tools,
                Err(err) => {
                    warn!(server = %service, error = %err, "Skipping target server in tool listing");
                    continue;
                }
            };
            catalog.extend(
                tools
                    .into_iter()
                    .filter(|tool| policy.permits(consumer, &service, &tool.name))
                    .map(|mut tool| {
                        tool.name = namespaced_tool_name(&service, &tool.name);
                        tool
                    }),
            );
        }
        debug!(consumer = consumer.unwrap_or("-"), tools = catalog.len(), "Listed tools");
        Ok(catalog)
    }

    /// Lists tools for the consumer bound to `session_id`.
    pub async fn list_tools_for_session(&self, session_id: &str) -> GatewayResult<Vec<Tool>> {
        self.sessions.touch_session(session_id, TouchSource::Request);
        let consumer = self.sessions.consumer_tag(session_id);
        self.list_tools(consumer.as_deref()).await
    }

    pub async fn call_tool(
        &self,
        session_id: &str,
        namespaced_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> GatewayResult<CallToolResult> {
        self.sessions.touch_session(session_id, TouchSource::Request);
        let consumer = self.sessions.consumer_tag(session_id);
        let (service, tool) = split_tool_name(namespaced_name)
            .ok_or_else(|| GatewayError::not_found(EntityKind::Tool, namespaced_name))?;

        let started = Instant::now();
        let result = match self.permissions.check(consumer.as_deref(), service, tool) {
            Ok(()) => self.targets.call_tool(service, tool, arguments).await,
            Err(err) => Err(err),
        };
        let outcome = match &result {
            Ok(result) if result.is_error.unwrap_or(false) => ToolCallOutcome::ToolError,
            Ok(_) => ToolCallOutcome::Success,
            Err(GatewayError::PermissionDenied { .. }) => ToolCallOutcome::Denied,
            Err(_) => ToolCallOutcome::Failed,
        };
        report_tool_call(
            self.audit.as_ref(),
            &ToolCallEvent {
                session_id: Some(session_id.to_string()),
                consumer_tag: consumer,
                service: service.to_string(),
                tool: tool.to_string(),
                outcome,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
        );
        result
    }

    /// Routes an OAuth callback to its pending flow. Returns the server name.
    pub fn complete_authorization(&self, state: &str, code: &str) -> GatewayResult<String> {
        self.targets.complete_authorization(state, code)
    }

    pub fn get_authorization_url(&self, server: &str) -> GatewayResult<Option<String>> {
        self.targets.get_authorization_url(server)
    }

    pub async fn reconnect(&self, server: &str) -> GatewayResult<()> {
        self.targets.reconnect(server).await
    }

    /// Closes sessions first, then target servers. Safe to repeat.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.targets.shutdown().await;
        info!("Gateway shut down");
    }
}
