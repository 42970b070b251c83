//! An initialized MCP session with one target server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::{CallToolRequestParams, CallToolResult, InitializeResult, Tool};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::mcp::protocol::{
    client_details_for, paginated_params, parse_call_tool, parse_initialize_result,
    parse_list_tools,
};
use crate::mcp::transport::{RpcChannel, TransportError};

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_LIST_PAGES: usize = 100;

/// What the gateway needs from a connected target server.
#[async_trait]
pub trait TargetConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub type SharedTargetConnection = Arc<dyn TargetConnection>;

pub struct McpConnection {
    server: String,
    channel: Arc<dyn RpcChannel>,
    server_details: InitializeResult,
}

impl McpConnection {
    /// Runs the initialize handshake over `channel`. The channel is closed
    /// when the handshake fails.
    pub async fn establish(
        server: &str,
        channel: Arc<dyn RpcChannel>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let handshake = async {
            let response = channel
                .send_request(RequestFromClient::InitializeRequest(client_details_for(
                    server,
                )))
                .await?;
            let details = parse_initialize_result(response)?;
            channel.set_protocol_version(&details.protocol_version);
            channel
                .send_notification(NotificationFromClient::InitializedNotification(None))
                .await?;
            Ok::<_, TransportError>(details)
        };

        let outcome = match tokio::time::timeout(timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout {
                operation: "initialize",
            }),
        };
        match outcome {
            Ok(server_details) => {
                debug!(
                    server,
                    protocol_version = %server_details.protocol_version,
                    server_name = %server_details.server_info.name,
                    "Target server initialized"
                );
                Ok(Self {
                    server: server.to_string(),
                    channel,
                    server_details,
                })
            }
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    warn!(server, error = %close_err, "Failed to close channel after handshake error");
                }
                Err(err)
            }
        }
    }

    pub fn server_details(&self) -> &InitializeResult {
        &self.server_details
    }

    async fn fetch_tools_page(
        &self,
        cursor: Option<String>,
    ) -> Result<Option<rust_mcp_schema::ListToolsResult>, TransportError> {
        let response = self
            .channel
            .send_request(RequestFromClient::ListToolsRequest(paginated_params(cursor)))
            .await?;
        match parse_list_tools(response) {
            Ok(list) => Ok(Some(list)),
            Err(err) if err.is_method_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl TargetConnection for McpConnection {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_TOOL_LIST_PAGES {
            let Some(page) = self.fetch_tools_page(cursor.take()).await? else {
                break;
            };
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if cursor.is_some() {
            warn!(server = %self.server, "Tool listing truncated after {MAX_TOOL_LIST_PAGES} pages");
        }
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = self
            .channel
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        parse_call_tool(response)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close().await
    }
}
