use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    CallToolResult, ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, PaginatedRequestParams, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

use crate::mcp::transport::TransportError;

/// Initialize parameters the gateway presents to every target server.
pub fn client_details_for(server: &str) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: format!("gatehouse::{server}"),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Gatehouse MCP gateway".to_string()),
            description: Some("Gatehouse MCP gateway".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, TransportError> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(TransportError::Protocol(
            "Unexpected initialize response.".to_string(),
        ));
    }
    Ok(result)
}

pub fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, TransportError> {
    parse_response(message)
}

pub fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, TransportError> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(
    message: ServerMessage,
) -> Result<T, TransportError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| TransportError::Protocol(err.to_string()))
}

pub fn parse_response_value(message: ServerMessage) -> Result<Value, TransportError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| TransportError::Protocol(err.to_string())),
        ServerMessage::Error(error) => Err(TransportError::Rpc {
            code: error.error.code,
            message: format_rpc_error(&error.error),
        }),
        other => Err(TransportError::Protocol(format_unexpected_server_message(
            &other,
        ))),
    }
}

pub fn format_unexpected_server_message(message: &ServerMessage) -> String {
    format!("Unexpected MCP server message: {message:?}")
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}
