use std::collections::BTreeMap;
use std::time::Duration;

use super::TransportError;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_EVENT_STREAM_ACCEPT: &str = "text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Shared client for every remote target. No overall request timeout is set
/// because SSE streams stay open; callers bound individual requests.
pub fn build_http_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(TransportError::from)
}

pub fn apply_streamable_http_client_post_headers(
    request: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_streamable_http_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

/// Adds configured static headers, then the bearer token when present.
pub fn apply_target_headers(
    mut request: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
    bearer_token: Option<&str>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    match bearer_token {
        Some(token) if !token.trim().is_empty() => {
            request.header("Authorization", format!("Bearer {}", token.trim()))
        }
        _ => request,
    }
}

pub fn apply_session_id_header(
    request: reqwest::RequestBuilder,
    session_id: Option<&str>,
) -> reqwest::RequestBuilder {
    match session_id {
        Some(session_id) => request.header(MCP_SESSION_ID_HEADER, session_id),
        None => request,
    }
}

pub fn response_session_id(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn response_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}
