//! Shared MCP transport abstractions.
//!
//! A transport only moves JSON-RPC messages; the MCP handshake and tool
//! operations on top of it live in [`crate::mcp::connection`]. Implementations
//! exist for locally spawned processes, legacy SSE endpoints and streamable
//! HTTP.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use thiserror::Error;

pub mod http;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

/// JSON-RPC code used by servers to indicate an unsupported method.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("target server requires authorization (401 Unauthorized)")]
    Unauthorized,

    #[error("missing required environment values: {}", .variables.join(", "))]
    MissingInput { variables: Vec<String> },

    #[error("{message}")]
    Spawn {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error: {status}")]
    HttpStatus { status: reqwest::StatusCode },

    #[error("{0}")]
    Protocol(String),

    #[error("{message}")]
    Rpc { code: i64, message: String },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("connection closed")]
    Closed,

    #[error("invalid target server descriptor: {0}")]
    InvalidDescriptor(String),
}

impl TransportError {
    /// Recognizes authentication challenges, including ones that only
    /// surface as text from a lower layer.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            TransportError::Unauthorized => true,
            TransportError::HttpStatus { status } => *status == reqwest::StatusCode::UNAUTHORIZED,
            TransportError::Rpc { code, message } => {
                *code == 401 || message.contains("401") || message.contains("Unauthorized")
            }
            TransportError::Protocol(message) => {
                message.contains("401") || message.contains("Unauthorized")
            }
            _ => false,
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        matches!(self, TransportError::Rpc { code, .. } if *code == MCP_METHOD_NOT_FOUND)
    }
}

/// Moves JSON-RPC messages between the gateway and one target server.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn send_request(&self, request: RequestFromClient)
        -> Result<ServerMessage, TransportError>;

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), TransportError>;

    /// Records the protocol version agreed during initialize.
    fn set_protocol_version(&self, _protocol_version: &str) {}

    async fn close(&self) -> Result<(), TransportError>;
}

/// Maps a non-success HTTP status to the matching transport error.
pub fn status_error(status: reqwest::StatusCode) -> TransportError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        TransportError::Unauthorized
    } else {
        TransportError::HttpStatus { status }
    }
}
