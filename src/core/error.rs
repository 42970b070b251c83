use std::fmt;

use thiserror::Error;

use crate::core::config::ConfigError;
use crate::core::polling::PollingError;
use crate::mcp::oauth::tokens::TokenStoreError;
use crate::mcp::targets::TargetPhase;
use crate::mcp::transport::TransportError;

/// What a lookup or registration was keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    TargetServer,
    Session,
    OAuthFlow,
    Tool,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::TargetServer => "target server",
            EntityKind::Session => "session",
            EntityKind::OAuthFlow => "OAuth flow",
            EntityKind::Tool => "tool",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: EntityKind, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("{component} is not initialized")]
    NotInitialized { component: &'static str },

    #[error("target server '{name}' is not ready (phase: {phase})")]
    TargetNotReady { name: String, phase: TargetPhase },

    #[error("consumer {} may not call {service}.{tool}", .consumer.as_deref().unwrap_or("<default>"))]
    PermissionDenied {
        consumer: Option<String>,
        service: String,
        tool: String,
    },

    #[error("polling exhausted after {attempts} attempts")]
    PollingExhausted { attempts: u32 },

    #[error("polling aborted")]
    PollingAborted,

    #[error("Invalid Last-Event-ID: {event_id}")]
    InvalidLastEventId { event_id: String },

    #[error("Last-Event-ID expired: {event_id}")]
    LastEventIdExpired { event_id: String },

    #[error("failed to connect to target server '{name}': {source}")]
    FailedToConnectToTargetServer {
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("target server '{name}' cannot change state while {phase}")]
    InvalidTransition { name: String, phase: TargetPhase },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),

    #[error("OAuth flow for target server '{name}' is no longer waiting for a code")]
    StaleOAuthFlow { name: String },

    #[error("OAuth failure for target server '{name}': {message}")]
    OAuth { name: String, message: String },
}

impl GatewayError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        GatewayError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: EntityKind, name: impl Into<String>) -> Self {
        GatewayError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn connect_failed(name: impl Into<String>, source: TransportError) -> Self {
        GatewayError::FailedToConnectToTargetServer {
            name: name.into(),
            source,
        }
    }
}

impl From<PollingError> for GatewayError {
    fn from(err: PollingError) -> Self {
        match err {
            PollingError::Exhausted { attempts } => GatewayError::PollingExhausted { attempts },
            PollingError::Aborted => GatewayError::PollingAborted,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
