use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::mcp::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSessionReason {
    TransportClosed,
    IdleTtlExceeded,
    ProbeTermination,
    Shutdown,
    Replaced,
}

impl CloseSessionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseSessionReason::TransportClosed => "transport-closed",
            CloseSessionReason::IdleTtlExceeded => "idle-ttl-exceeded",
            CloseSessionReason::ProbeTermination => "probe-termination",
            CloseSessionReason::Shutdown => "shutdown",
            CloseSessionReason::Replaced => "replaced",
        }
    }
}

impl fmt::Display for CloseSessionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a liveness touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchSource {
    Request,
    Ping,
    Notification,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmHints {
    pub provider: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AdapterVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl fmt::Display for AdapterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSupport {
    pub ping: bool,
}

/// A bridge the agent connects through, recognized from its client name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAdapter {
    pub name: String,
    pub version: Option<AdapterVersion>,
    pub support: Option<AdapterSupport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
    pub adapter: Option<ClientAdapter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub client_id: String,
    pub consumer_tag: Option<String>,
    pub llm: Option<LlmHints>,
    pub client_info: ClientInfo,
    pub is_probe: bool,
}

/// The upstream side of a client session.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn ping(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub type SharedSessionTransport = Arc<dyn SessionTransport>;

#[derive(Clone)]
pub struct ClientSession {
    pub transport: SharedSessionTransport,
    pub metadata: SessionMetadata,
}

impl ClientSession {
    pub fn new(transport: SharedSessionTransport, metadata: SessionMetadata) -> Self {
        Self {
            transport,
            metadata,
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Liveness record attached to a monitored session.
#[derive(Debug)]
pub struct SessionLiveness {
    last_seen_ms: AtomicU64,
    stop: CancellationToken,
}

impl SessionLiveness {
    pub fn new(now_ms: u64, stop: CancellationToken) -> Self {
        Self {
            last_seen_ms: AtomicU64::new(now_ms),
            stop,
        }
    }

    /// Never moves the clock backwards.
    pub fn touch(&self, now_ms: u64) {
        self.last_seen_ms.fetch_max(now_ms, Ordering::SeqCst);
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::SeqCst)
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms())
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Stops the session's ping timer. Repeated calls are harmless.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}
