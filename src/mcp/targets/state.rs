use std::fmt;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::config::TargetServerDescriptor;
use crate::mcp::connection::SharedTargetConnection;

/// Connection phase of one target server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetPhase {
    Connecting,
    Connected,
    PendingAuth,
    PendingInput,
    ConnectionFailed,
}

impl TargetPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetPhase::Connecting => "connecting",
            TargetPhase::Connected => "connected",
            TargetPhase::PendingAuth => "pending-auth",
            TargetPhase::PendingInput => "pending-input",
            TargetPhase::ConnectionFailed => "connection-failed",
        }
    }

    /// Edges of the per-server state machine.
    pub fn can_transition_to(self, next: TargetPhase) -> bool {
        use TargetPhase::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, PendingAuth)
                | (Connecting, PendingInput)
                | (Connecting, ConnectionFailed)
                | (PendingAuth, Connected)
                | (PendingAuth, ConnectionFailed)
                | (PendingInput, Connecting)
                | (Connected, Connecting)
                | (ConnectionFailed, Connecting)
        )
    }
}

impl fmt::Display for TargetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one target server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub name: String,
    pub transport: &'static str,
    pub phase: TargetPhase,
    pub last_error: Option<String>,
    pub authorization_url: Option<String>,
    pub missing_inputs: Vec<String>,
}

pub(super) struct TargetEntry {
    pub descriptor: TargetServerDescriptor,
    pub phase: TargetPhase,
    pub connection: Option<SharedTargetConnection>,
    pub last_error: Option<String>,
    pub authorization_url: Option<String>,
    pub missing_inputs: Vec<String>,
    /// Bumped for every attempt; results of older attempts are discarded.
    pub generation: u64,
    pub attempt: CancellationToken,
    pub phase_tx: watch::Sender<TargetPhase>,
}

impl TargetEntry {
    pub fn connecting(
        descriptor: TargetServerDescriptor,
        generation: u64,
        attempt: CancellationToken,
    ) -> Self {
        let (phase_tx, _) = watch::channel(TargetPhase::Connecting);
        Self {
            descriptor,
            phase: TargetPhase::Connecting,
            connection: None,
            last_error: None,
            authorization_url: None,
            missing_inputs: Vec::new(),
            generation,
            attempt,
            phase_tx,
        }
    }

    /// Moves to `next` and clears whatever only belonged to the old phase.
    pub fn enter(&mut self, next: TargetPhase) {
        self.phase = next;
        if next != TargetPhase::Connected {
            self.connection = None;
        }
        if next != TargetPhase::PendingAuth {
            self.authorization_url = None;
        }
        if next != TargetPhase::PendingInput {
            self.missing_inputs.clear();
        }
        if !matches!(next, TargetPhase::ConnectionFailed | TargetPhase::PendingInput) {
            self.last_error = None;
        }
        self.phase_tx.send_replace(next);
    }

    pub fn status(&self) -> TargetStatus {
        TargetStatus {
            name: self.descriptor.name.clone(),
            transport: self.descriptor.transport_label(),
            phase: self.phase,
            last_error: self.last_error.clone(),
            authorization_url: self.authorization_url.clone(),
            missing_inputs: self.missing_inputs.clone(),
        }
    }
}
