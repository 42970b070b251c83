//! Fire-and-forget notifications about tool calls, target connections and
//! client sessions.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::mcp::targets::TargetPhase;

#[derive(Debug, Error)]
#[error("audit sink failure: {0}")]
pub struct AuditError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallOutcome {
    Success,
    ToolError,
    Denied,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ToolCallEvent {
    pub session_id: Option<String>,
    pub consumer_tag: Option<String>,
    pub service: String,
    pub tool: String,
    pub outcome: ToolCallOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateEvent {
    pub server: String,
    pub phase: Option<TargetPhase>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Opened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub kind: SessionEventKind,
    pub reason: Option<String>,
}

pub trait AuditSink: Send + Sync {
    fn tool_call(&self, event: &ToolCallEvent) -> Result<(), AuditError>;
    fn connection_state_changed(&self, event: &ConnectionStateEvent) -> Result<(), AuditError>;
    fn session_event(&self, event: &SessionEvent) -> Result<(), AuditError>;
}

pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Records every notification as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn tool_call(&self, event: &ToolCallEvent) -> Result<(), AuditError> {
        info!(
            target: "gatehouse::audit",
            session_id = event.session_id.as_deref().unwrap_or("-"),
            consumer = event.consumer_tag.as_deref().unwrap_or("-"),
            service = %event.service,
            tool = %event.tool,
            outcome = ?event.outcome,
            duration_ms = event.duration_ms,
            "tool call"
        );
        Ok(())
    }

    fn connection_state_changed(&self, event: &ConnectionStateEvent) -> Result<(), AuditError> {
        let phase = event
            .phase
            .map(|phase| phase.to_string())
            .unwrap_or_else(|| "removed".to_string());
        info!(
            target: "gatehouse::audit",
            server = %event.server,
            phase = %phase,
            detail = event.detail.as_deref().unwrap_or(""),
            "target server state changed"
        );
        Ok(())
    }

    fn session_event(&self, event: &SessionEvent) -> Result<(), AuditError> {
        info!(
            target: "gatehouse::audit",
            session_id = %event.session_id,
            client_id = %event.client_id,
            client = event.client_name.as_deref().unwrap_or("-"),
            kind = ?event.kind,
            reason = event.reason.as_deref().unwrap_or(""),
            "client session event"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn tool_call(&self, _event: &ToolCallEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn connection_state_changed(&self, _event: &ConnectionStateEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn session_event(&self, _event: &SessionEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

pub fn report_tool_call(sink: &dyn AuditSink, event: &ToolCallEvent) {
    if let Err(err) = sink.tool_call(event) {
        warn!(service = %event.service, tool = %event.tool, error = %err, "Audit sink rejected tool call event");
    }
}

pub fn report_connection_state(sink: &dyn AuditSink, event: &ConnectionStateEvent) {
    if let Err(err) = sink.connection_state_changed(event) {
        warn!(server = %event.server, error = %err, "Audit sink rejected connection event");
    }
}

pub fn report_session_event(sink: &dyn AuditSink, event: &SessionEvent) {
    if let Err(err) = sink.session_event(event) {
        warn!(session_id = %event.session_id, error = %err, "Audit sink rejected session event");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures events; optionally fails every call after recording it.
    #[derive(Default)]
    pub struct RecordingAuditSink {
        pub fail: bool,
        pub tool_calls: Mutex<Vec<ToolCallEvent>>,
        pub connection_events: Mutex<Vec<ConnectionStateEvent>>,
        pub session_events: Mutex<Vec<SessionEvent>>,
    }

    impl RecordingAuditSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn result(&self) -> Result<(), AuditError> {
            if self.fail {
                Err(AuditError("sink offline".to_string()))
            } else {
                Ok(())
            }
        }

        pub fn phases_for(&self, server: &str) -> Vec<Option<TargetPhase>> {
            self.connection_events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| event.server == server)
                .map(|event| event.phase)
                .collect()
        }
    }

    impl AuditSink for RecordingAuditSink {
        fn tool_call(&self, event: &ToolCallEvent) -> Result<(), AuditError> {
            self.tool_calls.lock().unwrap().push(event.clone());
            self.result()
        }

        fn connection_state_changed(&self, event: &ConnectionStateEvent) -> Result<(), AuditError> {
            self.connection_events.lock().unwrap().push(event.clone());
            self.result()
        }

        fn session_event(&self, event: &SessionEvent) -> Result<(), AuditError> {
            self.session_events.lock().unwrap().push(event.clone());
            self.result()
        }
    }
}
