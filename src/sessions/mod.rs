//! Upstream client sessions: the session table, liveness monitoring and
//! metadata derived from the initialize handshake.

pub mod liveness;
pub mod metadata;
pub mod model;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::audit::{report_session_event, SessionEvent, SessionEventKind, SharedAuditSink};
use crate::core::clock::SharedClock;
use crate::core::config::SessionsConfig;
use crate::core::sync;
use crate::core::{EntityKind, GatewayError, GatewayResult};

pub use liveness::{SessionLivenessManager, SessionLivenessStore};
use metadata::log_metadata_warnings;
pub use model::{
    ClientSession, CloseSessionReason, SessionLiveness, SessionMetadata, SessionTransport,
    SharedSessionTransport, TouchSource,
};

struct SessionRecord {
    session: ClientSession,
    liveness: Option<Arc<SessionLiveness>>,
    probe_timer: Option<CancellationToken>,
}

/// Owns every session record. The liveness manager reaches in by id.
struct SessionTable {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    audit: SharedAuditSink,
}

impl SessionTable {
    fn insert(&self, session_id: &str, session: ClientSession) -> GatewayResult<()> {
        let mut sessions = sync::lock(&self.sessions);
        if sessions.contains_key(session_id) {
            return Err(GatewayError::already_exists(EntityKind::Session, session_id));
        }
        sessions.insert(
            session_id.to_string(),
            SessionRecord {
                session,
                liveness: None,
                probe_timer: None,
            },
        );
        Ok(())
    }

    fn get(&self, session_id: &str) -> Option<ClientSession> {
        sync::lock(&self.sessions)
            .get(session_id)
            .map(|record| record.session.clone())
    }

    fn report(
        &self,
        session_id: &str,
        metadata: &SessionMetadata,
        kind: SessionEventKind,
        reason: Option<CloseSessionReason>,
    ) {
        if metadata.is_probe {
            return;
        }
        report_session_event(
            self.audit.as_ref(),
            &SessionEvent {
                session_id: session_id.to_string(),
                client_id: metadata.client_id.clone(),
                client_name: metadata.client_info.name.clone(),
                kind,
                reason: reason.map(|reason| reason.to_string()),
            },
        );
    }
}

#[async_trait]
impl SessionLivenessStore for SessionTable {
    fn session_ids(&self) -> Vec<String> {
        sync::lock(&self.sessions).keys().cloned().collect()
    }

    fn metadata(&self, session_id: &str) -> Option<SessionMetadata> {
        sync::lock(&self.sessions)
            .get(session_id)
            .map(|record| record.session.metadata.clone())
    }

    fn transport(&self, session_id: &str) -> Option<SharedSessionTransport> {
        sync::lock(&self.sessions)
            .get(session_id)
            .map(|record| record.session.transport.clone())
    }

    fn liveness(&self, session_id: &str) -> Option<Arc<SessionLiveness>> {
        sync::lock(&self.sessions)
            .get(session_id)
            .and_then(|record| record.liveness.clone())
    }

    fn attach_liveness(&self, session_id: &str, liveness: Arc<SessionLiveness>) -> bool {
        match sync::lock(&self.sessions).get_mut(session_id) {
            Some(record) => {
                if let Some(previous) = record.liveness.replace(liveness) {
                    previous.stop();
                }
                true
            }
            None => false,
        }
    }

    fn detach_liveness(&self, session_id: &str) -> Option<Arc<SessionLiveness>> {
        sync::lock(&self.sessions)
            .get_mut(session_id)
            .and_then(|record| record.liveness.take())
    }

    fn attach_probe_timer(&self, session_id: &str, stop: CancellationToken) -> bool {
        match sync::lock(&self.sessions).get_mut(session_id) {
            Some(record) => {
                if let Some(previous) = record.probe_timer.replace(stop) {
                    previous.cancel();
                }
                true
            }
            None => false,
        }
    }

    async fn close_session(&self, session_id: &str, reason: CloseSessionReason) {
        let removed = sync::lock(&self.sessions).remove(session_id);
        let Some(record) = removed else {
            return;
        };
        if let Some(liveness) = &record.liveness {
            liveness.stop();
        }
        if let Some(probe_timer) = &record.probe_timer {
            probe_timer.cancel();
        }
        if let Err(err) = record.session.transport.close().await {
            debug!(session_id, error = %err, "Error closing session transport");
        }
        info!(session_id, reason = %reason, "Session closed");
        self.report(
            session_id,
            &record.session.metadata,
            SessionEventKind::Closed,
            Some(reason),
        );
    }
}

/// Registry of connected agent sessions.
pub struct SessionsManager {
    table: Arc<SessionTable>,
    liveness: SessionLivenessManager,
}

impl SessionsManager {
    pub fn new(config: SessionsConfig, clock: SharedClock, audit: SharedAuditSink) -> Self {
        let table = Arc::new(SessionTable {
            sessions: Mutex::new(HashMap::new()),
            audit,
        });
        let store: Arc<dyn SessionLivenessStore> = table.clone();
        Self {
            liveness: SessionLivenessManager::new(store, config, clock),
            table,
        }
    }

    /// Starts idle collection. Repeated calls are ignored.
    pub fn start(&self) {
        self.liveness.start();
    }

    pub fn liveness(&self) -> &SessionLivenessManager {
        &self.liveness
    }

    pub fn add_session(&self, session_id: &str, session: ClientSession) -> GatewayResult<()> {
        let metadata = session.metadata.clone();
        self.table.insert(session_id, session)?;
        log_metadata_warnings(&metadata, session_id);
        info!(
            session_id,
            client = metadata.client_info.name.as_deref().unwrap_or("-"),
            consumer = metadata.consumer_tag.as_deref().unwrap_or("-"),
            probe = metadata.is_probe,
            "Session opened"
        );
        self.table
            .report(session_id, &metadata, SessionEventKind::Opened, None);
        self.liveness.on_session_added(session_id);
        Ok(())
    }

    /// Closes any session already registered under `session_id`, then adds
    /// the new one.
    pub async fn replace_session(
        &self,
        session_id: &str,
        session: ClientSession,
    ) -> GatewayResult<()> {
        self.close_session(session_id, CloseSessionReason::Replaced).await;
        self.add_session(session_id, session)
    }

    /// Unknown ids are ignored.
    pub async fn close_session(&self, session_id: &str, reason: CloseSessionReason) {
        self.liveness.on_session_removed(session_id);
        self.table.close_session(session_id, reason).await;
    }

    pub fn touch_session(&self, session_id: &str, source: TouchSource) {
        self.liveness.touch_session(session_id, source);
    }

    pub fn get(&self, session_id: &str) -> Option<ClientSession> {
        self.table.get(session_id)
    }

    pub fn list(&self) -> Vec<(String, SessionMetadata)> {
        let mut sessions: Vec<_> = sync::lock(&self.table.sessions)
            .iter()
            .map(|(id, record)| (id.clone(), record.session.metadata.clone()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.table.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consumer_tag(&self, session_id: &str) -> Option<String> {
        sync::lock(&self.table.sessions)
            .get(session_id)
            .and_then(|record| record.session.metadata.consumer_tag.clone())
    }

    /// Stops all timers and closes every session. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.liveness.shutdown();
        let session_ids = self.table.session_ids();
        if !session_ids.is_empty() {
            debug!(count = session_ids.len(), "Closing sessions for shutdown");
        }
        for session_id in session_ids {
            self.table
                .close_session(&session_id, CloseSessionReason::Shutdown)
                .await;
        }
    }
}
