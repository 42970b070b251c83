//! Owns every target server's connection and drives its phase machine.

mod state;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{stream, StreamExt};
use rust_mcp_schema::{CallToolResult, Tool};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::audit::{report_connection_state, ConnectionStateEvent, SharedAuditSink};
use crate::core::config::data::{is_valid_server_name, normalize_server_name};
use crate::core::config::{ConfigError, TargetServerDescriptor};
use crate::core::sync;
use crate::core::{EntityKind, GatewayError, GatewayResult};
use crate::mcp::connection::SharedTargetConnection;
use crate::mcp::factory::SharedConnectionFactory;
use crate::mcp::oauth::OAuthConnectionHandler;
use crate::mcp::transport::TransportError;
use crate::mcp::TOOL_NAMESPACE_DELIMITER;

pub use state::{TargetPhase, TargetStatus};
use state::TargetEntry;

const STARTUP_CONCURRENCY_LIMIT: usize = 3;

enum AttemptOutcome {
    Connected(SharedTargetConnection),
    PendingInput(Vec<String>),
    Failed(GatewayError),
}

struct Inner {
    factory: SharedConnectionFactory,
    oauth: OAuthConnectionHandler,
    audit: SharedAuditSink,
    entries: Mutex<HashMap<String, TargetEntry>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share the same servers.
#[derive(Clone)]
pub struct TargetConnectionManager {
    inner: Arc<Inner>,
}

impl TargetConnectionManager {
    pub fn new(
        factory: SharedConnectionFactory,
        oauth: OAuthConnectionHandler,
        audit: SharedAuditSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                oauth,
                audit,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn oauth(&self) -> &OAuthConnectionHandler {
        &self.inner.oauth
    }

    /// Registers `descriptor` in `connecting` and starts connecting it in the
    /// background.
    pub fn add_server(&self, descriptor: TargetServerDescriptor) -> GatewayResult<()> {
        let descriptor = validated(descriptor)?;
        let name = descriptor.name.clone();
        let (generation, attempt) = {
            let mut entries = sync::lock(&self.inner.entries);
            if entries.contains_key(&name) {
                return Err(GatewayError::already_exists(EntityKind::TargetServer, &name));
            }
            let generation = self.inner.next_generation();
            let attempt = self.inner.shutdown.child_token();
            entries.insert(
                name.clone(),
                TargetEntry::connecting(descriptor.clone(), generation, attempt.clone()),
            );
            (generation, attempt)
        };
        info!(server = %name, transport = descriptor.transport_label(), "Target server added");
        self.inner
            .report(&name, Some(TargetPhase::Connecting), None);
        self.inner.spawn_attempt(descriptor, generation, attempt);
        Ok(())
    }

    /// Closes the connection and forgets the server, including any pending
    /// OAuth flow.
    pub async fn remove_server(&self, name: &str) -> GatewayResult<()> {
        let name = normalize_server_name(name);
        let entry = sync::lock(&self.inner.entries)
            .remove(&name)
            .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))?;
        entry.attempt.cancel();
        self.inner.oauth.flows().remove_for_server(&name);
        if let Some(connection) = entry.connection {
            close_connection(&name, connection).await;
        }
        info!(server = %name, "Target server removed");
        self.inner.report(&name, None, None);
        Ok(())
    }

    /// Starts a new attempt for a connected, failed or input-starved server.
    pub async fn reconnect(&self, name: &str) -> GatewayResult<()> {
        self.restart(name, None).await
    }

    /// Merges `values` into the stdio environment and reconnects.
    pub async fn supply_input(
        &self,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> GatewayResult<()> {
        self.restart(name, Some(values)).await
    }

    async fn restart(
        &self,
        name: &str,
        input: Option<&BTreeMap<String, String>>,
    ) -> GatewayResult<()> {
        let name = normalize_server_name(name);
        let (descriptor, generation, attempt, previous) = {
            let mut entries = sync::lock(&self.inner.entries);
            let entry = entries
                .get_mut(&name)
                .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))?;
            let allowed = match input {
                Some(_) => entry.phase == TargetPhase::PendingInput,
                None => entry.phase.can_transition_to(TargetPhase::Connecting),
            };
            if !allowed {
                return Err(GatewayError::InvalidTransition {
                    name,
                    phase: entry.phase,
                });
            }
            if let Some(values) = input {
                entry.descriptor = entry.descriptor.with_env(values);
            }
            let previous = entry.connection.take();
            entry.attempt.cancel();
            entry.attempt = self.inner.shutdown.child_token();
            entry.generation = self.inner.next_generation();
            entry.enter(TargetPhase::Connecting);
            (
                entry.descriptor.clone(),
                entry.generation,
                entry.attempt.clone(),
                previous,
            )
        };
        if let Some(connection) = previous {
            close_connection(&name, connection).await;
        }
        info!(server = %name, "Target server reconnecting");
        self.inner.report(&name, Some(TargetPhase::Connecting), None);
        self.inner.spawn_attempt(descriptor, generation, attempt);
        Ok(())
    }

    /// Connects `descriptor` first and swaps it in only once that succeeds.
    /// On failure the previous connection is left exactly as it was.
    /// Servers still connecting or awaiting authorization are rejected.
    pub async fn update_target_server(&self, descriptor: TargetServerDescriptor) -> GatewayResult<()> {
        let descriptor = validated(descriptor)?;
        let name = descriptor.name.clone();
        let generation = {
            let entries = sync::lock(&self.inner.entries);
            let entry = entries
                .get(&name)
                .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))?;
            if !entry.phase.can_transition_to(TargetPhase::Connecting) {
                return Err(GatewayError::InvalidTransition {
                    name,
                    phase: entry.phase,
                });
            }
            entry.generation
        };

        let connection = match self.inner.factory.connect(&descriptor, None).await {
            Ok(connection) => connection,
            Err(err) if err.is_unauthorized() => {
                match self.inner.oauth.reuse_stored_tokens(&descriptor).await {
                    Some(connection) => connection,
                    None => return Err(GatewayError::connect_failed(&name, err)),
                }
            }
            Err(err) => return Err(GatewayError::connect_failed(&name, err)),
        };

        let swapped = {
            let mut entries = sync::lock(&self.inner.entries);
            match entries.get_mut(&name) {
                None => Err(GatewayError::not_found(EntityKind::TargetServer, &name)),
                Some(entry)
                    if entry.generation != generation
                        || !entry.phase.can_transition_to(TargetPhase::Connecting) =>
                {
                    Err(GatewayError::InvalidTransition {
                        name: name.clone(),
                        phase: entry.phase,
                    })
                }
                Some(entry) => {
                    entry.attempt.cancel();
                    entry.attempt = self.inner.shutdown.child_token();
                    entry.generation = self.inner.next_generation();
                    let previous = entry.connection.take();
                    entry.descriptor = descriptor;
                    entry.enter(TargetPhase::Connecting);
                    entry.connection = Some(connection.clone());
                    entry.enter(TargetPhase::Connected);
                    Ok(previous)
                }
            }
        };
        let previous = match swapped {
            Ok(previous) => previous,
            Err(err) => {
                close_connection(&name, connection).await;
                return Err(err);
            }
        };
        self.inner.oauth.flows().remove_for_server(&name);
        if let Some(previous) = previous {
            close_connection(&name, previous).await;
        }
        info!(server = %name, "Target server updated");
        self.inner
            .report(&name, Some(TargetPhase::Connecting), Some("updated".to_string()));
        self.inner
            .report(&name, Some(TargetPhase::Connected), Some("updated".to_string()));
        Ok(())
    }

    /// Adds every descriptor and waits for each to settle, with at most
    /// three connecting at once.
    pub async fn connect_all(
        &self,
        descriptors: Vec<TargetServerDescriptor>,
    ) -> Vec<(String, GatewayResult<TargetPhase>)> {
        stream::iter(descriptors)
            .map(|descriptor| async move {
                let name = normalize_server_name(&descriptor.name);
                let outcome = match self.add_server(descriptor) {
                    Ok(()) => self.wait_until_settled(&name).await,
                    Err(err) => Err(err),
                };
                (name, outcome)
            })
            .buffer_unordered(STARTUP_CONCURRENCY_LIMIT)
            .collect()
            .await
    }

    /// Resolves once the server has left `connecting`.
    pub async fn wait_until_settled(&self, name: &str) -> GatewayResult<TargetPhase> {
        let mut phases = self.subscribe(name)?;
        let settled = phases
            .wait_for(|phase| *phase != TargetPhase::Connecting)
            .await
            .map(|phase| *phase);
        settled.map_err(|_| GatewayError::not_found(EntityKind::TargetServer, name))
    }

    /// Hands an authorization code to the flow that issued `state`.
    /// Returns the server the flow belongs to.
    pub fn complete_authorization(&self, state: &str, code: &str) -> GatewayResult<String> {
        self.inner.oauth.flows().deliver_code(state, code)
    }

    /// The URL a human must open, while the server is waiting for one.
    pub fn get_authorization_url(&self, name: &str) -> GatewayResult<Option<String>> {
        let name = normalize_server_name(name);
        let entries = sync::lock(&self.inner.entries);
        let entry = entries
            .get(&name)
            .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))?;
        Ok(entry.authorization_url.clone())
    }

    /// Abandons a pending authorization; the server ends in `connection-failed`.
    pub fn cancel_authorization(&self, name: &str) -> GatewayResult<()> {
        let name = normalize_server_name(name);
        {
            let mut entries = sync::lock(&self.inner.entries);
            let entry = entries
                .get_mut(&name)
                .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))?;
            if entry.phase != TargetPhase::PendingAuth {
                return Err(GatewayError::InvalidTransition {
                    name,
                    phase: entry.phase,
                });
            }
            entry.attempt.cancel();
            entry.generation = self.inner.next_generation();
            entry.last_error = Some(GatewayError::PollingAborted.to_string());
            entry.enter(TargetPhase::ConnectionFailed);
        }
        self.inner.oauth.flows().remove_for_server(&name);
        info!(server = %name, "OAuth authorization cancelled");
        self.inner.report(
            &name,
            Some(TargetPhase::ConnectionFailed),
            Some(GatewayError::PollingAborted.to_string()),
        );
        Ok(())
    }

    pub async fn list_tools(&self, name: &str) -> GatewayResult<Vec<Tool>> {
        let (name, connection) = self.ready_connection(name)?;
        connection
            .list_tools()
            .await
            .map_err(|err| GatewayError::connect_failed(name, err))
    }

    /// Fails fast with `TargetNotReady` unless the server is connected.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> GatewayResult<CallToolResult> {
        let (name, connection) = self.ready_connection(name)?;
        debug!(server = %name, tool, "Dispatching tool call");
        connection
            .call_tool(tool, arguments)
            .await
            .map_err(|err| GatewayError::connect_failed(name, err))
    }

    fn ready_connection(&self, name: &str) -> GatewayResult<(String, SharedTargetConnection)> {
        let name = normalize_server_name(name);
        let entries = sync::lock(&self.inner.entries);
        let entry = entries
            .get(&name)
            .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))?;
        match (&entry.phase, &entry.connection) {
            (TargetPhase::Connected, Some(connection)) => Ok((name, connection.clone())),
            _ => Err(GatewayError::TargetNotReady {
                phase: entry.phase,
                name,
            }),
        }
    }

    pub fn phase(&self, name: &str) -> Option<TargetPhase> {
        sync::lock(&self.inner.entries)
            .get(&normalize_server_name(name))
            .map(|entry| entry.phase)
    }

    pub fn status(&self, name: &str) -> Option<TargetStatus> {
        sync::lock(&self.inner.entries)
            .get(&normalize_server_name(name))
            .map(TargetEntry::status)
    }

    /// Every server, ordered by name.
    pub fn snapshot(&self) -> Vec<TargetStatus> {
        let mut statuses: Vec<TargetStatus> = sync::lock(&self.inner.entries)
            .values()
            .map(TargetEntry::status)
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = sync::lock(&self.inner.entries)
            .iter()
            .filter(|(_, entry)| entry.phase == TargetPhase::Connected)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Phase updates for `name`. The channel closes when the server is removed.
    pub fn subscribe(&self, name: &str) -> GatewayResult<watch::Receiver<TargetPhase>> {
        let name = normalize_server_name(name);
        sync::lock(&self.inner.entries)
            .get(&name)
            .map(|entry| entry.phase_tx.subscribe())
            .ok_or_else(|| GatewayError::not_found(EntityKind::TargetServer, &name))
    }

    /// Cancels in-flight attempts and OAuth flows, then closes every live
    /// connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<(String, TargetEntry)> =
            sync::lock(&self.inner.entries).drain().collect();
        self.inner.oauth.flows().clear();
        for (name, entry) in drained {
            if let Some(connection) = entry.connection {
                close_connection(&name, connection).await;
            }
            self.inner.report(&name, None, Some("shutdown".to_string()));
        }
    }
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    fn report(&self, name: &str, phase: Option<TargetPhase>, detail: Option<String>) {
        report_connection_state(
            self.audit.as_ref(),
            &ConnectionStateEvent {
                server: name.to_string(),
                phase,
                detail,
            },
        );
    }

    fn spawn_attempt(
        self: &Arc<Self>,
        descriptor: TargetServerDescriptor,
        generation: u64,
        attempt: CancellationToken,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = attempt.cancelled() => {
                    debug!(server = %descriptor.name, generation, "Connection attempt cancelled");
                    return;
                }
                outcome = inner.attempt(&descriptor, generation, &attempt) => outcome,
            };
            inner.settle(&descriptor.name, generation, outcome).await;
        });
    }

    async fn attempt(
        self: &Arc<Self>,
        descriptor: &TargetServerDescriptor,
        generation: u64,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let name = descriptor.name.as_str();
        let oauth_first = descriptor.is_remote() && self.oauth.has_stored_tokens(name);
        if !oauth_first {
            match self.factory.connect(descriptor, None).await {
                Ok(connection) => return AttemptOutcome::Connected(connection),
                Err(TransportError::MissingInput { variables }) => {
                    return AttemptOutcome::PendingInput(variables);
                }
                Err(err) if err.is_unauthorized() && descriptor.is_remote() => {
                    debug!(server = name, "Target server requires OAuth");
                }
                Err(err) => {
                    return AttemptOutcome::Failed(GatewayError::connect_failed(name, err));
                }
            }
        }

        let announcer = self.clone();
        let server = name.to_string();
        let on_pending_auth = move |url: &str| announcer.enter_pending_auth(&server, generation, url);
        match self.oauth.connect(descriptor, cancel, &on_pending_auth).await {
            Ok(connection) => AttemptOutcome::Connected(connection),
            Err(err) => AttemptOutcome::Failed(err),
        }
    }

    fn enter_pending_auth(&self, name: &str, generation: u64, url: &str) {
        {
            let mut entries = sync::lock(&self.entries);
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            if entry.generation != generation
                || !entry.phase.can_transition_to(TargetPhase::PendingAuth)
            {
                return;
            }
            entry.authorization_url = Some(url.to_string());
            entry.enter(TargetPhase::PendingAuth);
        }
        info!(server = name, "Target server pending authorization");
        self.report(name, Some(TargetPhase::PendingAuth), Some(url.to_string()));
    }

    async fn settle(&self, name: &str, generation: u64, outcome: AttemptOutcome) {
        let applied = {
            let mut entries = sync::lock(&self.entries);
            match entries.get_mut(name) {
                Some(entry) if entry.generation == generation => apply_outcome(entry, outcome),
                _ => match outcome {
                    AttemptOutcome::Connected(connection) => Applied::Orphaned(connection),
                    _ => Applied::Ignored,
                },
            }
        };

        match applied {
            Applied::Changed(phase, detail) => {
                let reason = detail.as_deref().unwrap_or("");
                match phase {
                    TargetPhase::Connected => info!(server = name, "Target server connected"),
                    TargetPhase::PendingInput => {
                        warn!(server = name, detail = reason, "Target server needs input")
                    }
                    _ => warn!(server = name, error = reason, "Target server connection failed"),
                }
                self.report(name, Some(phase), detail);
            }
            Applied::Orphaned(connection) => {
                debug!(server = name, generation, "Discarding connection from a superseded attempt");
                close_connection(name, connection).await;
            }
            Applied::Ignored => {
                debug!(server = name, generation, "Ignoring outcome of a superseded attempt");
            }
        }
    }
}

enum Applied {
    Changed(TargetPhase, Option<String>),
    /// A connection that can no longer be installed; the caller closes it.
    Orphaned(SharedTargetConnection),
    Ignored,
}

fn apply_outcome(entry: &mut TargetEntry, outcome: AttemptOutcome) -> Applied {
    let (next, connection, detail, missing) = match outcome {
        AttemptOutcome::Connected(connection) => {
            (TargetPhase::Connected, Some(connection), None, Vec::new())
        }
        AttemptOutcome::PendingInput(variables) => {
            let detail = TransportError::MissingInput {
                variables: variables.clone(),
            }
            .to_string();
            (TargetPhase::PendingInput, None, Some(detail), variables)
        }
        AttemptOutcome::Failed(err) => (
            TargetPhase::ConnectionFailed,
            None,
            Some(err.to_string()),
            Vec::new(),
        ),
    };

    if !entry.phase.can_transition_to(next) {
        warn!(server = %entry.descriptor.name, from = %entry.phase, to = %next, "Rejected phase transition");
        return match connection {
            Some(connection) => Applied::Orphaned(connection),
            None => Applied::Ignored,
        };
    }

    entry.last_error = detail.clone();
    entry.missing_inputs = missing;
    entry.connection = connection;
    entry.enter(next);
    Applied::Changed(next, detail)
}

async fn close_connection(name: &str, connection: SharedTargetConnection) {
    if let Err(err) = connection.close().await {
        warn!(server = name, error = %err, "Failed to close target connection");
    }
}

fn validated(descriptor: TargetServerDescriptor) -> GatewayResult<TargetServerDescriptor> {
    if !is_valid_server_name(&descriptor.name) {
        return Err(GatewayError::Config(ConfigError::InvalidTargetServer {
            name: descriptor.name.clone(),
            reason: format!("names must be non-empty and must not contain {TOOL_NAMESPACE_DELIMITER:?}"),
        }));
    }
    Ok(descriptor.normalized())
}

#[cfg(test)]
mod tests;
