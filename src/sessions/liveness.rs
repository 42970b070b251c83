//! Idle collection, per-session pings and probe-client termination.
//!
//! Liveness records live inside the sessions table; this manager only
//! reaches them through [`SessionLivenessStore`] lookups by session id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::model::{
    CloseSessionReason, SessionLiveness, SessionMetadata, SharedSessionTransport, TouchSource,
};
use crate::core::clock::SharedClock;
use crate::core::config::SessionsConfig;
use crate::core::sync;

/// A ping must settle within this share of the ping interval.
pub const PING_TIMEOUT_FACTOR: f64 = 0.8;

/// Session lookups the liveness manager needs.
#[async_trait]
pub trait SessionLivenessStore: Send + Sync {
    fn session_ids(&self) -> Vec<String>;

    fn metadata(&self, session_id: &str) -> Option<SessionMetadata>;

    fn transport(&self, session_id: &str) -> Option<SharedSessionTransport>;

    fn liveness(&self, session_id: &str) -> Option<Arc<SessionLiveness>>;

    /// Returns false when the session is gone.
    fn attach_liveness(&self, session_id: &str, liveness: Arc<SessionLiveness>) -> bool;

    fn detach_liveness(&self, session_id: &str) -> Option<Arc<SessionLiveness>>;

    /// Ties a probe grace timer to the session so closing it cancels the
    /// timer. Returns false when the session is gone.
    fn attach_probe_timer(&self, session_id: &str, stop: CancellationToken) -> bool;

    async fn close_session(&self, session_id: &str, reason: CloseSessionReason);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PingOutcome {
    Success,
    Failure(String),
    Timeout,
}

pub fn ping_timeout(ping_interval: Duration) -> Duration {
    ping_interval.mul_f64(PING_TIMEOUT_FACTOR)
}

pub struct SessionLivenessManager {
    store: Arc<dyn SessionLivenessStore>,
    config: SessionsConfig,
    clock: SharedClock,
    /// Parent of every timer this manager starts; replaced on shutdown.
    timers: Mutex<CancellationToken>,
    gc: Mutex<Option<CancellationToken>>,
}

impl SessionLivenessManager {
    pub fn new(
        store: Arc<dyn SessionLivenessStore>,
        config: SessionsConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            timers: Mutex::new(CancellationToken::new()),
            gc: Mutex::new(None),
        }
    }

    fn ttl(&self) -> Option<Duration> {
        (self.config.idle_ttl_ms > 0).then(|| Duration::from_millis(self.config.idle_ttl_ms))
    }

    fn timer_token(&self) -> CancellationToken {
        sync::lock(&self.timers).child_token()
    }

    /// Starts the idle sweep. A second call before `shutdown` does nothing.
    pub fn start(&self) {
        let mut gc = sync::lock(&self.gc);
        if gc.is_some() {
            return;
        }
        let Some(ttl) = self.ttl() else {
            debug!("Session GC disabled");
            return;
        };
        let sweep = Duration::from_millis(self.config.effective_sweep_interval_ms());
        if sweep.is_zero() {
            debug!("Session GC disabled by sweep interval");
            return;
        }

        let stop = self.timer_token();
        *gc = Some(stop.clone());
        let store = self.store.clone();
        let clock = self.clock.clone();
        debug!(ttl_ms = self.config.idle_ttl_ms, sweep_ms = sweep.as_millis() as u64, "Session GC started");
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + sweep, sweep);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => sweep_idle_sessions(store.as_ref(), clock.now_ms(), ttl).await,
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        sync::lock(&self.gc).is_some()
    }

    /// Stops the sweep and every per-session timer. Safe to repeat.
    pub fn shutdown(&self) {
        if let Some(gc) = sync::lock(&self.gc).take() {
            gc.cancel();
        }
        {
            let mut timers = sync::lock(&self.timers);
            timers.cancel();
            *timers = CancellationToken::new();
        }
        for session_id in self.store.session_ids() {
            self.stop_session_liveness(&session_id);
        }
    }

    /// Records activity for `session_id`. Unknown or unmonitored sessions
    /// are ignored.
    pub fn touch_session(&self, session_id: &str, source: TouchSource) {
        if let Some(liveness) = self.store.liveness(session_id) {
            liveness.touch(self.clock.now_ms());
            trace!(session_id, ?source, "Session liveness touch");
        }
    }

    pub fn on_session_added(&self, session_id: &str) {
        let Some(metadata) = self.store.metadata(session_id) else {
            return;
        };
        if metadata.is_probe {
            self.schedule_probe_termination(session_id);
        }
        if self.ttl().is_none() {
            return;
        }

        let liveness = Arc::new(SessionLiveness::new(self.clock.now_ms(), self.timer_token()));
        if !self.store.attach_liveness(session_id, liveness.clone()) {
            liveness.stop();
            return;
        }
        if let Some(interval) = self.ping_interval_for(session_id, &metadata) {
            self.spawn_ping_monitor(session_id, interval, liveness.stop_token().clone());
        }
    }

    pub fn on_session_removed(&self, session_id: &str) {
        self.stop_session_liveness(session_id);
    }

    fn stop_session_liveness(&self, session_id: &str) {
        if let Some(liveness) = self.store.detach_liveness(session_id) {
            liveness.stop();
            debug!(session_id, "Stopped liveness monitoring");
        }
    }

    fn ping_interval_for(&self, session_id: &str, metadata: &SessionMetadata) -> Option<Duration> {
        if !metadata.supports_ping() {
            info!(session_id, client = metadata.client_info.name.as_deref().unwrap_or("-"), "Client adapter does not support ping, skipping ping monitoring");
            return None;
        }
        if self.config.ping_interval_ms == 0 {
            info!(session_id, "Ping monitoring disabled by interval");
            return None;
        }
        Some(Duration::from_millis(self.config.ping_interval_ms))
    }

    fn spawn_ping_monitor(&self, session_id: &str, interval: Duration, stop: CancellationToken) {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let session_id = session_id.to_string();
        let timeout = ping_timeout(interval);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            // A tick that lands while a ping is outstanding is dropped.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(transport) = store.transport(&session_id) else {
                    break;
                };
                let outcome = tokio::select! {
                    _ = stop.cancelled() => break,
                    outcome = ping_with_timeout(&transport, timeout) => outcome,
                };
                match outcome {
                    PingOutcome::Success => {
                        if let Some(liveness) = store.liveness(&session_id) {
                            liveness.touch(clock.now_ms());
                        }
                        trace!(session_id = %session_id, "Ping successful");
                    }
                    PingOutcome::Failure(error) => {
                        debug!(session_id = %session_id, error = %error, "Ping failed");
                    }
                    PingOutcome::Timeout => {
                        trace!(session_id = %session_id, timeout_ms = timeout.as_millis() as u64, "Ping timed out");
                    }
                }
            }
            debug!(session_id = %session_id, "Ping monitoring stopped");
        });
    }

    fn schedule_probe_termination(&self, session_id: &str) {
        let store = self.store.clone();
        let session_id = session_id.to_string();
        let grace = Duration::from_millis(self.config.probe_grace_ms);
        let stop = self.timer_token();
        if !store.attach_probe_timer(&session_id, stop.clone()) {
            stop.cancel();
            return;
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    debug!(session_id = %session_id, "Closing probe session after grace period");
                    store.close_session(&session_id, CloseSessionReason::ProbeTermination).await;
                }
            }
        });
    }
}

pub async fn ping_with_timeout(transport: &SharedSessionTransport, timeout: Duration) -> PingOutcome {
    match tokio::time::timeout(timeout, transport.ping()).await {
        Ok(Ok(())) => PingOutcome::Success,
        Ok(Err(err)) => PingOutcome::Failure(err.to_string()),
        Err(_) => PingOutcome::Timeout,
    }
}

async fn sweep_idle_sessions(store: &dyn SessionLivenessStore, now_ms: u64, ttl: Duration) {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    for session_id in store.session_ids() {
        let Some(liveness) = store.liveness(&session_id) else {
            continue;
        };
        let idle_ms = liveness.idle_ms(now_ms);
        if idle_ms <= ttl_ms {
            continue;
        }
        debug!(session_id = %session_id, idle_ms, ttl_ms, "Session idle TTL exceeded, closing session");
        store
            .close_session(&session_id, CloseSessionReason::IdleTtlExceeded)
            .await;
    }
}
