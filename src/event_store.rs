//! Bounded per-stream event log backing resumable streamable-HTTP responses.
//!
//! Events are appended per stream and evicted from the oldest end, by age
//! before every append and replay, and by count after every append. A
//! reverse index resolves an event id to its stream for `Last-Event-ID`
//! resumption.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::clock::SharedClock;
use crate::core::config::EventStoreConfig;
use crate::core::sync;
use crate::core::{GatewayError, GatewayResult};

/// How many evicted ids are remembered so a late resume can be told the id
/// expired rather than that it never existed.
const EVICTED_ID_MEMORY: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredEvent {
    id: String,
    payload: Value,
    stored_at_ms: u64,
}

#[derive(Debug, Default)]
struct EventLog {
    streams: HashMap<String, VecDeque<StoredEvent>>,
    stream_by_event: HashMap<String, String>,
    evicted: HashSet<String>,
    evicted_order: VecDeque<String>,
}

impl EventLog {
    fn forget(&mut self, event_id: String) {
        self.stream_by_event.remove(&event_id);
        if self.evicted.insert(event_id.clone()) {
            self.evicted_order.push_back(event_id);
        }
        while self.evicted_order.len() > EVICTED_ID_MEMORY {
            if let Some(oldest) = self.evicted_order.pop_front() {
                self.evicted.remove(&oldest);
            }
        }
    }

    fn evict_expired(&mut self, stream_id: &str, now_ms: u64, max_age_ms: u64) {
        if max_age_ms == 0 {
            return;
        }
        let cutoff = now_ms.saturating_sub(max_age_ms);
        let mut expired = Vec::new();
        if let Some(events) = self.streams.get_mut(stream_id) {
            while events
                .front()
                .is_some_and(|event| event.stored_at_ms < cutoff)
            {
                if let Some(event) = events.pop_front() {
                    expired.push(event.id);
                }
            }
            if events.is_empty() {
                self.streams.remove(stream_id);
            }
        }
        if !expired.is_empty() {
            trace!(stream_id, count = expired.len(), "Evicted expired events");
        }
        for event_id in expired {
            self.forget(event_id);
        }
    }

    fn enforce_cap(&mut self, stream_id: &str, max_events: usize) {
        if max_events == 0 {
            return;
        }
        let mut dropped = Vec::new();
        if let Some(events) = self.streams.get_mut(stream_id) {
            while events.len() > max_events {
                if let Some(event) = events.pop_front() {
                    dropped.push(event.id);
                }
            }
        }
        for event_id in dropped {
            self.forget(event_id);
        }
    }

    /// Resolves the owning stream, distinguishing unknown ids from evicted
    /// ones.
    fn owning_stream(&self, event_id: &str) -> GatewayResult<String> {
        match self.stream_by_event.get(event_id) {
            Some(stream_id) => Ok(stream_id.clone()),
            None if self.evicted.contains(event_id) => Err(GatewayError::LastEventIdExpired {
                event_id: event_id.to_string(),
            }),
            None => Err(GatewayError::InvalidLastEventId {
                event_id: event_id.to_string(),
            }),
        }
    }
}

pub struct InMemoryEventStore {
    config: EventStoreConfig,
    clock: SharedClock,
    log: Mutex<EventLog>,
}

impl InMemoryEventStore {
    pub fn new(config: &EventStoreConfig, clock: SharedClock) -> Self {
        Self {
            config: config.clone(),
            clock,
            log: Mutex::new(EventLog::default()),
        }
    }

    /// Appends `payload` to `stream_id` and returns the new event id.
    pub fn store_event(&self, stream_id: &str, payload: Value) -> String {
        let now_ms = self.clock.now_ms();
        let event_id = Uuid::new_v4().to_string();
        let mut log = sync::lock(&self.log);
        log.evict_expired(stream_id, now_ms, self.config.max_event_age_ms);
        log.streams
            .entry(stream_id.to_string())
            .or_default()
            .push_back(StoredEvent {
                id: event_id.clone(),
                payload,
                stored_at_ms: now_ms,
            });
        log.stream_by_event
            .insert(event_id.clone(), stream_id.to_string());
        log.enforce_cap(stream_id, self.config.max_events_per_stream);
        event_id
    }

    pub fn stream_id_for_event_id(&self, event_id: &str) -> Option<String> {
        sync::lock(&self.log).stream_by_event.get(event_id).cloned()
    }

    pub fn stream_len(&self, stream_id: &str) -> usize {
        sync::lock(&self.log)
            .streams
            .get(stream_id)
            .map_or(0, VecDeque::len)
    }

    /// Streams currently holding at least one event.
    pub fn stream_count(&self) -> usize {
        sync::lock(&self.log).streams.len()
    }

    /// Sends every event stored after `last_event_id`, in order, and returns
    /// the stream it belongs to. `send` runs without the store locked.
    pub async fn replay_events_after<F, Fut>(
        &self,
        last_event_id: &str,
        send: F,
    ) -> GatewayResult<String>
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.replay(None, last_event_id, send).await
    }

    /// Like [`Self::replay_events_after`], but rejects ids that belong to a
    /// different stream.
    pub async fn replay_stream_events_after<F, Fut>(
        &self,
        stream_id: &str,
        last_event_id: &str,
        send: F,
    ) -> GatewayResult<String>
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.replay(Some(stream_id), last_event_id, send).await
    }

    async fn replay<F, Fut>(
        &self,
        expected_stream: Option<&str>,
        last_event_id: &str,
        mut send: F,
    ) -> GatewayResult<String>
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = ()>,
    {
        let (stream_id, pending) = {
            let mut log = sync::lock(&self.log);
            let stream_id = log.owning_stream(last_event_id)?;
            if expected_stream.is_some_and(|expected| expected != stream_id) {
                debug!(
                    event_id = last_event_id,
                    stream_id = %stream_id,
                    "Last-Event-ID belongs to another stream"
                );
                return Err(GatewayError::InvalidLastEventId {
                    event_id: last_event_id.to_string(),
                });
            }

            log.evict_expired(&stream_id, self.clock.now_ms(), self.config.max_event_age_ms);
            let events = log.streams.get(&stream_id);
            let position = events
                .and_then(|events| events.iter().position(|event| event.id == last_event_id))
                .ok_or_else(|| GatewayError::LastEventIdExpired {
                    event_id: last_event_id.to_string(),
                })?;
            let pending: Vec<_> = events
                .into_iter()
                .flatten()
                .skip(position + 1)
                .map(|event| (event.id.clone(), event.payload.clone()))
                .collect();
            (stream_id, pending)
        };

        debug!(stream_id = %stream_id, count = pending.len(), "Replaying events");
        for (event_id, payload) in pending {
            send(event_id, payload).await;
        }
        Ok(stream_id)
    }

    /// Drops a finished stream. Its ids stop resolving.
    pub fn remove_stream(&self, stream_id: &str) {
        let mut log = sync::lock(&self.log);
        if let Some(events) = log.streams.remove(stream_id) {
            for event in events {
                log.stream_by_event.remove(&event.id);
            }
        }
    }
}
