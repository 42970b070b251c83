//! Legacy HTTP+SSE transport: a long-lived GET stream carries server
//! messages, and the first `endpoint` event names the URL to POST to.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::{apply_target_headers, MCP_EVENT_STREAM_ACCEPT, MCP_JSON_CONTENT_TYPE};
use super::streamable_http::{sse_data_payload, sse_event_name, SseLineBuffer};
use super::{status_error, RpcChannel, TransportError};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Folds SSE lines into events; a blank line dispatches.
#[derive(Default)]
pub struct SseEventAssembler {
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventAssembler {
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(name) = sse_event_name(line) {
            self.event = Some(name.to_string());
        } else if let Some(data) = sse_data_payload(line) {
            self.data.push(data.to_string());
        }
        None
    }

    pub fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

pub struct SseChannel {
    server: String,
    client: reqwest::Client,
    endpoint: reqwest::Url,
    headers: BTreeMap<String, String>,
    bearer_token: Option<String>,
    request_timeout: Duration,
    pending: PendingMap,
    next_request_id: AtomicI64,
    shutdown: CancellationToken,
}

impl SseChannel {
    pub async fn connect(
        server: &str,
        client: reqwest::Client,
        url: &str,
        headers: BTreeMap<String, String>,
        bearer_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let base = reqwest::Url::parse(url)
            .map_err(|err| TransportError::InvalidDescriptor(format!("{url}: {err}")))?;
        let request = apply_target_headers(
            client.get(base.clone()).header("Accept", MCP_EVENT_STREAM_ACCEPT),
            &headers,
            bearer_token.as_deref(),
        );
        let response = tokio::time::timeout(request_timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "SSE connect",
            })??;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        Self::spawn_stream_reader(
            server.to_string(),
            response,
            base,
            pending.clone(),
            endpoint_tx,
            shutdown.clone(),
        );

        let endpoint = match tokio::time::timeout(request_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                shutdown.cancel();
                return Err(TransportError::Closed);
            }
            Err(_) => {
                shutdown.cancel();
                return Err(TransportError::Timeout {
                    operation: "SSE endpoint event",
                });
            }
        };
        debug!(server, endpoint = %endpoint, "SSE endpoint received");

        Ok(Arc::new(Self {
            server: server.to_string(),
            client,
            endpoint,
            headers,
            bearer_token,
            request_timeout,
            pending,
            next_request_id: AtomicI64::new(0),
            shutdown,
        }))
    }

    fn spawn_stream_reader(
        server: String,
        response: reqwest::Response,
        base: reqwest::Url,
        pending: PendingMap,
        endpoint_tx: oneshot::Sender<reqwest::Url>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();
            let mut assembler = SseEventAssembler::default();
            let mut endpoint_tx = Some(endpoint_tx);

            loop {
                let chunk = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) => {
                        warn!(server = %server, error = %err, "SSE stream failed");
                        break;
                    }
                    None => break,
                };
                for line in lines.push(&chunk) {
                    let Some(event) = assembler.push_line(&line) else {
                        continue;
                    };
                    Self::handle_event(&server, &base, &pending, &mut endpoint_tx, event).await;
                }
            }
            debug!(server = %server, "SSE stream ended");
            pending.lock().await.clear();
        });
    }

    async fn handle_event(
        server: &str,
        base: &reqwest::Url,
        pending: &PendingMap,
        endpoint_tx: &mut Option<oneshot::Sender<reqwest::Url>>,
        event: SseEvent,
    ) {
        if event.event == "endpoint" {
            match base.join(event.data.trim()) {
                Ok(endpoint) => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(endpoint);
                    }
                }
                Err(err) => warn!(server, error = %err, "Invalid SSE endpoint"),
            }
            return;
        }

        let message = match serde_json::from_str::<ServerMessage>(&event.data) {
            Ok(message) => message,
            Err(err) => {
                debug!(server, error = %err, "Skipping undecodable SSE message");
                return;
            }
        };
        let id = match &message {
            ServerMessage::Response(response) => Some(response.id.clone()),
            ServerMessage::Error(error) => error.id.clone(),
            ServerMessage::Request(_) | ServerMessage::Notification(_) => None,
        };
        if let Some(id) = id {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(message);
            }
        }
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(message).map_err(|err| TransportError::Protocol(err.to_string()))?;
        let request = apply_target_headers(
            self.client
                .post(self.endpoint.clone())
                .header("Content-Type", MCP_JSON_CONTENT_TYPE),
            &self.headers,
            self.bearer_token.as_deref(),
        );
        let response = request
            .timeout(self.request_timeout)
            .body(payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for SseChannel {
    async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        if let Err(err) = self.post(&message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }
        debug!(server = %self.server, request_id = ?request_id, "SSE request posted");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout {
                    operation: "SSE request",
                })
            }
        }
    }

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), TransportError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.post(&message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }
}
