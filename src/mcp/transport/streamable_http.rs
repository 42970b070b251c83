//! Streamable HTTP transport: every message is a POST; responses arrive as
//! JSON or as a short event stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use tracing::debug;

use super::http::{
    apply_session_id_header, apply_streamable_http_client_post_headers,
    apply_streamable_http_protocol_version_header, apply_target_headers, response_content_type,
    response_session_id,
};
use super::{status_error, RpcChannel, TransportError};
use crate::core::sync;

pub struct StreamableHttpChannel {
    server: String,
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    bearer_token: Option<String>,
    request_timeout: Duration,
    session_id: Mutex<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    next_request_id: AtomicI64,
}

impl StreamableHttpChannel {
    pub fn new(
        server: &str,
        client: reqwest::Client,
        url: &str,
        headers: BTreeMap<String, String>,
        bearer_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server: server.to_string(),
            client,
            url: url.to_string(),
            headers,
            bearer_token,
            request_timeout,
            session_id: Mutex::new(None),
            protocol_version: RwLock::new(None),
            next_request_id: AtomicI64::new(0),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        sync::lock(&self.session_id).clone()
    }

    fn build_post(&self, payload: String) -> reqwest::RequestBuilder {
        let protocol_version = sync::read(&self.protocol_version).clone();
        let session_id = self.session_id();
        let request = apply_streamable_http_protocol_version_header(
            apply_streamable_http_client_post_headers(self.client.post(&self.url)),
            protocol_version.as_deref(),
        );
        let request = apply_target_headers(request, &self.headers, self.bearer_token.as_deref());
        apply_session_id_header(request, session_id.as_deref())
            .timeout(self.request_timeout)
            .body(payload)
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response, TransportError> {
        let payload =
            serde_json::to_string(message).map_err(|err| TransportError::Protocol(err.to_string()))?;
        let response = self.build_post(payload).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        if let Some(session_id) = response_session_id(&response) {
            *sync::lock(&self.session_id) = Some(session_id);
        }
        Ok(response)
    }
}

#[async_trait]
impl RpcChannel for StreamableHttpChannel {
    async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id),
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        debug!(server = %self.server, url = %self.url, "Sending streamable HTTP request");

        let response = self.post(&message).await?;
        if is_event_stream_content_type(&response_content_type(&response)) {
            next_sse_server_message(response).await
        } else {
            let body = response.bytes().await?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| TransportError::Protocol(err.to_string()))
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
        self.post(&message).await.map(|_| ())
    }

    fn set_protocol_version(&self, protocol_version: &str) {
        *sync::write(&self.protocol_version) = Some(protocol_version.to_string());
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(session_id) = sync::lock(&self.session_id).take() else {
            return Ok(());
        };
        let request = apply_target_headers(
            self.client.delete(&self.url),
            &self.headers,
            self.bearer_token.as_deref(),
        );
        // Servers may refuse session termination; the session is dropped either way.
        match apply_session_id_header(request, Some(&session_id))
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => {
                debug!(server = %self.server, status = %response.status(), "Streamable HTTP session closed");
            }
            Err(err) => {
                debug!(server = %self.server, error = %err, "Streamable HTTP session close failed");
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            // Blank lines terminate SSE events, so they are kept.
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..line_end]) {
                lines.push(text.trim().to_string());
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

pub fn sse_event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(str::trim)
}

/// Reads an event stream until the first response or error message.
pub async fn next_sse_server_message(
    response: reqwest::Response,
) -> Result<ServerMessage, TransportError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                if is_reply(&message) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            if is_reply(&message) {
                return Ok(message);
            }
        }
    }

    Err(TransportError::Protocol(
        "Empty event-stream response.".to_string(),
    ))
}

fn is_reply(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::Response(_) | ServerMessage::Error(_))
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, TransportError> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };

    if payload.is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| TransportError::Protocol(err.to_string()))
}
