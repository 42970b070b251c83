//! Child-process transport: newline-delimited JSON-RPC over stdin/stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::RequestId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{RpcChannel, TransportError};

const STDIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

/// What to launch for a stdio target server, with the environment already
/// resolved to literal values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

pub struct StdioChannel {
    server: String,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    activity_notify: Arc<Notify>,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl StdioChannel {
    pub fn spawn(
        server: &str,
        launch: &StdioLaunch,
        request_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        debug!(server, command = %launch.command, args = ?launch.args, "Starting stdio target server");
        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(&launch.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            message: format!("failed to start '{}'", launch.command),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("Unable to retrieve stdin.".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("Unable to retrieve stdout.".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Protocol("Unable to retrieve stderr.".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let channel = Arc::new(Self {
            server: server.to_string(),
            stdin: Mutex::new(stdin),
            pending: pending.clone(),
            next_request_id: AtomicI64::new(0),
            activity_notify: Arc::new(Notify::new()),
            request_timeout,
            shutdown: CancellationToken::new(),
        });

        Self::spawn_stdout_reader(
            pending.clone(),
            stdout,
            channel.server.clone(),
            channel.activity_notify.clone(),
        );
        Self::spawn_stderr_drain(stderr, channel.server.clone());

        let shutdown = channel.shutdown.clone();
        let server = channel.server.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(server = %server, status = ?status, "Stdio target server exited");
                }
                _ = shutdown.cancelled() => {
                    if let Err(err) = child.kill().await {
                        warn!(server = %server, error = %err, "Failed to stop stdio target server");
                    }
                }
            }
            // Dropping the senders wakes every waiter with a closed channel.
            pending.lock().await.clear();
        });

        Ok(channel)
    }

    fn spawn_stdout_reader(
        pending: PendingMap,
        stdout: tokio::process::ChildStdout,
        server: String,
        activity_notify: Arc<Notify>,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            Self::dispatch_message(&pending, message, &server, &activity_notify)
                                .await;
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    Self::dispatch_message(&pending, message, &server, &activity_notify).await;
                }
            }
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, server: String) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server = %server, "stderr: {line}");
            }
        });
    }

    async fn dispatch_message(
        pending: &PendingMap,
        message: ServerMessage,
        server: &str,
        activity_notify: &Notify,
    ) {
        match &message {
            ServerMessage::Response(response) => {
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(server, error_id = ?error.id, code = error.error.code, "Received stdio error");
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                debug!(server, method = %request.method(), "Ignoring server-initiated request");
                activity_notify.notify_waiters();
            }
            ServerMessage::Notification(_) => {
                activity_notify.notify_waiters();
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_line(&self, payload: &str) -> Result<(), TransportError> {
        let mut stdin = tokio::time::timeout(STDIN_LOCK_TIMEOUT, self.stdin.lock())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "stdin lock",
            })?;
        let write_timeout = |_| TransportError::Timeout {
            operation: "stdin write",
        };
        let io_error = |err: std::io::Error| {
            debug!(server = %self.server, error = %err, "stdin write failed");
            TransportError::Closed
        };
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, stdin.write_all(payload.as_bytes()))
            .await
            .map_err(write_timeout)?
            .map_err(io_error)?;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, stdin.write_all(b"\n"))
            .await
            .map_err(write_timeout)?
            .map_err(io_error)?;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, stdin.flush())
            .await
            .map_err(write_timeout)?
            .map_err(io_error)
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn send_request(
        &self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| TransportError::Protocol(err.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }
        debug!(server = %self.server, request_id = ?request_id, "Stdio request sent");

        // Server notifications count as progress and push the deadline out.
        let mut deadline = tokio::time::Instant::now() + self.request_timeout;
        loop {
            tokio::select! {
                result = &mut rx => {
                    return result.map_err(|_| TransportError::Closed);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.pending.lock().await.remove(&request_id);
                    return Err(TransportError::Timeout { operation: "stdio request" });
                }
                _ = self.activity_notify.notified() => {
                    deadline = tokio::time::Instant::now() + self.request_timeout;
                }
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
        let payload =
            serde_json::to_string(&message).map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.write_line(&payload).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }
}
