//! In-process stand-ins for target servers and OAuth providers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::{CallToolResult, Tool};
use serde_json::{json, Map, Value};

use crate::core::config::{TargetServerDescriptor, TransportConfig};
use crate::mcp::connection::{SharedTargetConnection, TargetConnection};
use crate::mcp::factory::{resolve_stdio_env, TargetConnectionFactory};
use crate::mcp::oauth::client::{OAuthAuthorizer, OAuthError, PendingAuthorization};
use crate::mcp::oauth::tokens::OAuthTokens;
use crate::mcp::transport::TransportError;

pub fn tool(name: &str) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "inputSchema": {"type": "object"}
    }))
    .expect("tool should deserialize")
}

pub fn text_result(text: &str) -> CallToolResult {
    serde_json::from_value(json!({"content": [{"type": "text", "text": text}]}))
        .expect("result should deserialize")
}

pub fn result_text(result: &CallToolResult) -> String {
    let value = serde_json::to_value(result).expect("result should serialize");
    value["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// Echoes `<server>:<tool>` for every known tool.
pub struct FakeConnection {
    server: String,
    tools: Vec<String>,
    closed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TargetConnection for FakeConnection {
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        Ok(self.tools.iter().map(|name| tool(name)).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        if !self.tools.iter().any(|known| known == name) {
            return Err(TransportError::Rpc {
                code: -32602,
                message: format!("unknown tool {name}"),
            });
        }
        Ok(text_result(&format!("{}:{name}", self.server)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.lock().unwrap().push(self.server.clone());
        Ok(())
    }
}

/// Connects every descriptor unless told otherwise. Remote descriptors can
/// be made to demand a specific bearer token.
#[derive(Default)]
pub struct FakeFactory {
    required_token: Option<String>,
    environment: HashMap<String, String>,
    tools: Mutex<HashMap<String, Vec<String>>>,
    refused: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    pub closed: Arc<Mutex<Vec<String>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requiring_token(token: &str) -> Self {
        Self {
            required_token: Some(token.to_string()),
            ..Self::default()
        }
    }

    pub fn with_environment(mut self, environment: &[(&str, &str)]) -> Self {
        self.environment = environment
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        self
    }

    pub fn set_tools(&self, server: &str, tools: &[&str]) {
        self.tools.lock().unwrap().insert(
            server.to_string(),
            tools.iter().map(|name| name.to_string()).collect(),
        );
    }

    pub fn refuse(&self, server: &str) {
        self.refused.lock().unwrap().insert(server.to_string());
    }

    pub fn accept(&self, server: &str) {
        self.refused.lock().unwrap().remove(server);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetConnectionFactory for FakeFactory {
    async fn connect(
        &self,
        descriptor: &TargetServerDescriptor,
        tokens: Option<&OAuthTokens>,
    ) -> Result<SharedTargetConnection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let TransportConfig::Stdio { env, .. } = &descriptor.transport {
            resolve_stdio_env(env, &self.environment)?;
        }
        if self.refused.lock().unwrap().contains(&descriptor.name) {
            return Err(TransportError::Protocol("connection refused".to_string()));
        }
        if descriptor.is_remote() {
            if let Some(required) = &self.required_token {
                let presented = tokens.map(|tokens| tokens.access_token.as_str());
                if presented != Some(required.as_str()) {
                    return Err(TransportError::Unauthorized);
                }
            }
        }
        let tools = self
            .tools
            .lock()
            .unwrap()
            .get(&descriptor.name)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(FakeConnection {
            server: descriptor.name.clone(),
            tools,
            closed: self.closed.clone(),
        }))
    }
}

/// Issues a fixed access token for every exchange and refresh.
pub struct FakeAuthorizer {
    issuing: String,
    refreshes: AtomicUsize,
    exchanged_codes: Mutex<Vec<String>>,
}

impl Default for FakeAuthorizer {
    fn default() -> Self {
        Self::issuing("issued")
    }
}

impl FakeAuthorizer {
    pub fn issuing(token: &str) -> Self {
        Self {
            issuing: token.to_string(),
            refreshes: AtomicUsize::new(0),
            exchanged_codes: Mutex::new(Vec::new()),
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn exchanged_codes(&self) -> Vec<String> {
        self.exchanged_codes.lock().unwrap().clone()
    }
}

#[async_trait]
impl OAuthAuthorizer for FakeAuthorizer {
    async fn begin(
        &self,
        descriptor: &TargetServerDescriptor,
        state: &str,
    ) -> Result<PendingAuthorization, OAuthError> {
        Ok(PendingAuthorization {
            authorization_url: format!(
                "https://auth.example.com/authorize?server={}&state={state}",
                descriptor.name
            ),
            code_verifier: "verifier".to_string(),
            client_id: Some("gatehouse".to_string()),
            token_endpoint: "https://auth.example.com/token".to_string(),
            redirect_uri: "http://127.0.0.1:9000/oauth/callback".to_string(),
        })
    }

    async fn exchange(
        &self,
        _pending: &PendingAuthorization,
        code: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        self.exchanged_codes.lock().unwrap().push(code.to_string());
        Ok(OAuthTokens::bearer(self.issuing.clone()))
    }

    async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, OAuthError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(OAuthTokens {
            access_token: self.issuing.clone(),
            expires_at_epoch_s: None,
            ..tokens.clone()
        })
    }
}

pub fn env_values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
