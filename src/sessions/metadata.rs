//! Session metadata derived from the initialize request and its headers.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::header::HeaderMap;
use rust_mcp_schema::InitializeRequestParams;
use tracing::warn;
use uuid::Uuid;

use super::model::{
    AdapterSupport, AdapterVersion, ClientAdapter, ClientInfo, LlmHints, SessionMetadata,
};

pub const CONSUMER_TAG_HEADER: &str = "x-lunar-consumer-tag";
pub const LLM_PROVIDER_HEADER: &str = "x-lunar-llm-provider";
pub const LLM_MODEL_ID_HEADER: &str = "x-lunar-llm-model-id";

const MCP_REMOTE_ADAPTER: &str = "mcp-remote";
const MCP_REMOTE_MARKER: &str = "via mcp-remote";
/// Newest `mcp-remote` release that still answers pings.
const LATEST_PING_CAPABLE_MCP_REMOTE: AdapterVersion = AdapterVersion {
    major: 0,
    minor: 1,
    patch: 21,
};

const PROBE_CLIENT_NAMES: &[&str] = &["mcp-remote-fallback-test"];

const CLIENT_NAME_ALIASES: &[(&str, &str)] = &[
    ("openai-mcp (ChatGPT)", "openai-mcp"),
    ("Anthropic", "Anthropic/ClaudeAI"),
];

fn mcp_remote_version_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"via mcp-remote[ /-]?([0-9]+)\.([0-9]+)\.([0-9]+)").ok())
        .as_ref()
}

impl SessionMetadata {
    /// Builds metadata for a session that just sent `initialize`. A fresh
    /// client id is generated for every session.
    pub fn from_initialize(
        headers: &HeaderMap,
        initialize: Option<&InitializeRequestParams>,
    ) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let llm = match (header(LLM_PROVIDER_HEADER), header(LLM_MODEL_ID_HEADER)) {
            (Some(provider), Some(model_id)) => Some(LlmHints { provider, model_id }),
            _ => None,
        };
        let client_info = initialize.map(client_info_from).unwrap_or_default();
        let is_probe = is_probe_client(client_info.name.as_deref());

        Self {
            client_id: format!("client-{}", Uuid::new_v4()),
            consumer_tag: header(CONSUMER_TAG_HEADER),
            llm,
            client_info,
            is_probe,
        }
    }

    /// Unknown clients are assumed to answer pings.
    pub fn supports_ping(&self) -> bool {
        self.client_info
            .adapter
            .as_ref()
            .and_then(|adapter| adapter.support)
            .is_none_or(|support| support.ping)
    }
}

fn client_info_from(params: &InitializeRequestParams) -> ClientInfo {
    let raw_name = params.client_info.name.as_str();
    ClientInfo {
        name: Some(normalize_client_name(raw_name).to_string()),
        version: Some(params.client_info.version.clone()),
        protocol_version: Some(params.protocol_version.clone()),
        adapter: detect_adapter(raw_name),
    }
}

pub fn normalize_client_name(name: &str) -> &str {
    CLIENT_NAME_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

pub fn is_probe_client(name: Option<&str>) -> bool {
    name.is_some_and(|name| PROBE_CLIENT_NAMES.contains(&name))
}

/// Recognizes `mcp-remote` from names such as `Cursor (via mcp-remote 0.1.18)`.
pub fn detect_adapter(client_name: &str) -> Option<ClientAdapter> {
    if !client_name.contains(MCP_REMOTE_MARKER) {
        return None;
    }
    let version = mcp_remote_version_pattern()
        .and_then(|pattern| pattern.captures(client_name))
        .and_then(|captures| {
            Some(AdapterVersion {
                major: captures.get(1)?.as_str().parse().ok()?,
                minor: captures.get(2)?.as_str().parse().ok()?,
                patch: captures.get(3)?.as_str().parse().ok()?,
            })
        });
    let support = version.map(|version| AdapterSupport {
        ping: version <= LATEST_PING_CAPABLE_MCP_REMOTE,
    });
    Some(ClientAdapter {
        name: MCP_REMOTE_ADAPTER.to_string(),
        version,
        support,
    })
}

/// Warns about adapter versions known to break liveness pings.
pub fn log_metadata_warnings(metadata: &SessionMetadata, session_id: &str) {
    let Some(adapter) = &metadata.client_info.adapter else {
        return;
    };
    if adapter.name == MCP_REMOTE_ADAPTER && adapter.support.is_some_and(|support| !support.ping) {
        warn!(
            session_id,
            client = metadata.client_info.name.as_deref().unwrap_or("-"),
            "Detected mcp-remote outside the supported version range; pin it as mcp-remote@{} in the agent configuration",
            LATEST_PING_CAPABLE_MCP_REMOTE
        );
    }
}
