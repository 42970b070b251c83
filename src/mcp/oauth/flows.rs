//! Pending authorization flows, keyed by their `state` token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::sync;
use crate::core::{EntityKind, GatewayError, GatewayResult};

type CodeSlot = Arc<Mutex<Option<String>>>;

struct OAuthFlow {
    server_name: String,
    created_at: DateTime<Utc>,
    authorization_url: String,
    code: CodeSlot,
    cancel: CancellationToken,
}

/// The waiting side of one flow. The callback writes the code once and the
/// handshake task takes it once.
#[derive(Clone)]
pub struct FlowHandle {
    pub state: String,
    code: CodeSlot,
    cancel: CancellationToken,
}

impl FlowHandle {
    pub fn take_code(&self) -> Option<String> {
        sync::lock(&self.code).take()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Marks the flow as no longer waiting. It stays registered, but codes
    /// delivered to it are refused.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSummary {
    pub state: String,
    pub server_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct OAuthFlowRegistry {
    flows: Mutex<HashMap<String, OAuthFlow>>,
}

impl OAuthFlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flow for `server_name`. `state` must not collide with a
    /// pending flow.
    pub fn register(
        &self,
        server_name: &str,
        state: &str,
        authorization_url: &str,
        parent: &CancellationToken,
    ) -> GatewayResult<FlowHandle> {
        let mut flows = sync::lock(&self.flows);
        if flows.contains_key(state) {
            return Err(GatewayError::already_exists(EntityKind::OAuthFlow, state));
        }
        let code: CodeSlot = Arc::new(Mutex::new(None));
        let cancel = parent.child_token();
        flows.insert(
            state.to_string(),
            OAuthFlow {
                server_name: server_name.to_string(),
                created_at: Utc::now(),
                authorization_url: authorization_url.to_string(),
                code: code.clone(),
                cancel: cancel.clone(),
            },
        );
        debug!(server = server_name, "OAuth flow registered");
        Ok(FlowHandle {
            state: state.to_string(),
            code,
            cancel,
        })
    }

    pub fn server_for_state(&self, state: &str) -> Option<String> {
        sync::lock(&self.flows)
            .get(state)
            .map(|flow| flow.server_name.clone())
    }

    /// Most recently created pending URL for `server_name`.
    pub fn authorization_url_for(&self, server_name: &str) -> Option<String> {
        sync::lock(&self.flows)
            .values()
            .filter(|flow| flow.server_name == server_name)
            .max_by_key(|flow| flow.created_at)
            .map(|flow| flow.authorization_url.clone())
    }

    /// Hands `code` to the waiting handshake and consumes the flow.
    /// Returns the owning server name. Flows nobody waits on any more are
    /// refused with `StaleOAuthFlow`.
    pub fn deliver_code(&self, state: &str, code: &str) -> GatewayResult<String> {
        let flow = {
            let mut flows = sync::lock(&self.flows);
            let stale = flows
                .get(state)
                .ok_or_else(|| GatewayError::not_found(EntityKind::OAuthFlow, state))?;
            if stale.cancel.is_cancelled() {
                return Err(GatewayError::StaleOAuthFlow {
                    name: stale.server_name.clone(),
                });
            }
            flows
                .remove(state)
                .ok_or_else(|| GatewayError::not_found(EntityKind::OAuthFlow, state))?
        };
        *sync::lock(&flow.code) = Some(code.to_string());
        debug!(server = %flow.server_name, "OAuth authorization code delivered");
        Ok(flow.server_name)
    }

    /// Aborts every pending flow of `server_name`. Returns whether any existed.
    pub fn cancel_for_server(&self, server_name: &str) -> bool {
        self.remove_for_server(server_name) > 0
    }

    /// Drops the flows of `server_name`, cancelling their waits.
    pub fn remove_for_server(&self, server_name: &str) -> usize {
        let removed: Vec<OAuthFlow> = {
            let mut flows = sync::lock(&self.flows);
            let states: Vec<String> = flows
                .iter()
                .filter(|(_, flow)| flow.server_name == server_name)
                .map(|(state, _)| state.clone())
                .collect();
            states
                .iter()
                .filter_map(|state| flows.remove(state))
                .collect()
        };
        for flow in &removed {
            flow.cancel.cancel();
        }
        removed.len()
    }

    pub fn pending(&self) -> Vec<FlowSummary> {
        let mut pending: Vec<FlowSummary> = sync::lock(&self.flows)
            .iter()
            .map(|(state, flow)| FlowSummary {
                state: state.clone(),
                server_name: flow.server_name.clone(),
                created_at: flow.created_at,
            })
            .collect();
        pending.sort_by_key(|summary| summary.created_at);
        pending
    }

    pub fn clear(&self) {
        let drained: Vec<OAuthFlow> = sync::lock(&self.flows).drain().map(|(_, flow)| flow).collect();
        for flow in drained {
            flow.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_code_is_taken_once() {
        let registry = OAuthFlowRegistry::new();
        let root = CancellationToken::new();
        let handle = registry
            .register("linear", "s1", "https://auth/authorize?state=s1", &root)
            .expect("register");
        assert_eq!(registry.server_for_state("s1").as_deref(), Some("linear"));
        assert_eq!(handle.take_code(), None);

        assert_eq!(registry.deliver_code("s1", "code-1").unwrap(), "linear");
        assert_eq!(handle.take_code().as_deref(), Some("code-1"));
        assert_eq!(handle.take_code(), None);
        assert!(registry.server_for_state("s1").is_none());
    }

    #[test]
    fn unknown_state_is_not_found() {
        let registry = OAuthFlowRegistry::new();
        let err = registry.deliver_code("nope", "code").expect_err("unknown state");
        assert!(matches!(
            err,
            GatewayError::NotFound {
                kind: EntityKind::OAuthFlow,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_state_is_rejected() {
        let registry = OAuthFlowRegistry::new();
        let root = CancellationToken::new();
        registry.register("a", "same", "https://a", &root).unwrap();
        assert!(registry.register("b", "same", "https://b", &root).is_err());
    }

    #[test]
    fn removing_a_server_cancels_its_flows_only() {
        let registry = OAuthFlowRegistry::new();
        let root = CancellationToken::new();
        let linear = registry.register("linear", "s1", "https://l", &root).unwrap();
        let slack = registry.register("slack", "s2", "https://s", &root).unwrap();

        assert_eq!(registry.authorization_url_for("linear").as_deref(), Some("https://l"));
        assert!(registry.cancel_for_server("linear"));
        assert!(!registry.cancel_for_server("linear"));
        assert!(linear.cancellation().is_cancelled());
        assert!(!slack.cancellation().is_cancelled());
        assert!(registry.authorization_url_for("linear").is_none());
        assert_eq!(registry.pending().len(), 1);
    }

    #[test]
    fn abandoned_flows_refuse_codes() {
        let registry = OAuthFlowRegistry::new();
        let root = CancellationToken::new();
        let handle = registry.register("linear", "s1", "https://l", &root).unwrap();
        handle.abandon();

        let err = registry.deliver_code("s1", "late").expect_err("nobody waits");
        assert!(matches!(err, GatewayError::StaleOAuthFlow { ref name } if name == "linear"));
        assert_eq!(handle.take_code(), None);
        assert_eq!(registry.pending().len(), 1);
        assert!(!root.is_cancelled());
    }

    #[test]
    fn parent_cancellation_reaches_flows() {
        let registry = OAuthFlowRegistry::new();
        let root = CancellationToken::new();
        let handle = registry.register("a", "s", "https://a", &root).unwrap();
        root.cancel();
        assert!(handle.cancellation().is_cancelled());
    }
}
