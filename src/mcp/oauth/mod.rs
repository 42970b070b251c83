//! Two-phase OAuth handshake for remote target servers.
//!
//! Phase one reuses persisted tokens (refreshing them first when they are
//! about to expire). Phase two registers a fresh flow, publishes its
//! authorization URL and polls for the code delivered by the callback.

pub mod client;
pub mod flows;
pub mod tokens;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{OAuthConfig, TargetServerDescriptor};
use crate::core::polling::{poll_until_some, PollingOptions};
use crate::core::{GatewayError, GatewayResult};
use crate::mcp::connection::SharedTargetConnection;
use crate::mcp::factory::SharedConnectionFactory;

use client::{
    current_unix_epoch_s, random_urlsafe, OAuthAuthorizer, OAuthError, OAUTH_REFRESH_SAFETY_WINDOW_S,
};
use flows::OAuthFlowRegistry;
use tokens::{OAuthTokens, SharedTokenStore};

const STATE_BYTES: usize = 32;

pub type SharedAuthorizer = Arc<dyn OAuthAuthorizer>;

pub fn polling_options(config: &OAuthConfig) -> PollingOptions {
    PollingOptions::new(
        config.polling_max_attempts,
        Duration::from_millis(config.polling_interval_ms),
    )
}

pub struct OAuthConnectionHandler {
    factory: SharedConnectionFactory,
    authorizer: SharedAuthorizer,
    tokens: SharedTokenStore,
    flows: Arc<OAuthFlowRegistry>,
    polling: PollingOptions,
}

impl OAuthConnectionHandler {
    pub fn new(
        factory: SharedConnectionFactory,
        authorizer: SharedAuthorizer,
        tokens: SharedTokenStore,
        flows: Arc<OAuthFlowRegistry>,
        polling: PollingOptions,
    ) -> Self {
        Self {
            factory,
            authorizer,
            tokens,
            flows,
            polling,
        }
    }

    pub fn flows(&self) -> &Arc<OAuthFlowRegistry> {
        &self.flows
    }

    pub fn token_store(&self) -> &SharedTokenStore {
        &self.tokens
    }

    pub fn has_stored_tokens(&self, server: &str) -> bool {
        matches!(self.tokens.load(server), Ok(Some(_)))
    }

    /// Connects `descriptor` through OAuth. `on_pending_auth` receives the
    /// authorization URL once a fresh flow is waiting for its code.
    pub async fn connect(
        &self,
        descriptor: &TargetServerDescriptor,
        cancel: &CancellationToken,
        on_pending_auth: &(dyn Fn(&str) + Send + Sync),
    ) -> GatewayResult<SharedTargetConnection> {
        if let Some(connection) = self.reuse_stored_tokens(descriptor).await {
            return Ok(connection);
        }
        self.fresh_handshake(descriptor, cancel, on_pending_auth).await
    }

    /// Best effort: every failure here falls through to a fresh handshake.
    pub async fn reuse_stored_tokens(
        &self,
        descriptor: &TargetServerDescriptor,
    ) -> Option<SharedTargetConnection> {
        let server = descriptor.name.as_str();
        let stored = match self.tokens.load(server) {
            Ok(Some(tokens)) => tokens,
            Ok(None) => return None,
            Err(err) => {
                debug!(server, error = %err, "Stored OAuth tokens unreadable");
                return None;
            }
        };

        let tokens = if stored.needs_refresh(current_unix_epoch_s(), OAUTH_REFRESH_SAFETY_WINDOW_S) {
            match self.authorizer.refresh(&stored).await {
                Ok(refreshed) => refreshed,
                Err(err) => {
                    debug!(server, error = %err, "OAuth refresh failed");
                    return None;
                }
            }
        } else {
            stored
        };

        match self.factory.connect(descriptor, Some(&tokens)).await {
            Ok(connection) => {
                self.persist(server, &tokens);
                debug!(server, "Connected with stored OAuth tokens");
                Some(connection)
            }
            Err(err) => {
                debug!(server, error = %err, "Stored OAuth tokens rejected; starting a fresh authorization");
                None
            }
        }
    }

    async fn fresh_handshake(
        &self,
        descriptor: &TargetServerDescriptor,
        cancel: &CancellationToken,
        on_pending_auth: &(dyn Fn(&str) + Send + Sync),
    ) -> GatewayResult<SharedTargetConnection> {
        let server = descriptor.name.as_str();
        let state = random_urlsafe(STATE_BYTES).map_err(|err| oauth_error(server, err))?;
        let pending = self
            .authorizer
            .begin(descriptor, &state)
            .await
            .map_err(|err| oauth_error(server, err))?;
        let flow = self
            .flows
            .register(server, &state, &pending.authorization_url, cancel)?;
        info!(server, url = %pending.authorization_url, "Target server awaiting OAuth authorization");
        on_pending_auth(&pending.authorization_url);

        // Without a token this normally fails; it runs alongside polling.
        let tokenless = async {
            match self.factory.connect(descriptor, None).await {
                Ok(connection) => connection,
                Err(err) => {
                    debug!(server, error = %err, "Unauthenticated connection attempt failed");
                    std::future::pending().await
                }
            }
        };
        let waiting = &flow;
        let polling = poll_until_some(self.polling, Some(flow.cancellation()), move || async move {
            waiting.take_code()
        });
        let code = tokio::select! {
            biased;
            connection = tokenless => {
                debug!(server, "Target server accepted an unauthenticated connection");
                self.flows.remove_for_server(server);
                return Ok(connection);
            }
            code = polling => code,
        };
        let code = match code {
            Ok(code) => code,
            Err(err) => {
                flow.abandon();
                return Err(err.into());
            }
        };

        let tokens = self
            .authorizer
            .exchange(&pending, &code)
            .await
            .map_err(|err| oauth_error(server, err))?;
        self.persist(server, &tokens);

        self.factory
            .connect(descriptor, Some(&tokens))
            .await
            .map_err(|err| GatewayError::connect_failed(server, err))
    }

    fn persist(&self, server: &str, tokens: &OAuthTokens) {
        if let Err(err) = self.tokens.save(server, tokens) {
            warn!(server, error = %err, "Failed to persist OAuth tokens");
        }
    }
}

fn oauth_error(server: &str, err: OAuthError) -> GatewayError {
    GatewayError::OAuth {
        name: server.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{FakeAuthorizer, FakeFactory};
    use crate::mcp::oauth::tokens::{MemoryTokenStore, TokenStore};
    use std::sync::Mutex;

    fn handler(
        factory: Arc<FakeFactory>,
        authorizer: Arc<FakeAuthorizer>,
        store: Arc<MemoryTokenStore>,
        flows: Arc<OAuthFlowRegistry>,
    ) -> OAuthConnectionHandler {
        OAuthConnectionHandler::new(
            factory,
            authorizer,
            store,
            flows,
            PollingOptions::new(3, Duration::from_millis(100)),
        )
    }

    fn remote() -> TargetServerDescriptor {
        TargetServerDescriptor::streamable_http("linear", "https://mcp.linear.app/mcp")
    }

    #[tokio::test(start_paused = true)]
    async fn stored_tokens_connect_without_a_flow() {
        let factory = Arc::new(FakeFactory::requiring_token("valid"));
        let store = Arc::new(MemoryTokenStore::default());
        store.save("linear", &OAuthTokens::bearer("valid")).unwrap();
        let flows = Arc::new(OAuthFlowRegistry::new());
        let handler = handler(factory.clone(), Arc::new(FakeAuthorizer::default()), store, flows.clone());

        let announced = Mutex::new(Vec::new());
        let on_pending = |url: &str| announced.lock().unwrap().push(url.to_string());
        handler
            .connect(&remote(), &CancellationToken::new(), &on_pending)
            .await
            .expect("stored token accepted");

        assert!(announced.lock().unwrap().is_empty());
        assert!(flows.pending().is_empty());
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_tokens_fall_through_to_fresh_flow() {
        let factory = Arc::new(FakeFactory::requiring_token("fresh"));
        let store = Arc::new(MemoryTokenStore::default());
        store.save("linear", &OAuthTokens::bearer("stale")).unwrap();
        let flows = Arc::new(OAuthFlowRegistry::new());
        let authorizer = Arc::new(FakeAuthorizer::issuing("fresh"));
        let handler = handler(factory, authorizer, store.clone(), flows.clone());

        let delivering = flows.clone();
        let on_pending = move |_url: &str| {
            let state = delivering.pending()[0].state.clone();
            delivering.deliver_code(&state, "code-1").expect("flow pending");
        };
        handler
            .connect(&remote(), &CancellationToken::new(), &on_pending)
            .await
            .expect("fresh authorization connects");

        assert_eq!(store.load("linear").unwrap().unwrap().access_token, "fresh");
        assert!(flows.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_code_exhausts_polling_and_keeps_flow() {
        let factory = Arc::new(FakeFactory::requiring_token("fresh"));
        let flows = Arc::new(OAuthFlowRegistry::new());
        let handler = handler(
            factory,
            Arc::new(FakeAuthorizer::issuing("fresh")),
            Arc::new(MemoryTokenStore::default()),
            flows.clone(),
        );

        let err = match handler
            .connect(&remote(), &CancellationToken::new(), &|_url: &str| {})
            .await
        {
            Ok(_) => panic!("no code ever arrives"),
            Err(err) => err,
        };
        assert!(matches!(err, GatewayError::PollingExhausted { attempts: 3 }));
        let pending = flows.pending();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            flows.deliver_code(&pending[0].state, "late"),
            Err(GatewayError::StaleOAuthFlow { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tokenless_attempt_does_not_hold_up_polling() {
        let factory = Arc::new(FakeFactory::requiring_token("fresh"));
        factory.set_delay(Duration::from_secs(30));
        let flows = Arc::new(OAuthFlowRegistry::new());
        let handler = handler(
            factory.clone(),
            Arc::new(FakeAuthorizer::issuing("fresh")),
            Arc::new(MemoryTokenStore::default()),
            flows.clone(),
        );

        let delivering = flows.clone();
        let on_pending = move |_url: &str| {
            let state = delivering.pending()[0].state.clone();
            delivering.deliver_code(&state, "code-1").expect("flow pending");
        };
        let started = tokio::time::Instant::now();
        handler
            .connect(&remote(), &CancellationToken::new(), &on_pending)
            .await
            .expect("authorized connection");

        // One delayed connect for the token, not two in sequence.
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_flow_aborts_polling() {
        let factory = Arc::new(FakeFactory::requiring_token("fresh"));
        let flows = Arc::new(OAuthFlowRegistry::new());
        let handler = handler(
            factory,
            Arc::new(FakeAuthorizer::issuing("fresh")),
            Arc::new(MemoryTokenStore::default()),
            flows.clone(),
        );

        let cancelling = flows.clone();
        let on_pending = move |_url: &str| {
            cancelling.cancel_for_server("linear");
        };
        let err = match handler
            .connect(&remote(), &CancellationToken::new(), &on_pending)
            .await
        {
            Ok(_) => panic!("flow was cancelled"),
            Err(err) => err,
        };
        assert!(matches!(err, GatewayError::PollingAborted));
    }

    #[tokio::test(start_paused = true)]
    async fn expiring_tokens_are_refreshed_before_use() {
        let factory = Arc::new(FakeFactory::requiring_token("refreshed"));
        let store = Arc::new(MemoryTokenStore::default());
        store
            .save(
                "linear",
                &OAuthTokens {
                    refresh_token: Some("r".to_string()),
                    expires_at_epoch_s: Some(0),
                    ..OAuthTokens::bearer("expired")
                },
            )
            .unwrap();
        let authorizer = Arc::new(FakeAuthorizer::issuing("refreshed"));
        let handler = handler(factory, authorizer.clone(), store.clone(), Arc::new(OAuthFlowRegistry::new()));

        handler
            .connect(&remote(), &CancellationToken::new(), &|_url: &str| {})
            .await
            .expect("refreshed token accepted");
        assert_eq!(authorizer.refresh_count(), 1);
        assert_eq!(store.load("linear").unwrap().unwrap().access_token, "refreshed");
    }
}
