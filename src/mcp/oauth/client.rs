//! OAuth 2.1 authorization-code + PKCE client used against remote target
//! servers: metadata discovery, dynamic client registration, code exchange
//! and refresh.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::tokens::OAuthTokens;
use crate::core::config::{OAuthConfig, TargetServerDescriptor};

pub const OAUTH_REFRESH_SAFETY_WINDOW_S: i64 = 60;
const CODE_VERIFIER_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("target server '{0}' has no URL to authorize against")]
    NotRemote(String),

    #[error("invalid OAuth URL: {0}")]
    InvalidUrl(String),

    #[error("OAuth client registration failed ({status}): {body}")]
    Registration {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("OAuth token exchange failed ({status}): {body}")]
    Exchange {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("OAuth refresh failed ({status}): {body}")]
    Refresh {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("stored OAuth tokens cannot be refreshed; re-authorization required")]
    NotRefreshable,

    #[error("OAuth request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("secure random source unavailable: {0}")]
    Random(String),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuthMetadata {
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub issuer: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default)]
    pub authorization_servers: Option<Vec<String>>,
}

impl OAuthMetadata {
    fn has_endpoints(&self) -> bool {
        self.authorization_endpoint.is_some() || self.token_endpoint.is_some()
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OAuthClientRegistrationResponse {
    client_id: String,
}

/// Endpoints resolved for one authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    pub issuer: Option<String>,
}

/// Everything needed to finish an authorization once the code arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub authorization_url: String,
    pub code_verifier: String,
    pub client_id: Option<String>,
    pub token_endpoint: String,
    pub redirect_uri: String,
}

/// The network half of the OAuth handshake.
#[async_trait]
pub trait OAuthAuthorizer: Send + Sync {
    /// Discovers endpoints, registers a client if needed and builds the
    /// authorization URL bound to `state`.
    async fn begin(
        &self,
        descriptor: &TargetServerDescriptor,
        state: &str,
    ) -> Result<PendingAuthorization, OAuthError>;

    async fn exchange(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<OAuthTokens, OAuthError>;

    async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, OAuthError>;
}

pub struct HttpOAuthAuthorizer {
    client: reqwest::Client,
    redirect_uri: String,
    client_name: String,
    client_id: Option<String>,
    scope: Option<String>,
    discovery_timeout: Duration,
}

impl HttpOAuthAuthorizer {
    pub fn new(client: reqwest::Client, config: &OAuthConfig) -> Self {
        Self {
            client,
            redirect_uri: config.callback_url.clone(),
            client_name: config.client_name.clone(),
            client_id: config.client_id.clone(),
            scope: config.scope.clone(),
            discovery_timeout: Duration::from_millis(config.discovery_timeout_ms),
        }
    }

    /// Well-known metadata for `server_url`, following protected-resource
    /// delegation to the authorization server.
    pub async fn discover(&self, server_url: &str) -> Result<Option<OAuthMetadata>, OAuthError> {
        let origin = origin_of(server_url)?;
        let candidates = [
            format!("{origin}/.well-known/oauth-protected-resource"),
            format!("{origin}/.well-known/oauth-authorization-server"),
            format!("{origin}/.well-known/openid-configuration"),
        ];

        for candidate in candidates {
            let Some(metadata) = self.fetch_metadata(&candidate).await else {
                continue;
            };
            if metadata.has_endpoints() {
                return Ok(Some(metadata));
            }
            for issuer in metadata.authorization_servers.iter().flatten() {
                let issuer = issuer.trim_end_matches('/');
                let well_known = format!("{issuer}/.well-known/oauth-authorization-server");
                if let Some(mut delegated) = self.fetch_metadata(&well_known).await {
                    if delegated.issuer.is_none() {
                        delegated.issuer = Some(issuer.to_string());
                    }
                    if delegated.has_endpoints() {
                        return Ok(Some(delegated));
                    }
                }
            }
        }

        Ok(None)
    }

    async fn fetch_metadata(&self, url: &str) -> Option<OAuthMetadata> {
        let response = self.client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json::<OAuthMetadata>().await.ok()
    }

    async fn resolve_endpoints(&self, server_url: &str) -> Result<AuthorizationEndpoints, OAuthError> {
        let discovered =
            match tokio::time::timeout(self.discovery_timeout, self.discover(server_url)).await {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(err)) => {
                    debug!(url = server_url, error = %err, "OAuth discovery failed; using default endpoints");
                    None
                }
                Err(_) => {
                    debug!(url = server_url, "OAuth discovery timed out; using default endpoints");
                    None
                }
            };
        let defaults = default_endpoints(server_url)?;
        Ok(match discovered {
            Some(metadata) => AuthorizationEndpoints {
                authorization_endpoint: metadata
                    .authorization_endpoint
                    .unwrap_or(defaults.authorization_endpoint),
                token_endpoint: metadata.token_endpoint.unwrap_or(defaults.token_endpoint),
                registration_endpoint: metadata.registration_endpoint,
                issuer: metadata.issuer,
            },
            None => defaults,
        })
    }

    pub async fn register_client(&self, registration_endpoint: &str) -> Result<String, OAuthError> {
        let payload = serde_json::json!({
            "client_name": self.client_name,
            "redirect_uris": [self.redirect_uri],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "none"
        });
        let response = self
            .client
            .post(registration_endpoint)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Registration { status, body });
        }
        let data = response.json::<OAuthClientRegistrationResponse>().await?;
        Ok(data.client_id)
    }

    async fn post_token_form(
        &self,
        token_endpoint: &str,
        form_fields: &[(&str, &str)],
    ) -> Result<Result<OAuthTokenResponse, (reqwest::StatusCode, String)>, OAuthError> {
        let response = self
            .client
            .post(token_endpoint)
            .form(form_fields)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Ok(Err((status, body)));
        }
        Ok(Ok(response.json::<OAuthTokenResponse>().await?))
    }
}

#[async_trait]
impl OAuthAuthorizer for HttpOAuthAuthorizer {
    async fn begin(
        &self,
        descriptor: &TargetServerDescriptor,
        state: &str,
    ) -> Result<PendingAuthorization, OAuthError> {
        let server_url = descriptor
            .url()
            .ok_or_else(|| OAuthError::NotRemote(descriptor.name.clone()))?;
        let endpoints = self.resolve_endpoints(server_url).await?;

        let client_id = match (&self.client_id, &endpoints.registration_endpoint) {
            (Some(client_id), _) => Some(client_id.clone()),
            (None, Some(registration_endpoint)) => {
                match self.register_client(registration_endpoint).await {
                    Ok(client_id) => Some(client_id),
                    Err(err) => {
                        warn!(server = %descriptor.name, error = %err, "OAuth client registration failed");
                        None
                    }
                }
            }
            (None, None) => None,
        };

        let code_verifier = random_urlsafe(CODE_VERIFIER_BYTES)?;
        let code_challenge = pkce_s256_challenge(&code_verifier);
        let url = build_authorization_url(AuthorizationUrlParams {
            authorization_endpoint: &endpoints.authorization_endpoint,
            client_id: client_id.as_deref(),
            redirect_uri: &self.redirect_uri,
            state,
            code_challenge: &code_challenge,
            code_challenge_method: "S256",
            resource: Some(server_url),
            scope: self.scope.as_deref(),
        })?;

        Ok(PendingAuthorization {
            authorization_url: url.to_string(),
            code_verifier,
            client_id,
            token_endpoint: endpoints.token_endpoint,
            redirect_uri: self.redirect_uri.clone(),
        })
    }

    async fn exchange(
        &self,
        pending: &PendingAuthorization,
        code: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        let mut form_fields = vec![
            ("grant_type", "authorization_code"),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("code", code),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        if let Some(client_id) = pending
            .client_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            form_fields.push(("client_id", client_id));
        }
        let token = self
            .post_token_form(&pending.token_endpoint, &form_fields)
            .await?
            .map_err(|(status, body)| OAuthError::Exchange { status, body })?;

        let seed = OAuthTokens {
            client_id: pending.client_id.clone(),
            token_endpoint: Some(pending.token_endpoint.clone()),
            redirect_uri: Some(pending.redirect_uri.clone()),
            ..OAuthTokens::bearer(String::new())
        };
        Ok(apply_token_response(&seed, token, current_unix_epoch_s()))
    }

    async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, OAuthError> {
        let (Some(refresh_token), Some(token_endpoint)) =
            (tokens.refresh_token.as_deref(), tokens.token_endpoint.as_deref())
        else {
            return Err(OAuthError::NotRefreshable);
        };
        let mut form_fields = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = tokens
            .client_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            form_fields.push(("client_id", client_id));
        }
        let token = self
            .post_token_form(token_endpoint, &form_fields)
            .await?
            .map_err(|(status, body)| OAuthError::Refresh { status, body })?;
        Ok(apply_token_response(tokens, token, current_unix_epoch_s()))
    }
}

pub fn current_unix_epoch_s() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Merges a token response into existing tokens; fields the provider
/// omitted keep their previous values.
pub fn apply_token_response(
    existing: &OAuthTokens,
    token: OAuthTokenResponse,
    now_epoch_s: i64,
) -> OAuthTokens {
    OAuthTokens {
        access_token: token.access_token,
        refresh_token: token.refresh_token.or_else(|| existing.refresh_token.clone()),
        token_type: token.token_type.or_else(|| existing.token_type.clone()),
        scope: token.scope.or_else(|| existing.scope.clone()),
        expires_at_epoch_s: token
            .expires_in
            .and_then(|seconds| now_epoch_s.checked_add(seconds)),
        client_id: existing.client_id.clone(),
        token_endpoint: existing.token_endpoint.clone(),
        redirect_uri: existing.redirect_uri.clone(),
    }
}

fn origin_of(server_url: &str) -> Result<String, OAuthError> {
    let url = reqwest::Url::parse(server_url)
        .map_err(|err| OAuthError::InvalidUrl(format!("{server_url}: {err}")))?;
    let Some(host) = url.host_str() else {
        return Err(OAuthError::InvalidUrl(server_url.to_string()));
    };
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

/// Endpoints assumed when the server publishes no metadata.
pub fn default_endpoints(server_url: &str) -> Result<AuthorizationEndpoints, OAuthError> {
    let origin = origin_of(server_url)?;
    Ok(AuthorizationEndpoints {
        authorization_endpoint: format!("{origin}/authorize"),
        token_endpoint: format!("{origin}/token"),
        registration_endpoint: Some(format!("{origin}/register")),
        issuer: None,
    })
}

pub fn random_urlsafe(bytes_len: usize) -> Result<String, OAuthError> {
    let mut bytes = vec![0_u8; bytes_len];
    getrandom::fill(&mut bytes).map_err(|err| OAuthError::Random(err.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

pub fn pkce_s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

pub struct AuthorizationUrlParams<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: Option<&'a str>,
    pub redirect_uri: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub code_challenge_method: &'a str,
    pub resource: Option<&'a str>,
    pub scope: Option<&'a str>,
}

pub fn build_authorization_url(
    params: AuthorizationUrlParams<'_>,
) -> Result<reqwest::Url, OAuthError> {
    let mut url = reqwest::Url::parse(params.authorization_endpoint).map_err(|err| {
        OAuthError::InvalidUrl(format!("{}: {err}", params.authorization_endpoint))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        if let Some(client_id) = params.client_id.filter(|value| !value.trim().is_empty()) {
            query.append_pair("client_id", client_id);
        }
        query.append_pair("redirect_uri", params.redirect_uri);
        query.append_pair("state", params.state);
        query.append_pair("code_challenge", params.code_challenge);
        query.append_pair("code_challenge_method", params.code_challenge_method);
        if let Some(scope) = params.scope.filter(|value| !value.trim().is_empty()) {
            query.append_pair("scope", scope);
        }
        if let Some(resource) = params.resource {
            query.append_pair("resource", resource);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params<'a>(client_id: Option<&'a str>, scope: Option<&'a str>) -> AuthorizationUrlParams<'a> {
        AuthorizationUrlParams {
            authorization_endpoint: "https://auth.example.com/authorize",
            client_id,
            redirect_uri: "http://127.0.0.1:9000/oauth/callback",
            state: "state123",
            code_challenge: "challenge123",
            code_challenge_method: "S256",
            resource: None,
            scope,
        }
    }

    #[test]
    fn test_random_urlsafe_is_urlsafe() {
        let token = random_urlsafe(32).expect("random bytes");
        assert!(token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
        assert!(!token.contains('='));
        assert_ne!(token, random_urlsafe(32).expect("random bytes"));
    }

    #[test]
    fn test_pkce_s256_matches_rfc_example() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = pkce_s256_challenge(verifier);
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_build_authorization_url_includes_required_params() {
        let url = build_authorization_url(params(Some("gatehouse"), None))
            .expect("authorization URL should build");
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(query.get("client_id").map(String::as_str), Some("gatehouse"));
        assert_eq!(query.get("state").map(String::as_str), Some("state123"));
        assert_eq!(
            query.get("code_challenge_method").map(String::as_str),
            Some("S256")
        );
        assert!(!query.contains_key("scope"));
    }

    #[test]
    fn test_build_authorization_url_omits_empty_client_id() {
        let url = build_authorization_url(params(Some("  "), Some("mcp.read mcp.write")))
            .expect("authorization URL should build");
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert!(!query.contains_key("client_id"));
        assert_eq!(
            query.get("scope").map(String::as_str),
            Some("mcp.read mcp.write")
        );
    }

    #[test]
    fn default_endpoints_hang_off_origin() {
        let endpoints = default_endpoints("https://mcp.linear.app:8443/mcp").expect("endpoints");
        assert_eq!(
            endpoints.authorization_endpoint,
            "https://mcp.linear.app:8443/authorize"
        );
        assert_eq!(endpoints.token_endpoint, "https://mcp.linear.app:8443/token");
        assert!(default_endpoints("not a url").is_err());
    }

    #[test]
    fn token_response_keeps_existing_refresh_token() {
        let existing = OAuthTokens {
            refresh_token: Some("existing-refresh".to_string()),
            client_id: Some("client-id".to_string()),
            ..OAuthTokens::bearer("old-access")
        };
        let token: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"new-access","expires_in":120}"#)
                .expect("token response should deserialize");

        let updated = apply_token_response(&existing, token, 1_000);
        assert_eq!(updated.access_token, "new-access");
        assert_eq!(updated.refresh_token.as_deref(), Some("existing-refresh"));
        assert_eq!(updated.expires_at_epoch_s, Some(1_120));
        assert_eq!(updated.client_id.as_deref(), Some("client-id"));
        assert_eq!(updated.token_type.as_deref(), Some("Bearer"));
    }

    #[tokio::test]
    async fn refresh_requires_refresh_token() {
        let authorizer = HttpOAuthAuthorizer::new(reqwest::Client::new(), &OAuthConfig::default());
        let err = authorizer
            .refresh(&OAuthTokens::bearer("access"))
            .await
            .expect_err("nothing to refresh with");
        assert!(matches!(err, OAuthError::NotRefreshable));
    }
}
