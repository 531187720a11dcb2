//! Browser OAuth for adding accounts.
//!
//! `start` hands out an authorization URL bound to a random `state`; the
//! provider redirects back to `/oauth/callback?state=..&code=..`, and
//! `complete` trades the code for tokens and installs the credential.
//! Pending flows live in a bounded map and expire after a TTL.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::accounts::{Credential, CredentialRecord, CredentialStore, ProviderGroup};
use crate::error::{GatewayError, Result};

const MAX_PENDING_FLOWS: usize = 100;
const STATE_LEN: usize = 32;
const VERIFIER_LEN: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStart {
    pub state: String,
    pub auth_url: String,
}

#[derive(Debug, Clone)]
struct PendingFlow {
    group: ProviderGroup,
    verifier: String,
    created_at: Instant,
}

pub struct OAuthFlow {
    store: Arc<CredentialStore>,
    redirect_uri: String,
    ttl: Duration,
    pending: DashMap<String, PendingFlow>,
}

impl OAuthFlow {
    pub fn new(store: Arc<CredentialStore>, redirect_uri: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            redirect_uri: redirect_uri.into(),
            ttl,
            pending: DashMap::new(),
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn start(&self, group: ProviderGroup) -> Result<AuthorizationStart> {
        let endpoint = self.store.endpoint(group);
        let client_id = endpoint.client_id.clone().ok_or_else(|| {
            GatewayError::oauth(format!(
                "No OAuth client_id configured for {group}; set providers.{group}.client_id"
            ))
        })?;

        self.make_room();

        let state = random_string(STATE_LEN);
        let verifier = random_string(VERIFIER_LEN);
        let challenge = pkce_challenge(&verifier);

        let mut params = vec![
            ("response_type", "code".to_string()),
            ("client_id", client_id),
            ("redirect_uri", self.redirect_uri.clone()),
            ("scope", endpoint.scopes.clone()),
            ("state", state.clone()),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256".to_string()),
        ];
        if group == ProviderGroup::Gemini {
            params.push(("access_type", "offline".to_string()));
            params.push(("prompt", "consent".to_string()));
        }

        let auth_url = url::Url::parse_with_params(&endpoint.auth_url, &params)
            .map_err(|e| GatewayError::config(format!("Invalid auth_url for {group}: {e}")))?;

        self.pending.insert(
            state.clone(),
            PendingFlow {
                group,
                verifier,
                created_at: Instant::now(),
            },
        );
        tracing::info!(provider = %group, "OAuth flow started");

        Ok(AuthorizationStart {
            state,
            auth_url: auth_url.to_string(),
        })
    }

    /// Finish a flow. The state is consumed whether or not the exchange works.
    pub async fn complete(&self, state: &str, code: &str) -> Result<Arc<Credential>> {
        let (_, flow) = self
            .pending
            .remove(state)
            .ok_or_else(|| GatewayError::oauth("Unknown or already used OAuth state"))?;
        if flow.created_at.elapsed() >= self.ttl {
            return Err(GatewayError::oauth("OAuth state expired, start again"));
        }

        // Anthropic's callback hands back `code#state`.
        let code = code.split('#').next().unwrap_or(code).trim();
        if code.is_empty() {
            return Err(GatewayError::oauth("Missing authorization code"));
        }

        let endpoint = self.store.endpoint(flow.group);
        let tokens = self.store.tokens();
        let token = tokens
            .exchange_code(endpoint, code, &self.redirect_uri, &flow.verifier, state)
            .await?;
        let refresh_token = token.refresh_token.clone().ok_or_else(|| {
            GatewayError::oauth("Provider returned no refresh_token; revoke access and retry")
        })?;
        let email = tokens.fetch_email(endpoint, &token).await?;

        let now = Utc::now();
        let expiry_date = token.expiry_from(now).timestamp_millis();
        let record = CredentialRecord {
            id: String::new(),
            provider: flow.group,
            email,
            project_id: None,
            access_token: token.access_token,
            refresh_token,
            expiry_date,
            revoked: false,
            created_at: Some(now),
        };
        self.store.install(record).await
    }

    fn make_room(&self) {
        let ttl = self.ttl;
        self.pending.retain(|_, flow| flow.created_at.elapsed() < ttl);
        if self.pending.len() >= MAX_PENDING_FLOWS {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|entry| entry.created_at)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.pending.remove(&key);
                tracing::warn!("Too many pending OAuth flows, dropped the oldest");
            }
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
