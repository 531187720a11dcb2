//! Client for the providers' OAuth token endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{truncate, GatewayError, Result};
use crate::providers::{ProviderEndpoint, TokenFormat};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Anthropic returns the account identity alongside the tokens.
    #[serde(default)]
    pub account: Option<TokenAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAccount {
    #[serde(default)]
    pub email_address: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Upper bound on a token lifetime we are willing to believe.
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 3600;

impl TokenResponse {
    /// Absolute expiry of this token. `expires_in` is clamped to
    /// `0..=MAX_TOKEN_LIFETIME_SECS`, so a hostile value cannot overflow.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS);
        chrono::Duration::try_seconds(secs)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(now)
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
}

/// Why a refresh did not produce a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The provider refused the refresh token (revoked, expired, invalid).
    Rejected(String),
    /// Network trouble or a provider-side failure; worth retrying later.
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    fn client_id(endpoint: &ProviderEndpoint) -> Result<String> {
        endpoint.client_id.clone().ok_or_else(|| {
            GatewayError::config(format!(
                "Missing OAuth client_id for {}. Set providers.{}.client_id",
                endpoint.group, endpoint.group
            ))
        })
    }

    async fn post_token(
        &self,
        endpoint: &ProviderEndpoint,
        params: Vec<(&'static str, String)>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let request = self.http.post(&endpoint.token_url).timeout(self.timeout);
        let request = match endpoint.token_format {
            TokenFormat::Form => request.form(&params),
            TokenFormat::Json => {
                let body: serde_json::Map<String, serde_json::Value> = params
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
                    .collect();
                request.json(&body)
            }
        };
        request.send().await
    }

    pub async fn refresh(
        &self,
        endpoint: &ProviderEndpoint,
        refresh_token: &str,
    ) -> std::result::Result<TokenResponse, RefreshFailure> {
        let client_id =
            Self::client_id(endpoint).map_err(|e| RefreshFailure::Transient(e.to_string()))?;
        let mut params = vec![
            ("client_id", client_id),
            ("refresh_token", refresh_token.to_string()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(ref secret) = endpoint.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .post_token(endpoint, params)
            .await
            .map_err(|e| RefreshFailure::Transient(format!("Token refresh request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TokenResponse>()
                .await
                .map_err(|e| RefreshFailure::Transient(format!("Token parsing failed: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 || status.as_u16() == 401 || body.contains("invalid_grant") {
            Err(RefreshFailure::Rejected(format!(
                "Token refresh rejected ({}): {}",
                status.as_u16(),
                truncate(&body, 300)
            )))
        } else {
            Err(RefreshFailure::Transient(format!(
                "Token refresh failed ({}): {}",
                status.as_u16(),
                truncate(&body, 300)
            )))
        }
    }

    pub async fn exchange_code(
        &self,
        endpoint: &ProviderEndpoint,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        state: &str,
    ) -> Result<TokenResponse> {
        let mut params = vec![
            ("client_id", Self::client_id(endpoint)?),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("grant_type", "authorization_code".to_string()),
            ("code_verifier", code_verifier.to_string()),
        ];
        if endpoint.token_format == TokenFormat::Json {
            params.push(("state", state.to_string()));
        }
        if let Some(ref secret) = endpoint.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .post_token(endpoint, params)
            .await
            .map_err(|e| GatewayError::oauth(format!("Token exchange request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::oauth(format!(
                "Token exchange failed ({status}): {}",
                truncate(&body, 300)
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| GatewayError::oauth(format!("Token parsing failed: {e}")))?;

        if token.refresh_token.is_none() {
            tracing::warn!(
                provider = %endpoint.group,
                "Provider did not return a refresh_token; revoke the app's access and retry"
            );
        }
        Ok(token)
    }

    /// Resolve the account email, from the token response or the userinfo endpoint.
    pub async fn fetch_email(
        &self,
        endpoint: &ProviderEndpoint,
        token: &TokenResponse,
    ) -> Result<Option<String>> {
        if let Some(email) = token.account.as_ref().and_then(|a| a.email_address.clone()) {
            return Ok(Some(email));
        }
        let Some(ref url) = endpoint.userinfo_url else {
            return Ok(None);
        };

        let response = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::warn!(status = response.status().as_u16(), "userinfo lookup failed");
            return Ok(None);
        }
        let info: UserInfo = response.json().await?;
        Ok(Some(info.email))
    }
}
