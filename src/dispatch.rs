//! Upstream dispatch with credential rotation.
//!
//! One logical call walks `select → refresh → send → classify`. Recoverable
//! failures move on to the next credential until the pool (or the attempt
//! ceiling) is exhausted. A streamed reply is handed back as soon as upstream
//! answers 2xx; from that point nothing is retried.

use bytes::Bytes;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::accounts::{
    AccountRotator, Credential, CredentialStore, Outcome, ProviderGroup, RefreshOutcome,
};
use crate::config::DispatchConfig;
use crate::error::{truncate, GatewayError, Result};
use crate::logging::SharedLogger;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>;

/// A request to replay against whichever credential the rotator hands out.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    pub group: ProviderGroup,
    /// Path below the provider base URL, e.g. `/v1/messages`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stream: bool,
}

impl UpstreamCall {
    pub fn new(group: ProviderGroup, path: impl Into<String>, body: Bytes) -> Self {
        Self {
            group,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body,
            stream: false,
        }
    }

    pub fn json<T: Serialize>(group: ProviderGroup, path: impl Into<String>, body: &T) -> Result<Self> {
        Ok(Self::new(group, path, Bytes::from(serde_json::to_vec(body)?)))
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            UpstreamBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamReply {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
    pub credential_id: String,
}

/// Why one try failed. Drives the rotator and the retry loop; only surfaces to
/// callers through [`GatewayError`] once retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamFailure {
    #[error("authorization rejected: {message}")]
    AuthExpired { status: Option<u16>, message: String },

    #[error("quota exhausted: {message}")]
    Quota {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("transient failure: {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("upstream returned {status}")]
    Client { status: u16, body: String },
}

impl UpstreamFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthExpired { status, .. } | Self::Transient { status, .. } => *status,
            Self::Quota { .. } => Some(429),
            Self::Client { status, .. } => Some(*status),
        }
    }

    pub fn class(&self) -> AttemptClass {
        match self {
            Self::AuthExpired { .. } => AttemptClass::AuthFailure,
            Self::Quota { .. } => AttemptClass::Quota,
            Self::Transient { .. } => AttemptClass::Transient,
            Self::Client { .. } => AttemptClass::ClientError,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Self::AuthExpired { message, .. } => Outcome::AuthFailure(message.clone()),
            Self::Quota {
                retry_after,
                message,
            } => Outcome::Quota {
                retry_after: *retry_after,
                message: message.clone(),
            },
            Self::Transient { message, .. } => Outcome::Transient(message.clone()),
            Self::Client { .. } => Outcome::ClientError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptClass {
    Success,
    AuthFailure,
    Quota,
    Transient,
    ClientError,
}

/// Telemetry for one try. Logged, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchAttempt {
    pub provider: ProviderGroup,
    pub credential: String,
    pub attempt: usize,
    pub outcome: AttemptClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchAttempt {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptClass::Success
    }

    pub fn summary(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        match self.error {
            Some(ref error) => format!(
                "{} #{} via {}: {:?} status={} {}ms ({})",
                self.provider,
                self.attempt,
                self.credential,
                self.outcome,
                status,
                self.latency_ms,
                error
            ),
            None => format!(
                "{} #{} via {}: {:?} status={} {}ms",
                self.provider, self.attempt, self.credential, self.outcome, status, self.latency_ms
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Total deadline for a non-stream call, body included.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Exponential delay before the `retry`-th transient retry (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << retry.min(16))
            .min(self.backoff_max)
    }
}

pub struct UpstreamDispatcher {
    http: reqwest::Client,
    rotator: Arc<AccountRotator>,
    store: Arc<CredentialStore>,
    policy: RetryPolicy,
    logger: SharedLogger,
}

impl UpstreamDispatcher {
    pub fn new(
        http: reqwest::Client,
        rotator: Arc<AccountRotator>,
        store: Arc<CredentialStore>,
        policy: RetryPolicy,
        logger: SharedLogger,
    ) -> Self {
        Self {
            http,
            rotator,
            store,
            policy,
            logger,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn rotator(&self) -> &Arc<AccountRotator> {
        &self.rotator
    }

    pub fn logger(&self) -> &SharedLogger {
        &self.logger
    }

    /// Run one logical call. Every credential is tried at most once, and no
    /// more than `max_attempts` tries are made in total.
    pub async fn dispatch(&self, call: &UpstreamCall) -> Result<UpstreamReply> {
        let pool_size = self.store.pools().get(call.group).len();
        let ceiling = self.policy.max_attempts.min(pool_size);
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut transient_retries = 0u32;

        for attempt in 1..=ceiling {
            let credential = match self.rotator.select(call.group, &tried) {
                Ok(credential) => credential,
                Err(_) => break,
            };
            tried.insert(credential.id().to_string());

            let started = Instant::now();
            let result = self.try_once(call, &credential).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(reply) => {
                    self.rotator.report(&credential, &Outcome::Success);
                    self.logger.attempt(&DispatchAttempt {
                        provider: call.group,
                        credential: credential.label(),
                        attempt,
                        outcome: AttemptClass::Success,
                        status: Some(reply.status),
                        latency_ms,
                        error: None,
                    });
                    return Ok(reply);
                }
                Err(failure) => {
                    self.rotator.report(&credential, &failure.outcome());
                    if let UpstreamFailure::AuthExpired { .. } = failure {
                        if let Err(e) = self.store.persist(&credential).await {
                            tracing::warn!(account = %credential.id(), error = %e, "Failed to persist revocation");
                        }
                    }
                    self.logger.attempt(&DispatchAttempt {
                        provider: call.group,
                        credential: credential.label(),
                        attempt,
                        outcome: failure.class(),
                        status: failure.status(),
                        latency_ms,
                        error: Some(failure.to_string()),
                    });
                    tracing::warn!(
                        provider = %call.group,
                        account = %credential.label(),
                        attempt,
                        status = ?failure.status(),
                        "Upstream attempt failed: {failure}"
                    );

                    let message = failure.to_string();
                    match failure {
                        UpstreamFailure::Client { status, body } => {
                            return Err(GatewayError::UpstreamRejected { status, body });
                        }
                        UpstreamFailure::Transient { .. } if attempt < ceiling => {
                            tokio::time::sleep(self.policy.delay(transient_retries)).await;
                            transient_retries += 1;
                        }
                        _ => {}
                    }
                    last_error = Some(message);
                }
            }
        }

        // Fewer tries than the ceiling means the rotator ran out of candidates.
        if tried.len() < ceiling || ceiling == 0 {
            return Err(GatewayError::NoAccountsAvailable {
                group: call.group,
                last_error,
            });
        }
        Err(GatewayError::UpstreamUnavailable {
            last_error: last_error.unwrap_or_default(),
        })
    }

    async fn try_once(
        &self,
        call: &UpstreamCall,
        credential: &Credential,
    ) -> std::result::Result<UpstreamReply, UpstreamFailure> {
        let access_token = match self.store.refresh_if_needed(credential).await {
            RefreshOutcome::Ready(token) => token,
            RefreshOutcome::Revoked(message) => {
                return Err(UpstreamFailure::AuthExpired {
                    status: None,
                    message,
                })
            }
            RefreshOutcome::Failed(message) => {
                return Err(UpstreamFailure::Transient {
                    status: None,
                    message,
                })
            }
        };

        let url = self.store.endpoint(call.group).url(&call.path);
        let mut request = self
            .http
            .post(&url)
            .bearer_auth(&access_token)
            .header(CONTENT_TYPE, "application/json");
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        match call.group {
            ProviderGroup::Claude => {
                request = request.header("anthropic-version", ANTHROPIC_VERSION);
                if !call.headers.contains_key("anthropic-beta") {
                    request = request.header("anthropic-beta", ANTHROPIC_OAUTH_BETA);
                }
            }
            ProviderGroup::Gemini => {
                if let Some(project) = credential.project_id() {
                    request = request.header("x-goog-user-project", project);
                }
            }
        }
        for (name, value) in &call.headers {
            request = request.header(name, value);
        }
        if !call.stream {
            request = request.timeout(self.policy.request_timeout);
        }

        let response = request
            .body(call.body.clone())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            let headers = response.headers().clone();
            let body = if call.stream {
                UpstreamBody::Stream(Box::pin(response.bytes_stream()))
            } else {
                UpstreamBody::Full(response.bytes().await.map_err(classify_transport)?)
            };
            return Ok(UpstreamReply {
                status,
                headers,
                body,
                credential_id: credential.id().to_string(),
            });
        }

        let header_hint = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body, header_hint))
    }
}

/// Map a non-2xx upstream status to a failure class.
pub fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> UpstreamFailure {
    match status {
        401 | 403 => UpstreamFailure::AuthExpired {
            status: Some(status),
            message: format!("{status}: {}", truncate(&body, 200)),
        },
        429 => UpstreamFailure::Quota {
            retry_after: retry_after.or_else(|| parse_retry_delay(&body)),
            message: format!("429: {}", truncate(&body, 200)),
        },
        500..=599 => UpstreamFailure::Transient {
            status: Some(status),
            message: format!("{status}: {}", truncate(&body, 200)),
        },
        _ => UpstreamFailure::Client { status, body },
    }
}

fn classify_transport(error: reqwest::Error) -> UpstreamFailure {
    let kind = if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connection error"
    } else if error.is_body() || error.is_decode() {
        "body error"
    } else {
        "request error"
    };
    UpstreamFailure::Transient {
        status: None,
        message: format!("{kind}: {error}"),
    }
}

/// `Retry-After` in seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Gemini puts the hint in `error.details[].retryDelay`, e.g. `"12s"` or `"1.5s"`.
pub fn parse_retry_delay(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value
        .get("error")
        .or_else(|| value.get(0).and_then(|v| v.get("error")))?;
    error
        .get("details")?
        .as_array()?
        .iter()
        .filter_map(|detail| detail.get("retryDelay")?.as_str())
        .find_map(parse_seconds)
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
