//! Picks the next usable credential and tracks per-credential health.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::credential::{Credential, HealthState, ProviderGroup};
use super::pool::AccountPools;
use crate::config::CooldownConfig;
use crate::error::{GatewayError, Result};

/// How a single upstream try ended, as far as the credential is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 401/403 or a rejected refresh token.
    AuthFailure(String),
    /// 429. `retry_after` is the upstream hint, if any.
    Quota {
        retry_after: Option<Duration>,
        message: String,
    },
    /// 5xx, timeout or transport error.
    Transient(String),
    /// Any other 4xx. Not the credential's fault.
    ClientError,
}

/// Cool-down length for rate-limited credentials.
#[derive(Debug, Clone, Copy)]
pub struct CooldownPolicy {
    pub default: Duration,
    pub max: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_config(&CooldownConfig::default())
    }
}

impl CooldownPolicy {
    pub fn from_config(config: &CooldownConfig) -> Self {
        Self {
            default: Duration::from_secs(config.default_secs),
            max: Duration::from_secs(config.max_secs),
        }
    }

    /// The upstream hint wins; otherwise the default doubles with every
    /// consecutive quota failure. Both are capped at `max`.
    pub fn backoff(&self, hint: Option<Duration>, consecutive_failures: u32) -> Duration {
        let wait = match hint {
            Some(hint) => hint,
            None => {
                let exponent = consecutive_failures.saturating_sub(1).min(16);
                self.default.saturating_mul(1u32 << exponent)
            }
        };
        wait.min(self.max)
    }
}

#[derive(Debug)]
pub struct AccountRotator {
    pools: Arc<AccountPools>,
    cooldown: CooldownPolicy,
}

impl AccountRotator {
    pub fn new(pools: Arc<AccountPools>, cooldown: CooldownPolicy) -> Self {
        Self { pools, cooldown }
    }

    pub fn pools(&self) -> &Arc<AccountPools> {
        &self.pools
    }

    pub fn select(&self, group: ProviderGroup, exclude: &HashSet<String>) -> Result<Arc<Credential>> {
        self.select_at(group, exclude, Utc::now())
    }

    /// Round-robin from the pool cursor to the first credential that is active
    /// or whose cool-down has elapsed by `now`. Credentials in `exclude` were
    /// already tried by the current call.
    pub fn select_at(
        &self,
        group: ProviderGroup,
        exclude: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Arc<Credential>> {
        self.pools
            .get(group)
            .pick(|cred| {
                if exclude.contains(cred.id()) {
                    return false;
                }
                cred.with_status(|status| match status.health {
                    HealthState::Active => true,
                    HealthState::Cooling { until } if until <= now => {
                        status.health = HealthState::Active;
                        true
                    }
                    _ => false,
                })
            })
            .ok_or(GatewayError::NoAccountsAvailable {
                group,
                last_error: None,
            })
    }

    pub fn report(&self, credential: &Credential, outcome: &Outcome) -> HealthState {
        self.report_at(credential, outcome, Utc::now())
    }

    /// Apply a try's outcome to the credential. Returns the resulting health.
    pub fn report_at(
        &self,
        credential: &Credential,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> HealthState {
        if let Outcome::AuthFailure(reason) = outcome {
            credential.mark_revoked(reason.as_str());
            return HealthState::Revoked;
        }

        credential.with_status(|status| {
            match outcome {
                Outcome::Success => {
                    if matches!(status.health, HealthState::Cooling { .. }) {
                        status.health = HealthState::Active;
                    }
                    status.last_used = Some(now);
                    status.last_error = None;
                    status.consecutive_quota_failures = 0;
                }
                Outcome::Quota {
                    retry_after,
                    message,
                } => {
                    status.consecutive_quota_failures += 1;
                    status.last_error = Some(message.clone());
                    if status.health != HealthState::Revoked {
                        let wait = self
                            .cooldown
                            .backoff(*retry_after, status.consecutive_quota_failures);
                        let until = now + chrono::Duration::milliseconds(wait.as_millis() as i64);
                        status.health = HealthState::Cooling { until };
                        tracing::warn!(
                            account = %credential.label(),
                            cooldown_secs = wait.as_secs(),
                            "Account rate limited, cooling down"
                        );
                    }
                }
                Outcome::Transient(message) => {
                    status.last_error = Some(message.clone());
                }
                Outcome::ClientError => {
                    status.last_used = Some(now);
                }
                Outcome::AuthFailure(_) => {}
            }
            status.health
        })
    }
}
