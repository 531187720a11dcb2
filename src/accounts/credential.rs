use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::GatewayError;

/// The two independent upstream provider groups an account can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderGroup {
    Claude,
    Gemini,
}

impl ProviderGroup {
    pub const ALL: [ProviderGroup; 2] = [ProviderGroup::Claude, ProviderGroup::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderGroup::Claude => "claude",
            ProviderGroup::Gemini => "gemini",
        }
    }

    /// Route a model name by prefix. Anything else is unsupported.
    pub fn for_model(model: &str) -> Option<Self> {
        let lower = model.to_ascii_lowercase();
        if lower.starts_with("claude") {
            Some(ProviderGroup::Claude)
        } else if lower.starts_with("gemini") {
            Some(ProviderGroup::Gemini)
        } else {
            None
        }
    }
}

impl fmt::Display for ProviderGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderGroup {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Ok(ProviderGroup::Claude),
            "gemini" | "google" => Ok(ProviderGroup::Gemini),
            other => Err(GatewayError::invalid_request(format!(
                "Unknown provider '{other}' (expected claude or gemini)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum HealthState {
    Active,
    Cooling { until: DateTime<Utc> },
    Revoked,
}

/// The persisted form of a credential, one JSON file per account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Defaults to the file stem when absent.
    #[serde(default)]
    pub id: String,
    pub provider: ProviderGroup,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "projectId", alias = "project_id")]
    pub project_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token expiry in milliseconds since the epoch.
    #[serde(default)]
    pub expiry_date: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn expiry(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.expiry_date)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Volatile per-credential health bookkeeping. Never persisted except for
/// the revoked flag, which lives on the record.
#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub health: HealthState,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_quota_failures: u32,
}

/// One OAuth-derived account usable against one provider group.
///
/// Shared as `Arc<Credential>` between the pool, the rotator and in-flight
/// dispatches. Token refresh is serialized through `refresh_lock`.
#[derive(Debug)]
pub struct Credential {
    id: String,
    group: ProviderGroup,
    path: PathBuf,
    record: RwLock<CredentialRecord>,
    status: Mutex<CredentialStatus>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Credential {
    pub fn new(record: CredentialRecord, path: impl Into<PathBuf>) -> Self {
        let health = if record.revoked {
            HealthState::Revoked
        } else {
            HealthState::Active
        };
        Self {
            id: record.id.clone(),
            group: record.provider,
            path: path.into(),
            record: RwLock::new(record),
            status: Mutex::new(CredentialStatus {
                health,
                last_used: None,
                last_error: None,
                consecutive_quota_failures: 0,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> ProviderGroup {
        self.group
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.json", self.id))
    }

    pub fn record(&self) -> CredentialRecord {
        self.record.read().clone()
    }

    pub fn email(&self) -> Option<String> {
        self.record.read().email.clone()
    }

    pub fn label(&self) -> String {
        self.email().unwrap_or_else(|| self.id.clone())
    }

    pub fn access_token(&self) -> String {
        self.record.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> String {
        self.record.read().refresh_token.clone()
    }

    pub fn project_id(&self) -> Option<String> {
        self.record.read().project_id.clone()
    }

    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.record.read().expiry() <= now + margin
    }

    /// Install a freshly refreshed access token (and rotated refresh token, if any).
    pub fn update_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        expiry: DateTime<Utc>,
    ) -> CredentialRecord {
        let mut record = self.record.write();
        record.access_token = access_token;
        if let Some(rt) = refresh_token {
            record.refresh_token = rt;
        }
        record.expiry_date = expiry.timestamp_millis();
        record.clone()
    }

    /// Flag the record revoked. Returns the updated record for persistence.
    pub fn mark_revoked(&self, reason: impl Into<String>) -> CredentialRecord {
        {
            let mut status = self.status.lock();
            status.health = HealthState::Revoked;
            status.last_error = Some(reason.into());
        }
        let mut record = self.record.write();
        record.revoked = true;
        record.clone()
    }

    pub fn status(&self) -> CredentialStatus {
        self.status.lock().clone()
    }

    pub fn health(&self) -> HealthState {
        self.status.lock().health
    }

    pub(crate) fn with_status<R>(&self, f: impl FnOnce(&mut CredentialStatus) -> R) -> R {
        f(&mut self.status.lock())
    }

    pub(crate) fn refresh_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.refresh_lock
    }
}

#[cfg(test)]
pub(crate) fn test_record(id: &str, group: ProviderGroup) -> CredentialRecord {
    CredentialRecord {
        id: id.to_string(),
        provider: group,
        email: Some(format!("{id}@example.com")),
        project_id: None,
        access_token: format!("access-{id}"),
        refresh_token: format!("refresh-{id}"),
        expiry_date: (Utc::now() + Duration::hours(1)).timestamp_millis(),
        revoked: false,
        created_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_prefix_routing() {
        assert_eq!(
            ProviderGroup::for_model("claude-sonnet-4-5"),
            Some(ProviderGroup::Claude)
        );
        assert_eq!(
            ProviderGroup::for_model("Gemini-2.5-pro"),
            Some(ProviderGroup::Gemini)
        );
        assert_eq!(ProviderGroup::for_model("gpt-4o"), None);
    }

    #[test]
    fn test_record_parses_camel_case_project_and_ignores_unknown() {
        let json = r#"{
            "id": "a1",
            "provider": "gemini",
            "email": "a@b.c",
            "projectId": "proj-9",
            "access_token": "ya29",
            "refresh_token": "1//r",
            "expiry_date": 1700000000000,
            "extra_field": true
        }"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.provider, ProviderGroup::Gemini);
        assert_eq!(record.project_id.as_deref(), Some("proj-9"));
        assert!(!record.revoked);
        assert_eq!(record.expiry().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_revoked_record_starts_revoked() {
        let mut record = test_record("x", ProviderGroup::Claude);
        record.revoked = true;
        let cred = Credential::new(record, "/tmp/x.json");
        assert_eq!(cred.health(), HealthState::Revoked);
    }

    #[test]
    fn test_expires_within_margin() {
        let mut record = test_record("x", ProviderGroup::Claude);
        let now = Utc::now();
        record.expiry_date = (now + Duration::minutes(3)).timestamp_millis();
        let cred = Credential::new(record, "/tmp/x.json");
        assert!(cred.expires_within(Duration::minutes(5), now));
        assert!(!cred.expires_within(Duration::minutes(1), now));
    }
}
