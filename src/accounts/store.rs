//! On-disk credential records and token refresh.
//!
//! Every credential lives in `<auth_dir>/<id>.json`. The store owns the
//! directory, keeps the in-memory pools in sync with it and refreshes access
//! tokens shortly before they expire.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::credential::{Credential, CredentialRecord, HealthState, ProviderGroup};
use super::pool::AccountPools;
use super::token::{RefreshFailure, TokenClient};
use crate::error::{GatewayError, Result};
use crate::logging::SharedLogger;
use crate::providers::{ProviderEndpoint, ProviderEndpoints};

const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

/// Result of [`CredentialStore::refresh_if_needed`]. Never an error: the
/// dispatcher decides what to do with a credential that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// An access token good for at least the refresh margin.
    Ready(String),
    /// The provider refused the refresh token; the credential is now revoked.
    Revoked(String),
    /// Refresh failed for a reason worth retrying later.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountsSnapshot {
    pub count: usize,
    pub current: CursorSnapshot,
    pub accounts: Vec<AccountSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorSnapshot {
    pub claude: usize,
    pub gemini: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub file: String,
    pub provider: ProviderGroup,
    pub email: Option<String>,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    pub expiry_date: i64,
    pub health: HealthState,
    pub last_used: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct CredentialStore {
    dir: PathBuf,
    pools: Arc<AccountPools>,
    tokens: TokenClient,
    endpoints: ProviderEndpoints,
    refresh_margin: chrono::Duration,
    logger: SharedLogger,
}

impl CredentialStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        pools: Arc<AccountPools>,
        tokens: TokenClient,
        endpoints: ProviderEndpoints,
        logger: SharedLogger,
    ) -> Self {
        Self {
            dir: dir.into(),
            pools,
            tokens,
            endpoints,
            refresh_margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            logger,
        }
    }

    pub fn with_refresh_margin(mut self, margin: std::time::Duration) -> Self {
        self.refresh_margin = chrono::Duration::from_std(margin).unwrap_or(self.refresh_margin);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pools(&self) -> &Arc<AccountPools> {
        &self.pools
    }

    pub fn endpoint(&self, group: ProviderGroup) -> &ProviderEndpoint {
        self.endpoints.get(group)
    }

    pub fn tokens(&self) -> &TokenClient {
        &self.tokens
    }

    /// Read every record in the directory into the pools. Unreadable records
    /// are logged and skipped. Returns the number of credentials loaded.
    pub async fn load(&self) -> Result<usize> {
        let found = self.scan().await?;
        let loaded = found.len();
        for (path, record) in found {
            let group = record.provider;
            self.pools
                .get(group)
                .upsert(Arc::new(Credential::new(record, path)));
        }

        let claude = self.pools.get(ProviderGroup::Claude).len();
        let gemini = self.pools.get(ProviderGroup::Gemini).len();
        tracing::info!(claude, gemini, dir = %self.dir.display(), "Loaded accounts");
        self.logger.info(
            "accounts",
            format!("Loaded {loaded} accounts (claude={claude}, gemini={gemini})"),
        );
        Ok(loaded)
    }

    /// Re-scan the directory. New records are appended to their pool, records
    /// that disappeared are dropped. Existing entries keep their health state.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let found = self.scan().await?;
        let mut keep: [HashSet<String>; 2] = [HashSet::new(), HashSet::new()];
        let mut added = 0;

        for (path, record) in found {
            let group = record.provider;
            keep[group_index(group)].insert(record.id.clone());
            let pool = self.pools.get(group);
            if pool.get(&record.id).is_none() {
                pool.upsert(Arc::new(Credential::new(record, path)));
                added += 1;
            }
        }

        let mut removed = 0;
        for group in ProviderGroup::ALL {
            removed += self
                .pools
                .get(group)
                .retain_ids(&keep[group_index(group)])
                .len();
        }

        let summary = ReloadSummary {
            added,
            removed,
            count: self.pools.total(),
        };
        tracing::info!(added, removed, count = summary.count, "Reloaded accounts");
        self.logger.info(
            "accounts",
            format!(
                "Reload: +{} -{} ({} total)",
                summary.added, summary.removed, summary.count
            ),
        );
        Ok(summary)
    }

    /// Remove a credential from memory and disk. Accepts the id or the file name.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.trim().trim_end_matches(".json");
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(GatewayError::invalid_request(format!(
                "Invalid account id: {id}"
            )));
        }

        let removed = self
            .pools
            .find(id)
            .and_then(|cred| self.pools.get(cred.group()).remove(cred.id()));
        let path = removed
            .as_ref()
            .map(|cred| cred.path().to_path_buf())
            .unwrap_or_else(|| self.dir.join(format!("{id}.json")));

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if removed.is_none() {
                    return Err(GatewayError::not_found(format!("Account {id} not found")));
                }
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(account = id, "Deleted account");
        self.logger.info("accounts", format!("Deleted account {id}"));
        Ok(())
    }

    /// Persist a freshly authorized record and add it to its pool. A record for
    /// a provider + email that is already present replaces that credential.
    pub async fn install(&self, mut record: CredentialRecord) -> Result<Arc<Credential>> {
        let pool = self.pools.get(record.provider);

        if let Some(email) = record.email.clone() {
            if let Some(existing) = pool
                .entries()
                .into_iter()
                .find(|c| c.email().as_deref() == Some(email.as_str()))
            {
                record.id = existing.id().to_string();
            }
        }
        if record.id.trim().is_empty() {
            record.id = uuid::Uuid::new_v4().simple().to_string();
        }
        record.revoked = false;
        if record.created_at.is_none() {
            record.created_at = Some(Utc::now());
        }

        let path = self.dir.join(format!("{}.json", record.id));
        write_record(&path, &record).await?;

        let credential = Arc::new(Credential::new(record, path));
        let is_new = pool.upsert(Arc::clone(&credential));

        let verb = if is_new { "Added" } else { "Re-authorized" };
        tracing::info!(
            provider = %credential.group(),
            account = %credential.label(),
            "{verb} account"
        );
        self.logger.info(
            "accounts",
            format!(
                "{verb} {} account {}",
                credential.group(),
                credential.label()
            ),
        );
        Ok(credential)
    }

    /// Write the credential's current record back to its file.
    pub async fn persist(&self, credential: &Credential) -> Result<()> {
        write_record(credential.path(), &credential.record()).await
    }

    /// Mark a credential revoked and persist the flag so a reload keeps it out
    /// of rotation.
    pub async fn revoke(&self, credential: &Credential, reason: &str) {
        credential.mark_revoked(reason);
        tracing::warn!(
            provider = %credential.group(),
            account = %credential.label(),
            reason,
            "Account revoked"
        );
        self.logger.warn(
            "accounts",
            format!("Revoked {} ({})", credential.label(), reason),
        );
        self.persist_or_log(credential).await;
    }

    async fn persist_or_log(&self, credential: &Credential) {
        if let Err(e) = self.persist(credential).await {
            tracing::warn!(account = %credential.id(), error = %e, "Failed to persist account");
        }
    }

    /// Make sure the credential's access token outlives the refresh margin.
    ///
    /// Concurrent callers for the same credential queue on its refresh lock;
    /// only the first one talks to the token endpoint.
    pub async fn refresh_if_needed(&self, credential: &Credential) -> RefreshOutcome {
        if credential.health() == HealthState::Revoked {
            return RefreshOutcome::Revoked("account is revoked".to_string());
        }
        if !credential.expires_within(self.refresh_margin, Utc::now()) {
            return RefreshOutcome::Ready(credential.access_token());
        }

        let _guard = credential.refresh_lock().lock().await;

        // Another caller may have finished the refresh while we waited.
        if credential.health() == HealthState::Revoked {
            return RefreshOutcome::Revoked("account is revoked".to_string());
        }
        if !credential.expires_within(self.refresh_margin, Utc::now()) {
            return RefreshOutcome::Ready(credential.access_token());
        }

        tracing::debug!(account = %credential.label(), "Refreshing access token");
        let endpoint = self.endpoints.get(credential.group());
        match self
            .tokens
            .refresh(endpoint, &credential.refresh_token())
            .await
        {
            Ok(token) => {
                let expiry = token.expiry_from(Utc::now());
                credential.update_tokens(token.access_token, token.refresh_token, expiry);
                self.persist_or_log(credential).await;
                tracing::info!(
                    account = %credential.label(),
                    expires_in = token.expires_in,
                    "Access token refreshed"
                );
                RefreshOutcome::Ready(credential.access_token())
            }
            Err(RefreshFailure::Rejected(reason)) => {
                self.revoke(credential, &reason).await;
                RefreshOutcome::Revoked(reason)
            }
            Err(RefreshFailure::Transient(reason)) => {
                // The old token may still have a few minutes left.
                if !credential.expires_within(chrono::Duration::zero(), Utc::now()) {
                    tracing::warn!(
                        account = %credential.label(),
                        error = %reason,
                        "Refresh failed, using current token until expiry"
                    );
                    return RefreshOutcome::Ready(credential.access_token());
                }
                credential.with_status(|s| s.last_error = Some(reason.clone()));
                RefreshOutcome::Failed(reason)
            }
        }
    }

    pub fn snapshot(&self) -> AccountsSnapshot {
        let mut accounts = Vec::new();
        for group in ProviderGroup::ALL {
            for cred in self.pools.get(group).entries() {
                let record = cred.record();
                let status = cred.status();
                accounts.push(AccountSummary {
                    id: record.id,
                    file: cred.file_name(),
                    provider: group,
                    email: record.email,
                    project_id: record.project_id,
                    expiry_date: record.expiry_date,
                    health: status.health,
                    last_used: status.last_used,
                    last_error: status.last_error,
                });
            }
        }

        AccountsSnapshot {
            count: accounts.len(),
            current: CursorSnapshot {
                claude: self.pools.get(ProviderGroup::Claude).cursor(),
                gemini: self.pools.get(ProviderGroup::Gemini).cursor(),
            },
            accounts,
        }
    }

    async fn scan(&self) -> Result<Vec<(PathBuf, CredentialRecord)>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => found.push((path, record)),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable account");
                    self.logger.warn(
                        "accounts",
                        format!("Skipping {}: {}", path.display(), e),
                    );
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

fn group_index(group: ProviderGroup) -> usize {
    match group {
        ProviderGroup::Claude => 0,
        ProviderGroup::Gemini => 1,
    }
}

async fn read_record(path: &Path) -> Result<CredentialRecord> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut record: CredentialRecord = serde_json::from_str(&content)?;
    if record.id.trim().is_empty() {
        record.id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    if record.refresh_token.is_empty() && record.access_token.is_empty() {
        return Err(GatewayError::invalid_request("record carries no tokens"));
    }
    Ok(record)
}

/// Write via a unique temp file and rename so readers never see half a record.
async fn write_record(path: &Path, record: &CredentialRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
