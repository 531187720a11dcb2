//! OAuth-derived upstream accounts: records, pools, rotation and refresh.

pub mod credential;
pub mod pool;
pub mod rotator;
pub mod store;
pub mod token;

pub use credential::{Credential, CredentialRecord, CredentialStatus, HealthState, ProviderGroup};
pub use pool::{AccountPools, CredentialPool};
pub use rotator::{AccountRotator, CooldownPolicy, Outcome};
pub use store::{AccountsSnapshot, CredentialStore, RefreshOutcome, ReloadSummary};
pub use token::{RefreshFailure, TokenClient, TokenResponse};
