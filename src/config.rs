use crate::accounts::ProviderGroup;
use crate::error::{GatewayError, Result};
use crate::providers::ProviderEndpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client API keys. Empty disables the key guard.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated between two reads of an upstream body.
    #[serde(default = "default_read_idle_timeout_secs")]
    pub read_idle_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_cooldown_secs")]
    pub default_secs: u64,
    #[serde(default = "default_cooldown_max_secs")]
    pub max_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_margin_secs")]
    pub margin_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
    /// Where the provider redirects after consent. Defaults to the local
    /// `/oauth/callback` route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub claude: ProviderSettings,
    #[serde(default)]
    pub gemini: ProviderSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userinfo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("auths")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("logs").join("unigate.jsonl")
}

fn default_max_attempts() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_idle_timeout_secs() -> u64 {
    120
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    4_000
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_cooldown_max_secs() -> u64 {
    3_600
}

fn default_refresh_margin_secs() -> u64 {
    300
}

fn default_refresh_timeout_secs() -> u64 {
    30
}

fn default_state_ttl_secs() -> u64 {
    600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_idle_timeout_secs: default_read_idle_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_secs: default_cooldown_secs(),
            max_secs: default_cooldown_max_secs(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            margin_secs: default_refresh_margin_secs(),
            timeout_secs: default_refresh_timeout_secs(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_state_ttl_secs(),
            redirect_uri: None,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
            auth_dir: default_auth_dir(),
            log_file: default_log_file(),
            dispatch: DispatchConfig::default(),
            cooldown: CooldownConfig::default(),
            refresh: RefreshConfig::default(),
            oauth: OAuthConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        if self.dispatch.max_attempts == 0 {
            return Err(GatewayError::config("dispatch.max_attempts must be at least 1"));
        }
        if self.cooldown.max_secs < self.cooldown.default_secs {
            return Err(GatewayError::config(
                "cooldown.max_secs must not be smaller than cooldown.default_secs",
            ));
        }
        Ok(())
    }

    pub fn provider(&self, group: ProviderGroup) -> ProviderEndpoint {
        let settings = match group {
            ProviderGroup::Claude => &self.providers.claude,
            ProviderGroup::Gemini => &self.providers.gemini,
        };
        ProviderEndpoint::resolve(group, settings)
    }

    pub fn redirect_uri(&self) -> String {
        self.oauth.redirect_uri.clone().unwrap_or_else(|| {
            let host = if self.host == "0.0.0.0" {
                "localhost"
            } else {
                self.host.as_str()
            };
            format!("http://{}:{}/oauth/callback", host, self.port)
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.connect_timeout_secs)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.read_idle_timeout_secs)
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("unigate.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("unigate")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("unigate").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("unigate").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".unigate.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
