//! Built-in presets for the two upstream provider groups.
//!
//! Each preset defines the upstream API base URL and the OAuth endpoints used
//! to mint and refresh account tokens. Config can override any URL; client
//! credentials come from config or from the environment variables named here.

use crate::accounts::ProviderGroup;
use crate::config::{GatewayConfig, ProviderSettings};

/// How the token endpoint expects its request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    Form,
    Json,
}

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub group: ProviderGroup,
    pub base_url: &'static str,
    pub auth_url: &'static str,
    pub token_url: &'static str,
    pub userinfo_url: Option<&'static str>,
    pub scopes: &'static str,
    pub token_format: TokenFormat,
    pub client_id_env: &'static str,
    pub client_secret_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        group: ProviderGroup::Claude,
        base_url: "https://api.anthropic.com",
        auth_url: "https://claude.ai/oauth/authorize",
        token_url: "https://console.anthropic.com/v1/oauth/token",
        userinfo_url: None,
        scopes: "org:create_api_key user:profile user:inference",
        token_format: TokenFormat::Json,
        client_id_env: "UNIGATE_CLAUDE_CLIENT_ID",
        client_secret_env: "UNIGATE_CLAUDE_CLIENT_SECRET",
    },
    ProviderPreset {
        group: ProviderGroup::Gemini,
        base_url: "https://generativelanguage.googleapis.com",
        auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        userinfo_url: Some("https://www.googleapis.com/oauth2/v2/userinfo"),
        scopes: concat!(
            "https://www.googleapis.com/auth/cloud-platform ",
            "https://www.googleapis.com/auth/generative-language.retriever ",
            "https://www.googleapis.com/auth/userinfo.email ",
            "https://www.googleapis.com/auth/userinfo.profile"
        ),
        token_format: TokenFormat::Form,
        client_id_env: "UNIGATE_GEMINI_CLIENT_ID",
        client_secret_env: "UNIGATE_GEMINI_CLIENT_SECRET",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn for_group(group: ProviderGroup) -> &'static ProviderPreset {
        match group {
            ProviderGroup::Claude => &PRESETS[0],
            ProviderGroup::Gemini => &PRESETS[1],
        }
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }
}

/// A preset merged with user overrides; what the rest of the gateway uses.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub group: ProviderGroup,
    pub base_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: Option<String>,
    pub scopes: String,
    pub token_format: TokenFormat,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl ProviderEndpoint {
    pub fn resolve(group: ProviderGroup, settings: &ProviderSettings) -> Self {
        let preset = ProviderPreset::for_group(group);
        let from_env = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            group,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| preset.base_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            auth_url: settings
                .auth_url
                .clone()
                .unwrap_or_else(|| preset.auth_url.to_string()),
            token_url: settings
                .token_url
                .clone()
                .unwrap_or_else(|| preset.token_url.to_string()),
            userinfo_url: settings
                .userinfo_url
                .clone()
                .or_else(|| preset.userinfo_url.map(str::to_string)),
            scopes: preset.scopes.to_string(),
            token_format: preset.token_format,
            client_id: settings
                .client_id
                .clone()
                .or_else(|| from_env(preset.client_id_env)),
            client_secret: settings
                .client_secret
                .clone()
                .or_else(|| from_env(preset.client_secret_env)),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Resolved endpoints for both provider groups.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    claude: ProviderEndpoint,
    gemini: ProviderEndpoint,
}

impl ProviderEndpoints {
    pub fn new(claude: ProviderEndpoint, gemini: ProviderEndpoint) -> Self {
        Self { claude, gemini }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.provider(ProviderGroup::Claude),
            config.provider(ProviderGroup::Gemini),
        )
    }

    pub fn get(&self, group: ProviderGroup) -> &ProviderEndpoint {
        match group {
            ProviderGroup::Claude => &self.claude,
            ProviderGroup::Gemini => &self.gemini,
        }
    }
}
