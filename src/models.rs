//! The model catalog served by the list/get model endpoints.
//!
//! Accounts are OAuth-bound, so there is no per-key model listing to ask
//! upstream for; the catalog is a fixed list per provider group.

use serde_json::{json, Value};

use crate::accounts::ProviderGroup;

#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub id: &'static str,
    pub display_name: &'static str,
    pub group: ProviderGroup,
    pub input_token_limit: u64,
    pub output_token_limit: u64,
}

const CATALOG: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-opus-4-1-20250805",
        display_name: "Claude Opus 4.1",
        group: ProviderGroup::Claude,
        input_token_limit: 200_000,
        output_token_limit: 32_000,
    },
    ModelInfo {
        id: "claude-sonnet-4-5-20250929",
        display_name: "Claude Sonnet 4.5",
        group: ProviderGroup::Claude,
        input_token_limit: 200_000,
        output_token_limit: 64_000,
    },
    ModelInfo {
        id: "claude-sonnet-4-20250514",
        display_name: "Claude Sonnet 4",
        group: ProviderGroup::Claude,
        input_token_limit: 200_000,
        output_token_limit: 64_000,
    },
    ModelInfo {
        id: "claude-haiku-4-5-20251001",
        display_name: "Claude Haiku 4.5",
        group: ProviderGroup::Claude,
        input_token_limit: 200_000,
        output_token_limit: 64_000,
    },
    ModelInfo {
        id: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        group: ProviderGroup::Gemini,
        input_token_limit: 1_048_576,
        output_token_limit: 65_536,
    },
    ModelInfo {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        group: ProviderGroup::Gemini,
        input_token_limit: 1_048_576,
        output_token_limit: 65_536,
    },
    ModelInfo {
        id: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash-Lite",
        group: ProviderGroup::Gemini,
        input_token_limit: 1_048_576,
        output_token_limit: 65_536,
    },
];

pub fn models_for(group: ProviderGroup) -> impl Iterator<Item = &'static ModelInfo> {
    CATALOG.iter().filter(move |m| m.group == group)
}

/// Look up a Gemini model by bare id or `models/<id>`.
#[must_use]
pub fn find_gemini_model(name: &str) -> Option<&'static ModelInfo> {
    let id = name.strip_prefix("models/").unwrap_or(name);
    models_for(ProviderGroup::Gemini).find(|m| m.id == id)
}

/// `GET /v1/models` in the Anthropic list shape.
#[must_use]
pub fn claude_model_list() -> Value {
    let data: Vec<Value> = models_for(ProviderGroup::Claude)
        .map(|m| {
            json!({
                "id": m.id,
                "type": "model",
                "display_name": m.display_name,
            })
        })
        .collect();
    json!({
        "data": data,
        "has_more": false,
        "first_id": data.first().map(|m| m["id"].clone()),
        "last_id": data.last().map(|m| m["id"].clone()),
    })
}

pub fn gemini_model_json(model: &ModelInfo) -> Value {
    json!({
        "name": format!("models/{}", model.id),
        "displayName": model.display_name,
        "inputTokenLimit": model.input_token_limit,
        "outputTokenLimit": model.output_token_limit,
        "supportedGenerationMethods": ["generateContent", "streamGenerateContent", "countTokens"],
    })
}

/// `GET /v1beta/models` in the Gemini list shape.
#[must_use]
pub fn gemini_model_list() -> Value {
    let models: Vec<Value> = models_for(ProviderGroup::Gemini)
        .map(gemini_model_json)
        .collect();
    json!({ "models": models })
}
