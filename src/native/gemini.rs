//! Native Gemini generate-content surface.

use bytes::Bytes;

use super::ApiResponse;
use crate::accounts::ProviderGroup;
use crate::dispatch::{UpstreamCall, UpstreamDispatcher};
use crate::error::{GatewayError, Result};
use crate::models;

pub const GENERATE: &str = "generateContent";
pub const STREAM_GENERATE: &str = "streamGenerateContent";
pub const COUNT_TOKENS: &str = "countTokens";

fn model_path(model: &str, method: &str) -> Result<String> {
    let model = model.strip_prefix("models/").unwrap_or(model);
    if model.is_empty() || model.contains('/') {
        return Err(GatewayError::invalid_request(format!("Invalid model name: {model}")));
    }
    Ok(format!("/v1beta/models/{model}:{method}"))
}

fn ensure_json(body: &Bytes) -> Result<()> {
    serde_json::from_slice::<serde_json::Value>(body)
        .map(|_| ())
        .map_err(|e| GatewayError::invalid_request(format!("Invalid JSON body: {e}")))
}

/// `POST /v1beta/models/{model}:{generateContent|streamGenerateContent}`.
///
/// Client query parameters are forwarded except `key`, which is the gateway's
/// own API key. Streaming always asks upstream for `alt=sse`.
pub async fn handle_generate(
    dispatcher: &UpstreamDispatcher,
    model: &str,
    method: &str,
    body: Bytes,
    query: &[(String, String)],
) -> Result<ApiResponse> {
    let stream = match method {
        GENERATE => false,
        STREAM_GENERATE => true,
        other => {
            return Err(GatewayError::not_found(format!("Unknown Gemini method: {other}")));
        }
    };
    ensure_json(&body)?;

    let mut call = UpstreamCall::new(ProviderGroup::Gemini, model_path(model, method)?, body)
        .streaming(stream);
    for (key, value) in query {
        if key == "key" || (stream && key == "alt") {
            continue;
        }
        call = call.with_query(key.clone(), value.clone());
    }
    if stream {
        call = call.with_query("alt", "sse");
    }

    let reply = dispatcher.dispatch(&call).await?;
    ApiResponse::from_upstream(reply, ProviderGroup::Gemini, dispatcher.logger())
}

/// `POST /v1beta/models/{model}:countTokens`.
pub async fn handle_count_tokens(
    dispatcher: &UpstreamDispatcher,
    model: &str,
    body: Bytes,
) -> Result<ApiResponse> {
    ensure_json(&body)?;
    let call = UpstreamCall::new(ProviderGroup::Gemini, model_path(model, COUNT_TOKENS)?, body);
    let reply = dispatcher.dispatch(&call).await?;
    ApiResponse::from_upstream(reply, ProviderGroup::Gemini, dispatcher.logger())
}

/// `GET /v1beta/models`.
pub fn handle_list_models() -> ApiResponse {
    ApiResponse::json(models::gemini_model_list())
}

/// `GET /v1beta/models/{name}`.
pub fn handle_get_model(name: &str) -> Result<ApiResponse> {
    models::find_gemini_model(name)
        .map(|model| ApiResponse::json(models::gemini_model_json(model)))
        .ok_or_else(|| GatewayError::not_found(format!("Model {name} not found")))
}
