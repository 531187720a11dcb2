//! Native Claude Messages surface.

use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;

use super::ApiResponse;
use crate::accounts::ProviderGroup;
use crate::dispatch::{UpstreamCall, UpstreamDispatcher, ANTHROPIC_OAUTH_BETA};
use crate::error::{GatewayError, Result};
use crate::models;

/// Client `anthropic-beta` flags are kept; the OAuth flag is always added.
fn beta_header(client_headers: &HeaderMap) -> Option<HeaderValue> {
    let client = client_headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;
    if client.split(',').any(|flag| flag.trim() == ANTHROPIC_OAUTH_BETA) {
        return HeaderValue::from_str(client).ok();
    }
    HeaderValue::from_str(&format!("{ANTHROPIC_OAUTH_BETA},{client}")).ok()
}

fn messages_call(path: &str, body: Bytes, client_headers: &HeaderMap) -> Result<UpstreamCall> {
    let parsed: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid JSON body: {e}")))?;
    if parsed.get("model").and_then(|m| m.as_str()).is_none() {
        return Err(GatewayError::invalid_request("Model is required"));
    }
    let stream = parsed
        .get("stream")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let mut call = UpstreamCall::new(ProviderGroup::Claude, path, body).streaming(stream);
    if let Some(beta) = beta_header(client_headers) {
        call = call.with_header(axum::http::HeaderName::from_static("anthropic-beta"), beta);
    }
    Ok(call)
}

/// `POST /v1/messages`. The body is forwarded as sent.
pub async fn handle_messages(
    dispatcher: &UpstreamDispatcher,
    body: Bytes,
    client_headers: &HeaderMap,
) -> Result<ApiResponse> {
    let call = messages_call("/v1/messages", body, client_headers)?;
    let reply = dispatcher.dispatch(&call).await?;
    ApiResponse::from_upstream(reply, ProviderGroup::Claude, dispatcher.logger())
}

/// `POST /v1/messages/count_tokens`.
pub async fn handle_count_tokens(
    dispatcher: &UpstreamDispatcher,
    body: Bytes,
    client_headers: &HeaderMap,
) -> Result<ApiResponse> {
    let call = messages_call("/v1/messages/count_tokens", body, client_headers)?.streaming(false);
    let reply = dispatcher.dispatch(&call).await?;
    ApiResponse::from_upstream(reply, ProviderGroup::Claude, dispatcher.logger())
}

/// `GET /v1/models`.
pub fn handle_list_models() -> ApiResponse {
    ApiResponse::json(models::claude_model_list())
}
