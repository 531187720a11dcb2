//! OpenAI-compatible chat completions on top of the native handlers.
//!
//! The model name picks the provider group, the request is translated into
//! that group's native shape, and the native reply (JSON or event stream) is
//! translated back. Nothing is dispatched for an unroutable model.

use axum::http::HeaderMap;
use bytes::Bytes;

use crate::accounts::ProviderGroup;
use crate::dispatch::UpstreamDispatcher;
use crate::error::{GatewayError, Result};
use crate::native::{self, ApiBody, ApiResponse};
use crate::translate::claude_types::ClaudeResponse;
use crate::translate::gemini_types::GeminiResponse;
use crate::translate::openai_types::ChatCompletionRequest;
use crate::translate::request::{openai_to_claude, openai_to_gemini};
use crate::translate::response::{claude_to_openai, gemini_to_openai};
use crate::translate::streaming::openai_chunk_stream;

/// Parse and route a `POST /v1/chat/completions` body.
pub async fn handle_chat_completions(dispatcher: &UpstreamDispatcher, body: &[u8]) -> Result<ApiResponse> {
    let req: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid JSON body: {e}")))?;
    chat_completions(dispatcher, &req).await
}

pub async fn chat_completions(
    dispatcher: &UpstreamDispatcher,
    req: &ChatCompletionRequest,
) -> Result<ApiResponse> {
    if req.model.trim().is_empty() {
        return Err(GatewayError::invalid_request("Model is required"));
    }
    let group = ProviderGroup::for_model(&req.model).ok_or_else(|| {
        GatewayError::invalid_request(format!("Unsupported model prefix: {}", req.model))
    })?;

    tracing::debug!(
        provider = %group,
        model = %req.model,
        stream = req.is_stream(),
        messages = req.messages.len(),
        "OpenAI chat completion"
    );

    match group {
        ProviderGroup::Claude => claude_completion(dispatcher, req).await,
        ProviderGroup::Gemini => gemini_completion(dispatcher, req).await,
    }
}

async fn claude_completion(
    dispatcher: &UpstreamDispatcher,
    req: &ChatCompletionRequest,
) -> Result<ApiResponse> {
    let native_req = openai_to_claude(req);
    let body = Bytes::from(serde_json::to_vec(&native_req)?);
    let reply = native::claude::handle_messages(dispatcher, body, &HeaderMap::new()).await?;
    translate_reply(dispatcher, reply, ProviderGroup::Claude, &req.model)
}

async fn gemini_completion(
    dispatcher: &UpstreamDispatcher,
    req: &ChatCompletionRequest,
) -> Result<ApiResponse> {
    let native_req = openai_to_gemini(req);
    let body = Bytes::from(serde_json::to_vec(&native_req)?);
    let method = if req.is_stream() {
        native::gemini::STREAM_GENERATE
    } else {
        native::gemini::GENERATE
    };
    let reply = native::gemini::handle_generate(dispatcher, &req.model, method, body, &[]).await?;
    translate_reply(dispatcher, reply, ProviderGroup::Gemini, &req.model)
}

fn translate_reply(
    dispatcher: &UpstreamDispatcher,
    reply: ApiResponse,
    group: ProviderGroup,
    model: &str,
) -> Result<ApiResponse> {
    match reply.body {
        ApiBody::Stream(stream) => Ok(ApiResponse::event_stream(openai_chunk_stream(
            stream,
            group,
            model.to_string(),
            dispatcher.logger().clone(),
        ))),
        ApiBody::Json(value) => {
            let unexpected =
                |e: serde_json::Error| GatewayError::other(format!("Unexpected {group} response: {e}"));
            let translated = match group {
                ProviderGroup::Claude => {
                    let resp: ClaudeResponse = serde_json::from_value(value).map_err(unexpected)?;
                    claude_to_openai(&resp, model)
                }
                ProviderGroup::Gemini => {
                    let resp = GeminiResponse::from_value(value).map_err(unexpected)?;
                    gemini_to_openai(&resp, model)
                }
            };
            Ok(ApiResponse::json(serde_json::to_value(translated)?))
        }
    }
}
