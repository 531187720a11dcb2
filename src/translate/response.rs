//! Translate completed native responses into OpenAI Chat Completions responses.

use super::claude_types::{ClaudeResponse, ResponseBlock};
use super::gemini_types::GeminiResponse;
use super::openai_types::{
    ChatCompletionResponse, ChatToolCall, ChatToolCallFunction, ChatUsage, Choice, ChoiceMessage,
};

/// Map a Claude `stop_reason` to an OpenAI `finish_reason`.
pub fn map_stop_reason(reason: &str) -> Option<String> {
    let mapped = match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => return None,
    };
    Some(mapped.to_string())
}

/// Map a Gemini `finishReason`. Only `STOP` has a true equivalent; the rest are
/// passed through lower-cased.
pub fn map_gemini_finish(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        other => other.to_lowercase(),
    }
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

fn tool_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn message(text: String, tool_calls: Vec<ChatToolCall>) -> ChoiceMessage {
    ChoiceMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    }
}

pub fn claude_to_openai(resp: &ClaudeResponse, requested_model: &str) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &resp.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(t),
            ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: serde_json::to_string(input).unwrap_or_default(),
                },
            }),
            ResponseBlock::Other => {}
        }
    }

    let usage = resp
        .usage
        .map(|u| ChatUsage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    ChatCompletionResponse {
        id: if resp.id.is_empty() {
            completion_id()
        } else {
            resp.id.clone()
        },
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: if resp.model.is_empty() {
            requested_model.to_string()
        } else {
            resp.model.clone()
        },
        choices: vec![Choice {
            index: 0,
            message: message(text, tool_calls),
            finish_reason: resp.stop_reason.as_deref().and_then(map_stop_reason),
        }],
        usage,
    }
}

pub fn gemini_to_openai(resp: &GeminiResponse, requested_model: &str) -> ChatCompletionResponse {
    let tool_calls: Vec<ChatToolCall> = resp
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.function_call.as_ref())
                .map(|call| ChatToolCall {
                    id: tool_call_id(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: call.name.clone(),
                        arguments: serde_json::to_string(&call.args).unwrap_or_default(),
                    },
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = resp.first_finish_reason().map(map_gemini_finish);

    let usage = resp.usage_metadata.unwrap_or_default();

    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: requested_model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: message(resp.first_text(), tool_calls),
            finish_reason,
        }],
        usage: ChatUsage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::ChatCompletionRequest;
    use crate::translate::request::openai_to_claude;
    use serde_json::json;

    #[test]
    fn test_stop_reason_table() {
        assert_eq!(map_stop_reason("end_turn").as_deref(), Some("stop"));
        assert_eq!(map_stop_reason("max_tokens").as_deref(), Some("length"));
        assert_eq!(map_stop_reason("tool_use").as_deref(), Some("tool_calls"));
        assert_eq!(map_stop_reason("refusal"), None);
        assert_eq!(map_stop_reason("stop_sequence"), None);
        assert_eq!(map_gemini_finish("STOP"), "stop");
        assert_eq!(map_gemini_finish("MAX_TOKENS"), "max_tokens");
        assert_eq!(map_gemini_finish("SAFETY"), "safety");
    }

    #[test]
    fn test_claude_response_to_openai() {
        let resp: ClaudeResponse = serde_json::from_value(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "thinking", "thinking": "...", "signature": "s"},
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " there"},
                {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();

        let out = claude_to_openai(&resp, "claude-sonnet-4-5");
        assert_eq!(out.id, "msg_01");
        assert_eq!(out.object, "chat.completion");
        let choice = &out.choices[0];
        assert_eq!(choice.message.role, "assistant");
        assert_eq!(choice.message.content.as_deref(), Some("Hello there"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.arguments, r#"{"q":"x"}"#);
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(out.usage, ChatUsage::new(10, 5));
        assert_eq!(out.usage.total_tokens, 15);
    }

    #[test]
    fn test_empty_claude_text_is_null() {
        let resp: ClaudeResponse =
            serde_json::from_value(json!({"id": "m", "content": [], "stop_reason": "weird"})).unwrap();
        let out = claude_to_openai(&resp, "claude-x");
        assert_eq!(out.model, "claude-x");
        assert!(out.choices[0].message.content.is_none());
        assert!(out.choices[0].finish_reason.is_none());
        assert_eq!(out.usage, ChatUsage::default());
    }

    #[test]
    fn test_gemini_response_to_openai() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Bonjour"}, {"text": "!"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10}
        }))
        .unwrap();

        let out = gemini_to_openai(&resp, "gemini-2.5-pro");
        assert!(out.id.starts_with("chatcmpl-"));
        assert_eq!(out.model, "gemini-2.5-pro");
        assert_eq!(out.choices[0].message.content.as_deref(), Some("Bonjour!"));
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("max_tokens"));
        assert_eq!(out.usage.prompt_tokens, 7);
        assert_eq!(out.usage.completion_tokens, 3);
        assert_eq!(out.usage.total_tokens, 10);
    }

    #[test]
    fn test_gemini_missing_usage_defaults_to_zero() {
        let resp: GeminiResponse = serde_json::from_value(json!({"candidates": []})).unwrap();
        let out = gemini_to_openai(&resp, "gemini-x");
        assert_eq!(out.usage, ChatUsage::default());
        assert!(out.choices[0].message.content.is_none());
        assert!(out.choices[0].finish_reason.is_none());
    }

    #[test]
    fn test_gemini_function_call_surfaces_as_tool_call() {
        let resp: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}
                ]},
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        let out = gemini_to_openai(&resp, "gemini-x");
        let calls = out.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_plain_text_round_trip_through_claude() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "Say hi"}],
            "temperature": 0.5
        }))
        .unwrap();

        let native = openai_to_claude(&req);
        assert_eq!(native.temperature, Some(0.5));
        assert_eq!(native.messages.len(), 1);
        let wire = serde_json::to_value(&native).unwrap();
        assert_eq!(wire["messages"][0], json!({"role": "user", "content": "Say hi"}));
        assert_eq!(wire["temperature"], 0.5);

        let reply: ClaudeResponse = serde_json::from_value(json!({
            "id": "msg_1", "role": "assistant", "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        }))
        .unwrap();
        let out = claude_to_openai(&reply, &req.model);
        assert_eq!(out.choices[0].message.role, "assistant");
        assert_eq!(out.choices[0].message.content.as_deref(), Some("hi"));
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}
