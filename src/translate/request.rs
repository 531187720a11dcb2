//! Translate OpenAI Chat Completions requests into native Claude and Gemini requests.
//!
//! System messages are lifted out of the conversation, every other role
//! collapses onto the two-party user/assistant shape, and function tools are
//! re-declared in each dialect's vocabulary. Images must arrive as base64 data
//! URLs; remote image URLs are replaced with a short text note.

use std::collections::HashMap;

use super::claude_types::{
    ClaudeBlock, ClaudeContent, ClaudeMessage, ClaudeRequest, ClaudeRole, ClaudeTool,
    ClaudeToolChoice, ImageSource,
};
use super::gemini_types::{
    FunctionCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse, GeminiContent,
    GeminiPart, GeminiRequest, GeminiTool, GenerationConfig, InlineData, SystemInstruction,
    ToolConfig,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool, ChatToolChoice,
    ContentPart,
};

/// Text substituted for an image given by remote URL.
pub const IMAGE_URL_PLACEHOLDER: &str = "[Image URL not supported directly]";

/// Claude insists on `max_tokens`; OpenAI clients often omit it.
pub const DEFAULT_CLAUDE_MAX_TOKENS: u64 = 4096;

/// Split `data:<mime>;base64,<payload>` into `(mime, payload)`.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn function_tools(tools: Option<&Vec<ChatTool>>) -> Vec<&ChatFunction> {
    tools
        .map(|tools| {
            tools
                .iter()
                .filter(|t| t.tool_type == "function")
                .filter_map(|t| t.function.as_ref())
                .collect()
        })
        .unwrap_or_default()
}

fn system_texts(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_ref().map(ChatContent::text).unwrap_or_default())
        .collect()
}

fn arguments_to_value(arguments: &str) -> serde_json::Value {
    serde_json::from_str(arguments)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
}

// ---------------------------------------------------------------------------
// OpenAI -> Claude
// ---------------------------------------------------------------------------

pub fn openai_to_claude(req: &ChatCompletionRequest) -> ClaudeRequest {
    let system = system_texts(&req.messages);
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n"))
    };

    let messages = req
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(claude_message)
        .collect();

    let tools: Vec<ClaudeTool> = function_tools(req.tools.as_ref())
        .into_iter()
        .map(|f| ClaudeTool {
            name: f.name.clone(),
            description: f.description.clone(),
            input_schema: f
                .parameters
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
        .collect();

    ClaudeRequest {
        model: req.model.clone(),
        max_tokens: req.output_limit().unwrap_or(DEFAULT_CLAUDE_MAX_TOKENS),
        messages,
        system,
        stream: req.is_stream(),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: req.tool_choice.as_ref().and_then(claude_tool_choice),
    }
}

fn claude_message(msg: &ChatMessage) -> ClaudeMessage {
    if msg.role == "tool" {
        return ClaudeMessage {
            role: ClaudeRole::User,
            content: ClaudeContent::Blocks(vec![ClaudeBlock::ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: msg.content.as_ref().map(ChatContent::text).unwrap_or_default(),
            }]),
        };
    }

    let role = if msg.role == "assistant" {
        ClaudeRole::Assistant
    } else {
        ClaudeRole::User
    };

    let tool_calls = msg.tool_calls.as_deref().unwrap_or_default();
    let content = match (&msg.content, tool_calls.is_empty()) {
        (Some(ChatContent::Text(text)), true) => ClaudeContent::Text(text.clone()),
        (None, true) => ClaudeContent::Text(String::new()),
        (content, _) => {
            let mut blocks = match content {
                Some(ChatContent::Text(text)) if !text.is_empty() => {
                    vec![ClaudeBlock::Text { text: text.clone() }]
                }
                Some(ChatContent::Parts(parts)) => parts.iter().filter_map(claude_block).collect(),
                _ => Vec::new(),
            };
            blocks.extend(tool_calls.iter().map(|call| ClaudeBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: arguments_to_value(&call.function.arguments),
            }));
            ClaudeContent::Blocks(blocks)
        }
    };

    ClaudeMessage { role, content }
}

fn claude_block(part: &ContentPart) -> Option<ClaudeBlock> {
    match part {
        ContentPart::Text { text } => Some(ClaudeBlock::Text { text: text.clone() }),
        ContentPart::ImageUrl { image_url } => Some(match parse_data_url(&image_url.url) {
            Some((media_type, data)) => ClaudeBlock::Image {
                source: ImageSource {
                    source_type: "base64".to_string(),
                    media_type,
                    data,
                },
            },
            None => ClaudeBlock::Text {
                text: IMAGE_URL_PLACEHOLDER.to_string(),
            },
        }),
        ContentPart::Unsupported => None,
    }
}

/// `none` and `required` both become `any`: Claude has no "never call a tool"
/// choice, so this is an approximation.
fn claude_tool_choice(choice: &ChatToolChoice) -> Option<ClaudeToolChoice> {
    match choice {
        ChatToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(ClaudeToolChoice::Auto),
            "none" | "required" => Some(ClaudeToolChoice::Any),
            _ => None,
        },
        ChatToolChoice::Function(f) => Some(ClaudeToolChoice::Tool {
            name: f.function.name.clone(),
        }),
    }
}

// ---------------------------------------------------------------------------
// OpenAI -> Gemini
// ---------------------------------------------------------------------------

pub fn openai_to_gemini(req: &ChatCompletionRequest) -> GeminiRequest {
    let system_parts: Vec<GeminiPart> = system_texts(&req.messages)
        .into_iter()
        .map(GeminiPart::text)
        .collect();

    // functionResponse needs the function name, OpenAI tool messages only carry the call id.
    let call_names: HashMap<&str, &str> = req
        .messages
        .iter()
        .filter_map(|m| m.tool_calls.as_ref())
        .flatten()
        .map(|call| (call.id.as_str(), call.function.name.as_str()))
        .collect();

    let contents = req
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| gemini_content(m, &call_names))
        .filter(|c| !c.parts.is_empty())
        .collect();

    let declarations: Vec<FunctionDeclaration> = function_tools(req.tools.as_ref())
        .into_iter()
        .map(|f| FunctionDeclaration {
            name: f.name.clone(),
            description: f.description.clone(),
            parameters: f.parameters.clone(),
        })
        .collect();
    let tools = if declarations.is_empty() {
        Vec::new()
    } else {
        vec![GeminiTool {
            function_declarations: declarations,
        }]
    };

    GeminiRequest {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(SystemInstruction {
                parts: system_parts,
            })
        },
        generation_config: GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_output_tokens: req.output_limit(),
            stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
        },
        tools,
        tool_config: req.tool_choice.as_ref().and_then(gemini_tool_config),
    }
}

fn gemini_content(msg: &ChatMessage, call_names: &HashMap<&str, &str>) -> GeminiContent {
    if msg.role == "tool" {
        let name = msg
            .name
            .clone()
            .or_else(|| {
                msg.tool_call_id
                    .as_deref()
                    .and_then(|id| call_names.get(id))
                    .map(|name| name.to_string())
            })
            .unwrap_or_default();
        let output = msg.content.as_ref().map(ChatContent::text).unwrap_or_default();
        return GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                function_response: Some(FunctionResponse {
                    name,
                    response: serde_json::json!({ "content": output }),
                }),
                ..GeminiPart::default()
            }],
        };
    }

    let role = if msg.role == "assistant" { "model" } else { "user" };

    let mut parts: Vec<GeminiPart> = match &msg.content {
        Some(ChatContent::Text(text)) if !text.is_empty() => vec![GeminiPart::text(text.clone())],
        Some(ChatContent::Parts(parts)) => parts.iter().filter_map(gemini_part).collect(),
        _ => Vec::new(),
    };
    if let Some(calls) = &msg.tool_calls {
        parts.extend(calls.iter().map(|call| GeminiPart {
            function_call: Some(FunctionCall {
                name: call.function.name.clone(),
                args: arguments_to_value(&call.function.arguments),
            }),
            ..GeminiPart::default()
        }));
    }

    GeminiContent {
        role: role.to_string(),
        parts,
    }
}

fn gemini_part(part: &ContentPart) -> Option<GeminiPart> {
    match part {
        ContentPart::Text { text } => Some(GeminiPart::text(text.clone())),
        ContentPart::ImageUrl { image_url } => Some(match parse_data_url(&image_url.url) {
            Some((mime_type, data)) => GeminiPart {
                inline_data: Some(InlineData { mime_type, data }),
                ..GeminiPart::default()
            },
            None => GeminiPart::text(IMAGE_URL_PLACEHOLDER),
        }),
        ContentPart::Unsupported => None,
    }
}

fn gemini_tool_config(choice: &ChatToolChoice) -> Option<ToolConfig> {
    let (mode, allowed) = match choice {
        ChatToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => ("AUTO", None),
            "none" => ("NONE", None),
            "required" => ("ANY", None),
            _ => return None,
        },
        ChatToolChoice::Function(f) => ("ANY", Some(vec![f.function.name.clone()])),
    };
    Some(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    })
}
