//! Re-framing of native event streams into OpenAI streaming chunks.
//!
//! Upstream bytes arrive in arbitrary pieces. [`SseLineDecoder`] keeps the one
//! trailing partial line between reads, so only newline-terminated lines are
//! ever interpreted. [`StreamSession`] turns each `data:` payload into at most
//! one `chat.completion.chunk`, every chunk sharing one id and one timestamp,
//! and guarantees exactly one `[DONE]` on the success path.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

use super::claude_types::{ClaudeDelta, ClaudeStreamEvent};
use super::gemini_types::GeminiResponse;
use super::openai_types::{ChatCompletionChunk, ChatUsage, ChunkChoice, ChunkDelta};
use super::response::{completion_id, map_gemini_finish, map_stop_reason};
use crate::accounts::ProviderGroup;
use crate::dispatch::ByteStream;
use crate::error::{GatewayError, Result};
use crate::logging::SharedLogger;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest line we are willing to hold while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// What the HTTP layer sends to the client: SSE bytes, or an error that aborts
/// the response instead of closing it cleanly.
pub type SseByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Splits a byte stream into complete lines, carrying the incomplete tail over
/// to the next read.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    carry: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line that is now complete, without its
    /// terminator (`\n` or `\r\n`).
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.carry.extend_from_slice(bytes);

        let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
            self.check_carry()?;
            return Ok(Vec::new());
        };

        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);
        self.check_carry()?;

        complete[..last_newline]
            .split(|b| *b == b'\n')
            .map(|line| {
                if line.len() > MAX_LINE_BYTES {
                    return Err(line_too_long());
                }
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                Ok(String::from_utf8_lossy(line).into_owned())
            })
            .collect()
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    fn check_carry(&self) -> Result<()> {
        if self.carry.len() > MAX_LINE_BYTES {
            return Err(line_too_long());
        }
        Ok(())
    }
}

fn line_too_long() -> GatewayError {
    GatewayError::stream_abort(format!(
        "Upstream event line exceeded {MAX_LINE_BYTES} bytes without a newline"
    ))
}

/// The payload of a `data:` line, with or without the space after the colon.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

pub fn sse_frame(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

/// Per-response state for turning one native stream into OpenAI chunks.
#[derive(Debug)]
pub struct StreamSession {
    dialect: ProviderGroup,
    id: String,
    created: i64,
    model: String,
    decoder: SseLineDecoder,
    done_sent: bool,
    prompt_tokens: u64,
}

impl StreamSession {
    pub fn new(dialect: ProviderGroup, model: impl Into<String>) -> Self {
        Self {
            dialect,
            id: completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            decoder: SseLineDecoder::new(),
            done_sent: false,
            prompt_tokens: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> i64 {
        self.created
    }

    /// True once `[DONE]` has gone out; anything after it is dropped.
    pub fn is_closed(&self) -> bool {
        self.done_sent
    }

    /// Consume one upstream read and return the frames to forward.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        if self.done_sent {
            return Ok(frames);
        }

        for line in self.decoder.push(bytes)? {
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            if payload == DONE_SENTINEL {
                frames.push(sse_frame(DONE_SENTINEL));
                self.done_sent = true;
                break;
            }
            if payload.is_empty() {
                continue;
            }
            if let Some(chunk) = self.translate(payload)? {
                frames.push(sse_frame(&serde_json::to_string(&chunk)?));
            }
        }
        Ok(frames)
    }

    /// The closing `[DONE]`, unless one was already forwarded.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.done_sent {
            return None;
        }
        if self.decoder.pending() > 0 {
            tracing::debug!(
                bytes = self.decoder.pending(),
                "Discarding unterminated trailing line at end of stream"
            );
        }
        self.done_sent = true;
        Some(sse_frame(DONE_SENTINEL))
    }

    fn translate(&mut self, payload: &str) -> Result<Option<ChatCompletionChunk>> {
        match self.dialect {
            ProviderGroup::Claude => match serde_json::from_str::<ClaudeStreamEvent>(payload) {
                Ok(event) => self.claude_event(event),
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping undecodable Claude stream frame");
                    Ok(None)
                }
            },
            ProviderGroup::Gemini => match decode_gemini_chunk(payload) {
                Some(chunk) => Ok(self.gemini_chunk(&chunk)),
                None => {
                    tracing::debug!("Dropping undecodable Gemini stream frame");
                    Ok(None)
                }
            },
        }
    }

    fn claude_event(&mut self, event: ClaudeStreamEvent) -> Result<Option<ChatCompletionChunk>> {
        let chunk = match event {
            ClaudeStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.prompt_tokens = usage.input_tokens;
                }
                Some(self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                    },
                    None,
                    None,
                ))
            }
            ClaudeStreamEvent::ContentBlockDelta {
                delta: ClaudeDelta::TextDelta { text },
                ..
            } => Some(self.chunk(
                ChunkDelta {
                    role: None,
                    content: Some(text),
                },
                None,
                None,
            )),
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                let finish = delta.stop_reason.as_deref().and_then(map_stop_reason);
                let usage = usage.map(|u| {
                    ChatUsage::new(self.prompt_tokens.max(u.input_tokens), u.output_tokens)
                });
                if finish.is_none() && usage.is_none() {
                    None
                } else {
                    Some(self.chunk(ChunkDelta::default(), finish, usage))
                }
            }
            ClaudeStreamEvent::Error { error } => {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(GatewayError::stream_abort(format!(
                    "Upstream stream error: {message}"
                )));
            }
            _ => None,
        };
        Ok(chunk)
    }

    fn gemini_chunk(&self, resp: &GeminiResponse) -> Option<ChatCompletionChunk> {
        let text = resp.first_text();
        let finish = resp.first_finish_reason().map(map_gemini_finish);
        if text.is_empty() && finish.is_none() {
            return None;
        }

        let usage = finish.as_ref().and(resp.usage_metadata).map(|u| ChatUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });
        let delta = ChunkDelta {
            role: None,
            content: if text.is_empty() { None } else { Some(text) },
        };
        Some(self.chunk(delta, finish, usage))
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<ChatUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

fn decode_gemini_chunk(payload: &str) -> Option<GeminiResponse> {
    GeminiResponse::from_value(serde_json::from_str(payload).ok()?).ok()
}

/// Re-frame a native stream as OpenAI chunks.
///
/// `upstream` is the output of [`passthrough_stream`], which has already
/// logged any read failure; those are forwarded as-is. Only failures raised
/// while translating are logged here.
///
/// The stream is pulled one read at a time; dropping the returned stream
/// (client went away) drops the upstream body with it.
pub fn openai_chunk_stream<S>(
    upstream: S,
    dialect: ProviderGroup,
    model: String,
    logger: SharedLogger,
) -> SseByteStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut session = StreamSession::new(dialect, model);
        let mut upstream = Box::pin(upstream);
        let mut failed = false;

        while let Some(item) = upstream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(err) => {
                    failed = true;
                    yield Err(err);
                    break;
                }
            };
            match session.feed(&bytes) {
                Ok(frames) => {
                    for frame in frames {
                        yield Ok(frame);
                    }
                }
                Err(err) => {
                    tracing::warn!(provider = %dialect, error = %err, "Stream aborted");
                    logger.error("stream", format!("{dialect} stream aborted: {err}"));
                    failed = true;
                    yield Err(err);
                    break;
                }
            }
            if session.is_closed() {
                break;
            }
        }

        if !failed {
            if let Some(done) = session.finish() {
                yield Ok(done);
            }
        }
    })
}

/// Forward a native stream untouched, turning read failures into stream aborts.
pub fn passthrough_stream(upstream: ByteStream, dialect: ProviderGroup, logger: SharedLogger) -> SseByteStream {
    Box::pin(upstream.map(move |item| {
        item.map_err(|e| {
            tracing::warn!(provider = %dialect, error = %e, "Passthrough stream aborted");
            logger.error("stream", format!("{dialect} stream aborted: {e}"));
            GatewayError::stream_abort(format!("Upstream read failed: {e}"))
        })
    }))
}
