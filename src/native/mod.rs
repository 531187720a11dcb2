//! Native-dialect handlers.
//!
//! Each handler takes an already-parsed native request, runs it through the
//! dispatcher and returns an [`ApiResponse`]: a status, headers and either a
//! JSON value or a live byte stream. The OpenAI handler reuses these directly.

pub mod claude;
pub mod gemini;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::accounts::ProviderGroup;
use crate::dispatch::{UpstreamBody, UpstreamReply};
use crate::error::{GatewayError, Result};
use crate::logging::SharedLogger;
use crate::translate::streaming::{passthrough_stream, SseByteStream};

pub enum ApiBody {
    Json(serde_json::Value),
    Stream(SseByteStream),
}

impl std::fmt::Debug for ApiBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiBody::Json(value) => f.debug_tuple("Json").field(value).finish(),
            ApiBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ApiBody,
}

impl ApiResponse {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ApiBody::Json(value),
        }
    }

    pub fn event_stream(stream: SseByteStream) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        Self {
            status: StatusCode::OK,
            headers,
            body: ApiBody::Stream(stream),
        }
    }

    /// Wrap a successful upstream reply without reinterpreting it.
    pub fn from_upstream(reply: UpstreamReply, group: ProviderGroup, logger: &SharedLogger) -> Result<Self> {
        let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
        match reply.body {
            UpstreamBody::Full(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
                    GatewayError::other(format!("Upstream {group} returned non-JSON body: {e}"))
                })?;
                Ok(Self {
                    status,
                    ..Self::json(value)
                })
            }
            UpstreamBody::Stream(stream) => Ok(Self {
                status,
                ..Self::event_stream(passthrough_stream(stream, group, logger.clone()))
            }),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.body, ApiBody::Stream(_))
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            ApiBody::Json(value) => (self.status, Json(value)).into_response(),
            ApiBody::Stream(stream) => (self.status, Body::from_stream(stream)).into_response(),
        };
        response.headers_mut().extend(self.headers);
        response
    }
}
