//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::accounts::ProviderGroup;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid API Key")]
    Unauthorized,

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("No {group} accounts available{}", last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    NoAccountsAvailable {
        group: ProviderGroup,
        last_error: Option<String>,
    },

    #[error("Upstream unavailable after retries: {last_error}")]
    UpstreamUnavailable { last_error: String },

    /// A non-retryable 4xx from upstream, surfaced to the caller as-is.
    #[error("Upstream rejected request with status {status}")]
    UpstreamRejected { status: u16, body: String },

    #[error("Stream aborted: {message}")]
    StreamAbort { message: String },

    #[error("OAuth error: {message}")]
    OAuth { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal (de)serialization failure. Client bodies that fail to parse
    /// are reported as `InvalidRequest` at the parse site instead.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    pub fn stream_abort(msg: impl Into<String>) -> Self {
        Self::StreamAbort {
            message: msg.into(),
        }
    }

    pub fn oauth(msg: impl Into<String>) -> Self {
        Self::OAuth {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoAccountsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::OAuth { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::Unauthorized => "authentication_error",
            Self::NotFound { .. } => "not_found_error",
            Self::NoAccountsAvailable { .. } | Self::UpstreamUnavailable { .. } => {
                "overloaded_error"
            }
            Self::UpstreamRejected { .. } => "upstream_error",
            Self::OAuth { .. } => "oauth_error",
            _ => "api_error",
        }
    }

    /// The message shown to the client. Internal failures never leak detail.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest { .. }
            | Self::Unauthorized
            | Self::NotFound { .. }
            | Self::NoAccountsAvailable { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::OAuth { .. } => self.to_string(),
            Self::UpstreamRejected { body, .. } => body.clone(),
            _ => "Internal Server Error".to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "{}", self);
        }

        // Upstream JSON errors pass through untouched.
        if let Self::UpstreamRejected { ref body, .. } = self {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
                return (status, Json(value)).into_response();
            }
        }

        let body = serde_json::json!({
            "error": {
                "message": self.public_message(),
                "type": self.error_type(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Clip upstream text for error messages, on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
