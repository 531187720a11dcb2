use crate::accounts::{AccountPools, AccountRotator, CooldownPolicy, CredentialStore, ProviderGroup, TokenClient};
use crate::config::GatewayConfig;
use crate::dispatch::{RetryPolicy, UpstreamDispatcher};
use crate::error::{GatewayError, Result};
use crate::logging::SharedLogger;
use crate::native::{self, ApiResponse};
use crate::oauth::OAuthFlow;
use crate::providers::ProviderEndpoints;
use crate::proxy;

use axum::extract::{Path, Query, RawQuery, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

/// The shared upstream client. It has no total deadline, because streamed
/// replies may run far past one. Non-stream calls get `request_timeout_secs`
/// per request in the dispatcher.
pub fn upstream_client(config: &GatewayConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_idle_timeout())
        .build()
}

pub struct AppState {
    pub config: GatewayConfig,
    pub dispatcher: Arc<UpstreamDispatcher>,
    pub store: Arc<CredentialStore>,
    pub oauth: Arc<OAuthFlow>,
    pub logger: SharedLogger,
}

impl AppState {
    /// Wire the account layer, dispatcher and OAuth flow from config. Accounts
    /// are not loaded yet; call `store.load()` before serving.
    pub fn build(config: GatewayConfig, http: reqwest::Client, logger: SharedLogger) -> Self {
        let pools = Arc::new(AccountPools::new());
        let tokens = TokenClient::new(http.clone(), Duration::from_secs(config.refresh.timeout_secs));
        let store = Arc::new(
            CredentialStore::new(
                config.auth_dir.clone(),
                Arc::clone(&pools),
                tokens,
                ProviderEndpoints::from_config(&config),
                logger.clone(),
            )
            .with_refresh_margin(Duration::from_secs(config.refresh.margin_secs)),
        );
        let rotator = Arc::new(AccountRotator::new(
            pools,
            CooldownPolicy::from_config(&config.cooldown),
        ));
        let dispatcher = Arc::new(UpstreamDispatcher::new(
            http,
            rotator,
            Arc::clone(&store),
            RetryPolicy::from_config(&config.dispatch),
            logger.clone(),
        ));
        let oauth = Arc::new(OAuthFlow::new(
            Arc::clone(&store),
            config.redirect_uri(),
            Duration::from_secs(config.oauth.state_ttl_secs),
        ));

        Self {
            config,
            dispatcher,
            store,
            oauth,
            logger,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let guarded = Router::new()
        // Claude dialect
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_claude_count_tokens))
        .route("/v1/models", get(handle_claude_models))
        // Gemini dialect
        .route("/v1beta/models", get(handle_gemini_models))
        .route(
            "/v1beta/models/:target",
            get(handle_gemini_model).post(handle_gemini_action),
        )
        // OpenAI dialect
        .route("/v1/chat/completions", post(handle_chat_completions))
        // Administration
        .route("/admin/api/accounts", get(handle_list_accounts))
        .route("/admin/api/accounts/reload", post(handle_reload_accounts))
        .route("/admin/api/accounts/:id", delete(handle_delete_account))
        .route("/admin/api/oauth/start", post(handle_oauth_start))
        .route("/admin/api/logs", get(handle_logs))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .route("/oauth/callback", get(handle_oauth_callback))
        .merge(guarded)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Client API-key guard
// ---------------------------------------------------------------------------

async fn require_api_key(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if state.config.api_keys.is_empty() {
        return next.run(req).await;
    }
    let presented = extract_api_key(req.headers(), req.uri().query());
    match presented {
        Some(key) if state.config.api_keys.iter().any(|k| *k == key) => next.run(req).await,
        _ => {
            tracing::warn!(path = %req.uri().path(), "Rejected request with missing or unknown API key");
            GatewayError::Unauthorized.into_response()
        }
    }
}

/// The client key from any of the headers the three dialects use, or `?key=`.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(auth) = header("authorization") {
        let key = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(auth)
            .trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    for name in ["x-api-key", "anthropic-api-key", "x-goog-api-key"] {
        if let Some(key) = header(name) {
            return Some(key.to_string());
        }
    }
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, v)| k == "key" && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    })
}

// ---------------------------------------------------------------------------
// Dialect routes
// ---------------------------------------------------------------------------

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse> {
    native::claude::handle_messages(&state.dispatcher, body, &headers).await
}

async fn handle_claude_count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ApiResponse> {
    native::claude::handle_count_tokens(&state.dispatcher, body, &headers).await
}

async fn handle_claude_models() -> ApiResponse {
    native::claude::handle_list_models()
}

async fn handle_gemini_models() -> ApiResponse {
    native::gemini::handle_list_models()
}

async fn handle_gemini_model(Path(target): Path<String>) -> Result<ApiResponse> {
    native::gemini::handle_get_model(&target)
}

/// `POST /v1beta/models/{model}:{method}`.
async fn handle_gemini_action(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<ApiResponse> {
    let (model, method) = target
        .rsplit_once(':')
        .ok_or_else(|| GatewayError::not_found(format!("Unknown model action: {target}")))?;

    if method == native::gemini::COUNT_TOKENS {
        return native::gemini::handle_count_tokens(&state.dispatcher, model, body).await;
    }

    let query: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    native::gemini::handle_generate(&state.dispatcher, model, method, body, &query).await
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<ApiResponse> {
    proxy::handle_chat_completions(&state.dispatcher, &body).await
}

// ---------------------------------------------------------------------------
// Administration
// ---------------------------------------------------------------------------

async fn handle_list_accounts(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "data": state.store.snapshot() }))
}

async fn handle_reload_accounts(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let summary = state.store.reload().await?;
    Ok(Json(serde_json::json!({ "data": summary })))
}

async fn handle_delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "data": { "deleted": id } })))
}

#[derive(Debug, Deserialize)]
struct OAuthStartRequest {
    provider: String,
}

async fn handle_oauth_start(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let req: OAuthStartRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::invalid_request(format!("Invalid JSON body: {e}")))?;
    let group: ProviderGroup = req.provider.parse()?;
    let started = state.oauth.start(group)?;
    Ok(Json(serde_json::json!({ "data": started })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
    component: Option<String>,
}

async fn handle_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let entries = state.logger.recent(limit, query.component.as_deref());
    Json(serde_json::json!({ "data": entries }))
}

// ---------------------------------------------------------------------------
// Public routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
}

async fn handle_oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Html<String> {
    if let Some(error) = query.error {
        if let Some(flow_state) = &query.state {
            // Consume the state so it cannot be replayed.
            let _ = state.oauth.complete(flow_state, "").await;
        }
        state.logger.warn("oauth", format!("Provider denied authorization: {error}"));
        return callback_page(false, &format!("Authorization was denied: {error}"));
    }

    let (Some(flow_state), Some(code)) = (query.state, query.code) else {
        return callback_page(false, "Missing state or code");
    };

    match state.oauth.complete(&flow_state, &code).await {
        Ok(credential) => {
            let message = format!("Added {} account {}", credential.group(), credential.label());
            state.logger.info("oauth", &message);
            callback_page(true, &message)
        }
        Err(e) => {
            state.logger.error("oauth", format!("OAuth completion failed: {e}"));
            callback_page(false, &e.to_string())
        }
    }
}

fn callback_page(ok: bool, message: &str) -> Html<String> {
    let title = if ok { "Account added" } else { "Authorization failed" };
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p><p>You can close this window.</p></body></html>",
        escape_html(message)
    ))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": state.store.pools().total(),
    }))
}
