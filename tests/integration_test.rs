use bytes::Bytes;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tempfile::TempDir;
use unigate::accounts::{HealthState, Outcome, ProviderGroup};
use unigate::dispatch::{UpstreamBody, UpstreamCall};
use futures::StreamExt;
use unigate::{build_router, upstream_client, AppState, GatewayConfig, GatewayError, SharedLogger};
use wiremock::matchers::{body_partial_json, body_string_contains, header, headers, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLAUDE_REPLY: &str = r#"{
    "id": "msg_01",
    "type": "message",
    "role": "assistant",
    "model": "claude-sonnet-4-5",
    "content": [{"type": "text", "text": "hi there"}],
    "stop_reason": "end_turn",
    "usage": {"input_tokens": 12, "output_tokens": 3}
}"#;

const CLAUDE_STREAM: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

const GEMINI_STREAM: &str = concat!(
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Bon\"}]}}]}\r\n\r\n",
    "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"jour\"}]},\"finishReason\":\"STOP\"}],",
    "\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":2,\"totalTokenCount\":6}}\r\n\r\n",
);

/// A running gateway whose provider base URLs point at one mock upstream.
struct Gateway {
    upstream: MockServer,
    dir: TempDir,
    state: Arc<AppState>,
    base: String,
    http: reqwest::Client,
}

fn write_account(dir: &Path, id: &str, group: ProviderGroup) {
    let expiry = chrono::Utc::now() + chrono::Duration::hours(1);
    let record = json!({
        "id": id,
        "provider": group,
        "email": format!("{id}@example.com"),
        "access_token": format!("access-{id}"),
        "refresh_token": format!("refresh-{id}"),
        "expiry_date": expiry.timestamp_millis(),
    });
    std::fs::write(dir.join(format!("{id}.json")), record.to_string()).unwrap();
}

async fn gateway(claude: &[&str], gemini: &[&str], api_keys: &[&str]) -> Gateway {
    gateway_with(claude, gemini, api_keys, |_| {}).await
}

async fn gateway_with(
    claude: &[&str],
    gemini: &[&str],
    api_keys: &[&str],
    tweak: impl FnOnce(&mut GatewayConfig),
) -> Gateway {
    let upstream = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    for id in claude {
        write_account(dir.path(), id, ProviderGroup::Claude);
    }
    for id in gemini {
        write_account(dir.path(), id, ProviderGroup::Gemini);
    }

    let mut config = GatewayConfig::default();
    config.host = "127.0.0.1".to_string();
    config.api_keys = api_keys.iter().map(|k| k.to_string()).collect();
    config.auth_dir = dir.path().to_path_buf();
    config.dispatch.backoff_base_ms = 1;
    config.dispatch.backoff_max_ms = 5;
    config.providers.claude.base_url = Some(upstream.uri());
    config.providers.claude.token_url = Some(format!("{}/oauth/token", upstream.uri()));
    config.providers.gemini.base_url = Some(upstream.uri());
    config.providers.gemini.token_url = Some(format!("{}/oauth/token", upstream.uri()));
    config.providers.gemini.client_id = Some("test-client".to_string());
    tweak(&mut config);

    let http = upstream_client(&config).unwrap();
    let state = Arc::new(AppState::build(config, http, SharedLogger::in_memory()));
    state.store.load().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Gateway {
        upstream,
        dir,
        state,
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
    }
}

fn claude_call() -> UpstreamCall {
    UpstreamCall::new(
        ProviderGroup::Claude,
        "/v1/messages",
        Bytes::from_static(br#"{"model":"claude-sonnet-4-5","max_tokens":16,"messages":[]}"#),
    )
}

fn health_of(gw: &Gateway, id: &str) -> HealthState {
    gw.state.store.pools().find(id).unwrap().health()
}

// ---------------------------------------------------------------------------
// Dispatch: rotation, retry and failure classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_consecutive_calls_rotate_accounts() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    for id in ["a", "b"] {
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", format!("Bearer access-{id}").as_str()))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
            .expect(1)
            .mount(&gw.upstream)
            .await;
    }

    let first = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap();
    let second = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap();
    assert_eq!(first.credential_id, "a");
    assert_eq!(second.credential_id, "b");
}

#[tokio::test]
async fn test_quota_failure_cools_account_and_retries_next() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    Mock::given(header("authorization", "Bearer access-a"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_string("slow down"),
        )
        .expect(1)
        .mount(&gw.upstream)
        .await;
    Mock::given(header("authorization", "Bearer access-b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let reply = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap();
    assert_eq!(reply.credential_id, "b");
    assert_eq!(reply.status, 200);
    assert!(matches!(health_of(&gw, "a"), HealthState::Cooling { .. }));
    assert_eq!(health_of(&gw, "b"), HealthState::Active);
}

#[tokio::test]
async fn test_auth_failure_revokes_and_persists() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    Mock::given(header("authorization", "Bearer access-a"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
        .expect(1)
        .mount(&gw.upstream)
        .await;
    Mock::given(header("authorization", "Bearer access-b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let reply = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap();
    assert_eq!(reply.credential_id, "b");
    assert_eq!(health_of(&gw, "a"), HealthState::Revoked);

    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(gw.dir.path().join("a.json")).unwrap()).unwrap();
    assert_eq!(saved["revoked"], true);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_raw(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#,
            "application/json",
        ))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let err = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    match err {
        GatewayError::UpstreamRejected { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("invalid_request_error"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(health_of(&gw, "a"), HealthState::Active);
}

#[tokio::test]
async fn test_server_errors_exhaust_attempt_ceiling() {
    let gw = gateway(&["a", "b", "c", "d", "e"], &[], &[]).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(4)
        .mount(&gw.upstream)
        .await;

    let err = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }), "{err:?}");
}

#[tokio::test]
async fn test_cooling_pool_reports_no_accounts() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
        .expect(2)
        .mount(&gw.upstream)
        .await;

    let first = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    assert!(matches!(first, GatewayError::UpstreamUnavailable { .. }), "{first:?}");

    // Both accounts are now cooling, so nothing is sent upstream.
    let second = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    assert!(
        matches!(second, GatewayError::NoAccountsAvailable { group: ProviderGroup::Claude, .. }),
        "{second:?}"
    );
}

#[tokio::test]
async fn test_quota_on_last_active_account_with_other_cooling() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    let b = gw.state.store.pools().find("b").unwrap();
    gw.state.dispatcher.rotator().report(
        &b,
        &Outcome::Quota {
            retry_after: Some(Duration::from_secs(60)),
            message: "429".to_string(),
        },
    );
    Mock::given(header("authorization", "Bearer access-a"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&gw.upstream)
        .await;
    Mock::given(header("authorization", "Bearer access-b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
        .expect(0)
        .mount(&gw.upstream)
        .await;

    let err = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::NoAccountsAvailable { group: ProviderGroup::Claude, .. }),
        "{err:?}"
    );
    assert!(matches!(health_of(&gw, "a"), HealthState::Cooling { .. }));
}

#[tokio::test]
async fn test_empty_pool_reports_no_accounts() {
    let gw = gateway(&[], &["g"], &[]).await;
    let err = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    assert!(matches!(err, GatewayError::NoAccountsAvailable { .. }));
    assert!(gw.upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_reply_is_handed_back_once_started() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    Mock::given(header("authorization", "Bearer access-a"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_STREAM, "text/event-stream"))
        .expect(1)
        .mount(&gw.upstream)
        .await;
    Mock::given(header("authorization", "Bearer access-b"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&gw.upstream)
        .await;

    let reply = gw
        .state
        .dispatcher
        .dispatch(&claude_call().streaming(true))
        .await
        .unwrap();
    assert!(matches!(reply.body, UpstreamBody::Stream(_)));
}

/// A bare HTTP/1.1 upstream that answers one request with a chunked SSE body,
/// writing each chunk after `gap`.
async fn drip_upstream(chunks: Vec<&'static str>, gap: Duration) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&seen);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if seen.len() >= head_end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
            )
            .await
            .unwrap();
        for chunk in chunks {
            tokio::time::sleep(gap).await;
            let frame = format!("{:x}\r\n{chunk}\r\n", chunk.len());
            socket.write_all(frame.as_bytes()).await.unwrap();
        }
        socket.write_all(b"0\r\n\r\n").await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_slow_stream_outlives_request_timeout() {
    let chunks = vec![
        "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ];
    let expected: String = chunks.concat();
    let drip = drip_upstream(chunks, Duration::from_millis(400)).await;
    let gw = gateway_with(&["a"], &[], &[], |config| {
        config.dispatch.request_timeout_secs = 1;
        config.dispatch.read_idle_timeout_secs = 5;
        config.providers.claude.base_url = Some(drip.clone());
    })
    .await;

    let reply = gw
        .state
        .dispatcher
        .dispatch(&claude_call().streaming(true))
        .await
        .unwrap();
    let UpstreamBody::Stream(mut body) = reply.body else {
        panic!("expected a streamed body");
    };
    let mut received = Vec::new();
    while let Some(chunk) = body.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(String::from_utf8(received).unwrap(), expected);
}

#[tokio::test]
async fn test_slow_non_stream_reply_hits_request_timeout() {
    let gw = gateway_with(&["a"], &[], &[], |config| {
        config.dispatch.request_timeout_secs = 1;
    })
    .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(CLAUDE_REPLY, "application/json")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&gw.upstream)
        .await;

    let err = gw.state.dispatcher.dispatch(&claude_call()).await.unwrap_err();
    match err {
        GatewayError::UpstreamUnavailable { last_error } => assert!(last_error.contains("timeout"), "{last_error}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Native dialect routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_native_claude_messages_passthrough() {
    let gw = gateway(&["a"], &[], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(headers("anthropic-beta", vec!["oauth-2025-04-20", "fine-grained-tool-streaming-2025-05-14"]))
        .and(body_partial_json(json!({"model": "claude-sonnet-4-5", "max_tokens": 16})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!("{}/v1/messages", gw.base))
        .header("anthropic-beta", "fine-grained-tool-streaming-2025-05-14")
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "msg_01");
    assert_eq!(body["content"][0]["text"], "hi there");
}

#[tokio::test]
async fn test_native_claude_stream_passthrough() {
    let gw = gateway(&["a"], &[], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_STREAM, "text/event-stream"))
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!("{}/v1/messages", gw.base))
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.text().await.unwrap(), CLAUDE_STREAM);
}

#[tokio::test]
async fn test_native_claude_rejects_bad_body_without_dispatch() {
    let gw = gateway(&["a"], &[], &[]).await;
    let resp = gw
        .http
        .post(format!("{}/v1/messages", gw.base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(gw.upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_native_gemini_generate_forwards_query_without_key() {
    let gw = gateway(&[], &["g"], &["secret"]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .and(header("authorization", "Bearer access-g"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "ok"}]}, "finishReason": "STOP"}]
        })))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!(
            "{}/v1beta/models/gemini-2.5-flash:generateContent?key=secret&labels=x",
            gw.base
        ))
        .json(&json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "ok");

    let requests = gw.upstream.received_requests().await.unwrap();
    let pairs: Vec<(String, String)> = requests[0]
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert_eq!(pairs, vec![("labels".to_string(), "x".to_string())]);
}

#[tokio::test]
async fn test_native_gemini_stream_forces_sse() {
    let gw = gateway(&[], &["g"], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"))
        .and(wiremock::matchers::query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(GEMINI_STREAM, "text/event-stream"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!(
            "{}/v1beta/models/gemini-2.5-pro:streamGenerateContent",
            gw.base
        ))
        .json(&json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), GEMINI_STREAM);
}

#[tokio::test]
async fn test_model_catalog_routes() {
    let gw = gateway(&[], &[], &[]).await;

    let claude: Value = gw
        .http
        .get(format!("{}/v1/models", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(claude["data"][0]["type"], "model");

    let one = gw
        .http
        .get(format!("{}/v1beta/models/gemini-2.5-flash", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(one.status(), 200);
    let one: Value = one.json().await.unwrap();
    assert_eq!(one["name"], "models/gemini-2.5-flash");

    let missing = gw
        .http
        .get(format!("{}/v1beta/models/gemini-0.0-none", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

// ---------------------------------------------------------------------------
// OpenAI compatibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_completion_through_claude() {
    let gw = gateway(&["a"], &[], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 4096,
            "system": "Be brief.",
            "temperature": 0.5
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "temperature": 0.5,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Say hi"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "hi there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 12);
    assert_eq!(body["usage"]["completion_tokens"], 3);
    assert_eq!(body["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn test_chat_completion_stream_through_claude() {
    let gw = gateway(&["a"], &[], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_STREAM, "text/event-stream"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "model": "claude-sonnet-4-5",
            "stream": true,
            "messages": [{"role": "user", "content": "Say hello"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let text = resp.text().await.unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| f.strip_prefix("data: ").unwrap())
        .collect();
    assert_eq!(frames.last(), Some(&"[DONE]"));
    assert_eq!(frames.iter().filter(|f| **f == "[DONE]").count(), 1);

    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello");
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_chat_completion_stream_through_gemini() {
    let gw = gateway(&[], &["g"], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .and(wiremock::matchers::query_param("alt", "sse"))
        .and(body_partial_json(json!({"systemInstruction": {"parts": [{"text": "Be kind."}]}})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(GEMINI_STREAM, "text/event-stream"))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let text = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "model": "gemini-2.5-flash",
            "stream": true,
            "messages": [
                {"role": "system", "content": "Be kind."},
                {"role": "user", "content": "Say bonjour"}
            ]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(text.ends_with("data: [DONE]\n\n"));
    let chunks: Vec<Value> = text
        .split("\n\n")
        .filter_map(|f| f.strip_prefix("data: "))
        .filter(|f| *f != "[DONE]")
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    let content: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Bonjour");
    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["usage"]["total_tokens"], 6);
}

#[tokio::test]
async fn test_chat_completion_through_gemini_unwraps_response_envelope() {
    let gw = gateway(&[], &["g"], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Salut"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4}
            }
        })))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let body: Value = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "Say hi"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Salut");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 4);
}

#[tokio::test]
async fn test_chat_completion_http_image_is_replaced_and_dispatched() {
    let gw = gateway(&[], &["g"], &[]).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-pro:generateContent"))
        .and(body_string_contains("[Image URL not supported directly]"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "a cat"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
        })))
        .expect(1)
        .mount(&gw.upstream)
        .await;

    let resp = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({
            "model": "gemini-2.5-pro",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "What is this?"},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["model"], "gemini-2.5-pro");
    assert_eq!(body["choices"][0]["message"]["content"], "a cat");
    assert_eq!(body["usage"]["total_tokens"], 7);
}

#[tokio::test]
async fn test_chat_completion_malformed_body_is_400() {
    let gw = gateway(&["a"], &[], &[]).await;
    let resp = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .header("content-type", "application/json")
        .body(r#"{"model": "claude-sonnet-4-5", "messages": ["#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("Invalid JSON body"));
}

#[tokio::test]
async fn test_chat_completion_unknown_model_prefix() {
    let gw = gateway(&["a"], &["g"], &[]).await;
    let resp = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Unsupported model prefix: gpt-4o"));
    assert!(gw.upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_completion_with_exhausted_pool_is_503() {
    let gw = gateway(&[], &[], &[]).await;
    let resp = gw
        .http
        .post(format!("{}/v1/chat/completions", gw.base))
        .json(&json!({"model": "claude-sonnet-4-5", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "overloaded_error");
}

// ---------------------------------------------------------------------------
// API keys, administration, health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_api_key_guard() {
    let gw = gateway(&[], &[], &["secret"]).await;

    let denied = gw.http.get(format!("{}/v1/models", gw.base)).send().await.unwrap();
    assert_eq!(denied.status(), 401);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");

    let wrong = gw
        .http
        .get(format!("{}/v1/models", gw.base))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    for (name, value) in [
        ("x-api-key", "secret"),
        ("authorization", "Bearer secret"),
        ("x-goog-api-key", "secret"),
    ] {
        let ok = gw
            .http
            .get(format!("{}/v1/models", gw.base))
            .header(name, value)
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200, "{name}");
    }

    let health = gw.http.get(format!("{}/health", gw.base)).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_admin_accounts_and_delete() {
    let gw = gateway(&["a", "b"], &["g"], &[]).await;

    let listed: Value = gw
        .http
        .get(format!("{}/admin/api/accounts", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["data"]["count"], 3);

    let deleted = gw
        .http
        .delete(format!("{}/admin/api/accounts/a", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    assert!(!gw.dir.path().join("a.json").exists());

    let missing = gw
        .http
        .delete(format!("{}/admin/api/accounts/a", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let health: Value = gw
        .http
        .get(format!("{}/health", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["accounts"], 2);
}

#[tokio::test]
async fn test_admin_reload_picks_up_new_files() {
    let gw = gateway(&["a"], &[], &[]).await;
    write_account(gw.dir.path(), "z", ProviderGroup::Claude);

    let resp = gw
        .http
        .post(format!("{}/admin/api/accounts/reload", gw.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(gw.state.store.pools().get(ProviderGroup::Claude).len(), 2);
}

#[tokio::test]
async fn test_admin_oauth_start_and_unknown_callback_state() {
    let gw = gateway(&[], &[], &[]).await;

    let started: Value = gw
        .http
        .post(format!("{}/admin/api/oauth/start", gw.base))
        .json(&json!({"provider": "gemini"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let auth_url = started["data"]["auth_url"].as_str().unwrap();
    assert!(auth_url.contains("client_id=test-client"));
    assert!(auth_url.contains("code_challenge_method=S256"));
    assert_eq!(gw.state.oauth.pending_count(), 1);

    let page = gw
        .http
        .get(format!("{}/oauth/callback?state=bogus&code=abc", gw.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(page.contains("Authorization failed"));

    let bad = gw
        .http
        .post(format!("{}/admin/api/oauth/start", gw.base))
        .json(&json!({"provider": "openai"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
}

#[tokio::test]
async fn test_dispatch_attempts_are_logged() {
    let gw = gateway(&["a", "b"], &[], &[]).await;
    Mock::given(header("authorization", "Bearer access-a"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&gw.upstream)
        .await;
    Mock::given(header("authorization", "Bearer access-b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CLAUDE_REPLY, "application/json"))
        .mount(&gw.upstream)
        .await;

    gw.state.dispatcher.dispatch(&claude_call()).await.unwrap();

    let logs: Value = gw
        .http
        .get(format!("{}/admin/api/logs?limit=10&component=dispatch", gw.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = logs["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
}
