use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use reasoning_proxy::config::{StreamConfig, UpstreamConfig};
use reasoning_proxy::{build_router, AppState, ProxyConfig, ReasoningFormat, SharedLogger};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ────────────────────────────────────────────────────────────────
// Mock upstream
// ────────────────────────────────────────────────────────────────

/// Records every call the proxy makes upstream.
#[derive(Default)]
struct MockUpstream {
    calls: AtomicUsize,
    last_authorization: Mutex<Option<String>>,
    last_content_type: Mutex<Option<String>>,
    last_body: Mutex<Option<Value>>,
}

impl MockUpstream {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

const STREAM_BODY: &str = ": OPENROUTER PROCESSING\n\n\
    data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\",\"reasoning\":\"想一想\"}}]}\n\n\
    data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\",\"reasoning\":null}}]}\n\n\
    data: [DONE]\n\n";

const BROKEN_FIRST: &str = "data: {\"choices\":[{\"delta\":{\"reasoning\":\"one\"}}]}\n\n";
const BROKEN_SECOND: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n\n";

fn event_stream(body: Body) -> Response {
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

/// Split `STREAM_BODY` mid-line and inside a multi-byte character.
fn chunked_stream_body() -> Body {
    let bytes = STREAM_BODY.as_bytes();
    let mid_char = STREAM_BODY.find('想').unwrap() + 1;
    let mid_line = STREAM_BODY.find("\"Hi\"").unwrap();
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::copy_from_slice(&bytes[..mid_char])),
        Ok(Bytes::copy_from_slice(&bytes[mid_char..mid_line])),
        Ok(Bytes::copy_from_slice(&bytes[mid_line..])),
    ];
    Body::from_stream(futures::stream::iter(chunks))
}

fn broken_stream_body() -> Body {
    Body::from_stream(async_stream::stream! {
        yield Ok::<_, std::io::Error>(Bytes::from_static(BROKEN_FIRST.as_bytes()));
        yield Ok(Bytes::from_static(BROKEN_SECOND.as_bytes()));
        // Let both events reach the proxy before the connection dies.
        tokio::time::sleep(Duration::from_millis(100)).await;
        yield Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "upstream died",
        ));
    })
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn mock_chat_completions(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    *mock.last_authorization.lock().unwrap() = header_str(&headers, AUTHORIZATION);
    *mock.last_content_type.lock().unwrap() = header_str(&headers, CONTENT_TYPE);
    *mock.last_body.lock().unwrap() = Some(body.clone());

    let streaming = body["stream"].as_bool().unwrap_or(false);
    match body["model"].as_str().unwrap_or_default() {
        "unauthorized" => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "No auth credentials found", "code": 401}})),
        )
            .into_response(),
        "not-json" => (StatusCode::OK, "<html>oops</html>").into_response(),
        "broken" => event_stream(broken_stream_body()),
        "stall" => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            event_stream(chunked_stream_body())
        }
        "malformed" => event_stream(Body::from(
            "data: {\"choices\":[{\"delta\":{\"reasoning\":\"a\"}}]}\n\n\
             data: {\"choices\":[{\"delta\"\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n\
             data: [DONE]\n\n",
        )),
        _ if streaming => event_stream(chunked_stream_body()),
        _ => (
            StatusCode::OK,
            Json(json!({
                "id": "gen-1",
                "object": "chat.completion",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "reasoning": "r", "content": "c"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })),
        )
            .into_response(),
    }
}

async fn spawn_mock_upstream() -> (String, Arc<MockUpstream>) {
    let mock = Arc::new(MockUpstream::default());
    let app = Router::new()
        .route("/api/v1/chat/completions", post(mock_chat_completions))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/api/v1"), mock)
}

// ────────────────────────────────────────────────────────────────
// Proxy under test
// ────────────────────────────────────────────────────────────────

struct TestProxy {
    url: String,
    logger: SharedLogger,
    _log_dir: TempDir,
}

fn proxy_config(base_url: &str, format: ReasoningFormat, streaming: bool) -> ProxyConfig {
    ProxyConfig {
        port: 0,
        reasoning_format: Some(format),
        upstream: UpstreamConfig {
            name: "mock".to_string(),
            base_url: Some(base_url.to_string()),
            ..UpstreamConfig::default()
        },
        stream: StreamConfig {
            enabled: streaming,
            idle_timeout_secs: 5,
            ..StreamConfig::default()
        },
    }
}

async fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    let log_dir = TempDir::new().unwrap();
    let logger = SharedLogger::new(log_dir.path().join("proxy.log")).unwrap();

    let state = Arc::new(AppState {
        config,
        client: reqwest::Client::new(),
        logger: logger.clone(),
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestProxy {
        url: format!("http://{addr}"),
        logger,
        _log_dir: log_dir,
    }
}

async fn post_chat(proxy: &TestProxy, body: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy.url))
        .header("Authorization", "Bearer sk-or-test")
        .json(body)
        .send()
        .await
        .unwrap()
}

// ────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_root_reports_liveness() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = reqwest::get(format!("{}/", proxy.url)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().contains("running"));

    let health: Value = reqwest::get(format!("{}/health", proxy.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}

#[tokio::test]
async fn test_missing_credential_never_reaches_upstream() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy.url))
        .json(&json!({"model": "m", "messages": [], "stream": true}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({"error": "Authorization header with upstream API key is required."})
    );
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn test_non_streaming_reasoning_content() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let request = json!({
        "model": "deepseek/deepseek-r1",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
        "temperature": 0.2
    });
    let resp = post_chat(&proxy, &request).await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "id": "gen-1",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "reasoning_content": "r", "content": "c"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })
    );

    assert_eq!(mock.calls(), 1);
    assert_eq!(
        mock.last_authorization.lock().unwrap().as_deref(),
        Some("Bearer sk-or-test")
    );
    assert_eq!(
        mock.last_content_type.lock().unwrap().as_deref(),
        Some("application/json")
    );
    assert_eq!(mock.last_body.lock().unwrap().as_ref(), Some(&request));
}

#[tokio::test]
async fn test_non_streaming_think_tags() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ThinkTags, true)).await;

    let resp = post_chat(&proxy, &json!({"model": "m", "messages": []})).await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let message = &body["choices"][0]["message"];
    assert_eq!(message["content"], "<think>r</think>c");
    assert!(message.get("reasoning").is_none());
    assert!(message.get("reasoning_content").is_none());
    assert_eq!(body["usage"]["total_tokens"], 5);
}

#[tokio::test]
async fn test_streaming_rewrites_events_in_order() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = post_chat(&proxy, &json!({"model": "m", "messages": [], "stream": true})).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    assert_eq!(
        resp.text().await.unwrap(),
        ": OPENROUTER PROCESSING\n\n\
         data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\",\"reasoning_content\":\"想一想\"}}]}\n\n\
         data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\",\"reasoning_content\":null}}]}\n\n\
         data: [DONE]\n\n"
    );
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn test_streaming_think_tags() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ThinkTags, true)).await;

    let resp = post_chat(&proxy, &json!({"model": "m", "messages": [], "stream": true})).await;

    assert_eq!(
        resp.text().await.unwrap(),
        ": OPENROUTER PROCESSING\n\n\
         data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"<think>想一想</think>\"}}]}\n\n\
         data: {\"id\":\"gen-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n\
         data: [DONE]\n\n"
    );
}

#[tokio::test]
async fn test_stream_error_after_two_events_closes_cleanly() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = post_chat(&proxy, &json!({"model": "broken", "messages": [], "stream": true})).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.text().await.unwrap(),
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"one\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n\n"
    );
}

#[tokio::test]
async fn test_malformed_stream_event_is_dropped() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = post_chat(&proxy, &json!({"model": "malformed", "messages": [], "stream": true})).await;

    assert_eq!(
        resp.text().await.unwrap(),
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"a\"}}]}\n\n\
         data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n\
         data: [DONE]\n\n"
    );
    assert!(proxy
        .logger
        .recent(50)
        .iter()
        .any(|e| e.message == "Dropped malformed upstream event"));
}

#[tokio::test]
async fn test_streaming_upstream_rejection_is_json() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp =
        post_chat(&proxy, &json!({"model": "unauthorized", "messages": [], "stream": true})).await;

    assert_eq!(resp.status(), 401);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "No auth credentials found");
}

#[tokio::test]
async fn test_streaming_disabled_rejects_with_400() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, false)).await;

    let resp = post_chat(&proxy, &json!({"model": "m", "messages": [], "stream": true})).await;

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Streaming responses are disabled on this proxy.");
    assert_eq!(mock.calls(), 0);

    // Non-streaming requests still go through.
    let resp = post_chat(&proxy, &json!({"model": "m", "messages": []})).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn test_non_json_upstream_body_is_500() {
    let (base_url, _mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = post_chat(&proxy, &json!({"model": "not-json", "messages": []})).await;

    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to parse upstream response"));
}

#[tokio::test]
async fn test_unreachable_upstream_is_500() {
    // Nothing listens on the port of a dropped listener.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let proxy = spawn_proxy(proxy_config(
        &format!("http://{dead_addr}/api/v1"),
        ReasoningFormat::ReasoningContent,
        true,
    ))
    .await;

    for stream in [false, true] {
        let resp = post_chat(&proxy, &json!({"model": "m", "messages": [], "stream": stream})).await;
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"error": "Failed to proxy request to upstream."}));
    }
}

#[tokio::test]
async fn test_invalid_json_request_is_400() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy.url))
        .header("Authorization", "Bearer sk-or-test")
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn test_streaming_upstream_without_headers_times_out() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let mut config = proxy_config(&base_url, ReasoningFormat::ReasoningContent, true);
    config.stream.idle_timeout_secs = 1;
    let proxy = spawn_proxy(config).await;

    let started = std::time::Instant::now();
    let resp = post_chat(&proxy, &json!({"model": "stall", "messages": [], "stream": true})).await;

    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({"error": "No response received from upstream for 1s."})
    );
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn test_credential_forwarded_verbatim() {
    let (base_url, mock) = spawn_mock_upstream().await;
    let proxy = spawn_proxy(proxy_config(&base_url, ReasoningFormat::ReasoningContent, true)).await;

    let credential = "Token key=sk-or-v1/abc+def==;\tscope=chat";
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy.url))
        .header("Authorization", credential)
        .json(&json!({"model": "m", "messages": []}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        mock.last_authorization.lock().unwrap().as_deref(),
        Some(credential)
    );
}
