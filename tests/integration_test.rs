//! End-to-end tests: the real router served on an ephemeral port, talking to
//! in-process mock upstreams.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use llm_relay::{build_router, AppState, RelayConfig, SharedLogger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

// ────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Option<CapturedRequest>>>);

#[derive(Clone)]
struct CapturedRequest {
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: serde_json::Value,
}

impl Captured {
    fn take(&self) -> CapturedRequest {
        self.0.lock().unwrap().take().expect("upstream saw no request")
    }
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_relay(config_toml: &str) -> SocketAddr {
    let config = RelayConfig::from_toml_str(config_toml).unwrap();
    let dir = std::env::temp_dir().join("llm-relay-integration-tests");
    std::fs::create_dir_all(&dir).unwrap();

    let state = Arc::new(AppState {
        config,
        client: reqwest::Client::new(),
        logger: SharedLogger::new(dir.join("relay.log")).unwrap(),
    });
    spawn(build_router(state)).await
}

fn openai_mock(captured: Captured, response: serde_json::Value) -> Router {
    Router::new()
        .route(
            "/chat/completions",
            post(
                |State((captured, response)): State<(Captured, serde_json::Value)>,
                 headers: HeaderMap,
                 Json(body): Json<serde_json::Value>| async move {
                    *captured.0.lock().unwrap() = Some(CapturedRequest {
                        path: "/chat/completions".to_string(),
                        query: HashMap::new(),
                        headers,
                        body,
                    });
                    Json(response)
                },
            ),
        )
        .with_state((captured, response))
}

fn sse_mock(body: &'static str) -> Router {
    Router::new().route(
        "/chat/completions",
        post(move || async move {
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(axum::body::Body::from(body))
                .unwrap()
        }),
    )
}

/// Parse an SSE body into (event, data) pairs, skipping comments.
fn parse_sse(body: &str) -> Vec<(String, serde_json::Value)> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .filter_map(|block| {
            let mut event = String::new();
            let mut data = String::new();
            for line in block.lines() {
                if line.starts_with(':') {
                    continue;
                }
                if let Some(v) = line.strip_prefix("event:") {
                    event = v.trim().to_string();
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = v.trim().to_string();
                }
            }
            if event.is_empty() && data.is_empty() {
                None
            } else {
                Some((event, serde_json::from_str(&data).unwrap_or(serde_json::Value::Null)))
            }
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Surface endpoints
// ────────────────────────────────────────────────────────────────

const BASIC_CONFIG: &str = r#"
[[providers]]
name = "ollama"
type = "openai"
api_base_url = "http://localhost:11434/v1"
api_key = "bypass"
models = ["llama3.2:3b", "qwen2.5:7b"]

[mappings]
"haiku" = "ollama/llama3.2:3b"
"sonnet" = "ollama/llama3.2:3b"
"#;

#[tokio::test]
async fn test_health_endpoints() {
    let addr = spawn_relay(BASIC_CONFIG).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(format!("http://{addr}/health/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["providers"]["ollama"], "configured");
    assert_eq!(body["total_providers"], 1);
    assert_eq!(body["total_mappings"], 2);
}

#[tokio::test]
async fn test_models_listing() {
    let addr = spawn_relay(BASIC_CONFIG).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/v1/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "ollama/llama3.2:3b");
    assert_eq!(data[0]["owned_by"], "ollama");
    assert!(data[0]["created"].is_i64());
}

// ────────────────────────────────────────────────────────────────
// OpenAI backend
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_openai_roundtrip_with_forwarded_key() {
    let captured = Captured::default();
    let upstream = spawn(openai_mock(
        captured.clone(),
        serde_json::json!({
            "id": "x",
            "model": "gpt-4o",
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5},
        }),
    ))
    .await;

    let config = format!(
        r#"
[[providers]]
name = "openai"
type = "openai"
api_base_url = "http://{upstream}"
api_key = "bypass"
models = ["gpt-4o"]
"#
    );
    let addr = spawn_relay(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .header("x-api-key", "K")
        .json(&serde_json::json!({
            "model": "openai/gpt-4o",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let seen = captured.take();
    assert_eq!(
        seen.headers.get("authorization").unwrap().to_str().unwrap(),
        "Bearer K"
    );
    assert_eq!(seen.body["model"], "gpt-4o");
    assert_eq!(seen.body["messages"][0]["role"], "user");
    assert_eq!(seen.body["messages"][0]["content"], "hi");

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], "x");
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["content"], serde_json::json!([{"type": "text", "text": "hello"}]));
    assert_eq!(body["usage"]["input_tokens"], 3);
    assert_eq!(body["usage"]["output_tokens"], 5);
}

#[tokio::test]
async fn test_alias_resolves_to_backend_model() {
    let captured = Captured::default();
    let upstream = spawn(openai_mock(
        captured.clone(),
        serde_json::json!({
            "id": "y",
            "model": "llama3.2:3b",
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
        }),
    ))
    .await;

    let config = format!(
        r#"
[[providers]]
name = "ollama"
type = "openai"
api_base_url = "http://{upstream}"
api_key = "unused-local-key"
models = ["llama3.2:3b"]

[mappings]
"haiku" = "ollama/llama3.2:3b"
"#
    );
    let addr = spawn_relay(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "haiku",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let seen = captured.take();
    assert_eq!(seen.body["model"], "llama3.2:3b");
    assert_eq!(
        seen.headers.get("authorization").unwrap().to_str().unwrap(),
        "Bearer unused-local-key"
    );
}

#[tokio::test]
async fn test_streaming_event_order() {
    let upstream = spawn(sse_mock(concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"A\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"B\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"C\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"length\"}]}\n\n",
        "data: [DONE]\n\n",
    )))
    .await;

    let config = format!(
        r#"
[[providers]]
name = "openai"
type = "openai"
api_base_url = "http://{upstream}"
api_key = "bypass"
models = ["gpt-4o"]
"#
    );
    let addr = spawn_relay(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .header("x-api-key", "K")
        .json(&serde_json::json!({
            "model": "openai/gpt-4o",
            "max_tokens": 10,
            "stream": true,
            "messages": [{"role": "user", "content": "count"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("text/event-stream"));
    assert_eq!(
        resp.headers().get("cache-control").unwrap().to_str().unwrap(),
        "no-cache"
    );

    let body = resp.text().await.unwrap();
    let events = parse_sse(&body);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let texts: Vec<&str> = events
        .iter()
        .filter(|(name, _)| name == "content_block_delta")
        .map(|(_, data)| data["delta"]["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["A", "B", "C"]);

    let (_, message_delta) = &events[6];
    assert_eq!(message_delta["delta"]["stop_reason"], "max_tokens");
}

#[tokio::test]
async fn test_upstream_error_maps_to_502() {
    let upstream = spawn(Router::new().route(
        "/chat/completions",
        post(|| async {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": {"message": "boom"}})),
            )
        }),
    ))
    .await;

    let config = format!(
        r#"
[[providers]]
name = "openai"
type = "openai"
api_base_url = "http://{upstream}"
api_key = "sk-local"
models = ["gpt-4o"]
"#
    );
    let addr = spawn_relay(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "openai/gpt-4o",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "api_error");
    assert_eq!(body["error"]["type"], "api_error");
}

// ────────────────────────────────────────────────────────────────
// Request validation and auth
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let addr = spawn_relay(BASIC_CONFIG).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/v1/messages");

    // Malformed JSON.
    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // max_tokens = 0.
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "model": "haiku",
            "max_tokens": 0,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "invalid_request_error");
    assert_eq!(body["error"]["message"], "max_tokens must be greater than 0");

    // Empty messages.
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "model": "haiku",
            "max_tokens": 5,
            "messages": [],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown provider prefix.
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "model": "nope/gpt-4o",
            "max_tokens": 5,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown bare model.
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "model": "gpt-4o",
            "max_tokens": 5,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_missing_forwarded_key_is_401() {
    let addr = spawn_relay(BASIC_CONFIG).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "haiku",
            "max_tokens": 5,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "authentication_error");
}

// ────────────────────────────────────────────────────────────────
// Gemini backend
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_gemini_roundtrip() {
    let captured = Captured::default();
    let upstream = spawn(
        Router::new()
            .route(
                "/models/{action}",
                post(
                    |State(captured): State<Captured>,
                     Path(action): Path<String>,
                     Query(query): Query<HashMap<String, String>>,
                     headers: HeaderMap,
                     Json(body): Json<serde_json::Value>| async move {
                        *captured.0.lock().unwrap() = Some(CapturedRequest {
                            path: action,
                            query,
                            headers,
                            body,
                        });
                        Json(serde_json::json!({
                            "candidates": [{
                                "content": {"role": "model", "parts": [{"text": "bonjour"}]},
                                "finishReason": "STOP",
                            }],
                            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2},
                        }))
                    },
                ),
            )
            .with_state(captured.clone()),
    )
    .await;

    let config = format!(
        r#"
[[providers]]
name = "gemini"
type = "gemini"
api_base_url = "http://{upstream}"
api_key = "gm-key"
models = ["gemini-2.5-flash"]
"#
    );
    let addr = spawn_relay(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "gemini/gemini-2.5-flash",
            "max_tokens": 40,
            "system": "reply in French",
            "messages": [{"role": "user", "content": "hello"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let seen = captured.take();
    assert_eq!(seen.path, "gemini-2.5-flash:generateContent");
    assert_eq!(seen.query.get("key").map(String::as_str), Some("gm-key"));
    assert_eq!(seen.body["contents"][0]["role"], "user");
    assert_eq!(
        seen.body["systemInstruction"]["parts"][0]["text"],
        "reply in French"
    );
    assert_eq!(seen.body["generationConfig"]["maxOutputTokens"], 40);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("msg_"));
    assert_eq!(body["model"], "gemini-2.5-flash");
    assert_eq!(body["content"][0]["text"], "bonjour");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 8);
    assert_eq!(body["usage"]["output_tokens"], 2);
}

// ────────────────────────────────────────────────────────────────
// Anthropic passthrough
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_anthropic_passthrough() {
    let captured = Captured::default();
    let upstream_body = serde_json::json!({
        "id": "msg_upstream",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": "native"}],
        "model": "claude-sonnet-4",
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 1, "output_tokens": 2},
    });
    let upstream = spawn(
        Router::new()
            .route(
                "/v1/messages",
                post(
                    |State((captured, response)): State<(Captured, serde_json::Value)>,
                     headers: HeaderMap,
                     Json(body): Json<serde_json::Value>| async move {
                        *captured.0.lock().unwrap() = Some(CapturedRequest {
                            path: "/v1/messages".to_string(),
                            query: HashMap::new(),
                            headers,
                            body,
                        });
                        Json(response)
                    },
                ),
            )
            .with_state((captured.clone(), upstream_body.clone())),
    )
    .await;

    let config = format!(
        r#"
[[providers]]
name = "anthropic"
type = "anthropic"
api_base_url = "http://{upstream}"
api_key = "sk-ant-local"
models = ["claude-sonnet-4"]

[mappings]
"sonnet" = "anthropic/claude-sonnet-4"
"#
    );
    let addr = spawn_relay(&config).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "sonnet",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let seen = captured.take();
    assert_eq!(
        seen.headers.get("x-api-key").unwrap().to_str().unwrap(),
        "sk-ant-local"
    );
    assert_eq!(
        seen.headers
            .get("anthropic-version")
            .unwrap()
            .to_str()
            .unwrap(),
        "2023-06-01"
    );
    assert_eq!(seen.body["model"], "claude-sonnet-4");

    // Body comes back unchanged.
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, upstream_body);
}

// ────────────────────────────────────────────────────────────────
// Startup failures
// ────────────────────────────────────────────────────────────────

#[test]
fn test_unset_env_credential_fails_startup() {
    let err = RelayConfig::from_toml_str(
        r#"
[[providers]]
name = "openai"
type = "openai"
api_base_url = "https://api.openai.com/v1"
api_key = "env:OPENAI_API_KEY_INTEGRATION_UNSET"
models = ["gpt-4o"]
"#,
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "provider openai: environment variable 'OPENAI_API_KEY_INTEGRATION_UNSET' is not set or is empty"
    );
}

#[test]
fn test_alias_to_unknown_backend_fails_startup() {
    let err = RelayConfig::from_toml_str(
        r#"
[[providers]]
name = "openai"
type = "openai"
api_base_url = "https://api.openai.com/v1"
api_key = "sk"
models = ["gpt-4o"]

[mappings]
"haiku" = "missing/gpt-4o"
"#,
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "mapping: alias 'haiku' references non-existent provider 'missing'"
    );
}
