//! End-to-end tests: the gateway router in front of a fake OpenAI-compatible
//! backend, both served on loopback listeners.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use ketchup_core::agent::AgentLoop;
use ketchup_core::config::{AgentSettings, BackendConfig, ToolsConfig};
use ketchup_core::gateway::{router, AppState};
use ketchup_core::provider::openai::OpenAiProvider;
use ketchup_core::tools::{Tool, ToolError, ToolInvoker, ToolRegistry};

// ── Fake inference backend ──────────────────────────────────────────

#[derive(Default)]
struct FakeBackend {
    ready: AtomicBool,
    completions: AtomicUsize,
}

/// Requests that offer tools and have no tool result yet get a
/// `search_places` call; everything else gets a text answer.
fn wants_tool_call(body: &Value) -> bool {
    let offers_tools = body["tools"].as_array().is_some_and(|t| !t.is_empty());
    let last_role = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["role"].as_str())
        .unwrap_or_default();
    offers_tools && last_role != "tool"
}

fn text_answer(body: &Value) -> String {
    if body["tools"].is_array() {
        return "Joe Coffee is the top pick near Times Square.".into();
    }
    let last = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default();
    format!("echo: {last}")
}

async fn models(State(fake): State<Arc<FakeBackend>>) -> Response {
    if fake.ready.load(Ordering::SeqCst) {
        Json(json!({ "object": "list", "data": [{ "id": "fake-model" }] })).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "loading").into_response()
    }
}

async fn completions(State(fake): State<Arc<FakeBackend>>, Json(body): Json<Value>) -> Response {
    fake.completions.fetch_add(1, Ordering::SeqCst);
    let tool_turn = wants_tool_call(&body);

    if body["stream"].as_bool().unwrap_or(false) {
        let chunks: Vec<Value> = if tool_turn {
            vec![
                json!({ "choices": [{ "delta": { "tool_calls": [{
                    "index": 0,
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "search_places", "arguments": "{\"query\":\"coffee" }
                }]}}]}),
                json!({ "choices": [{ "delta": { "tool_calls": [{
                    "index": 0,
                    "function": { "arguments": " shops\",\"location\":\"Times Square\"}" }
                }]}, "finish_reason": "tool_calls" }]}),
            ]
        } else {
            let answer = text_answer(&body);
            let (head, tail) = answer.split_at(answer.len() / 2);
            vec![
                json!({ "choices": [{ "delta": { "role": "assistant", "content": head } }] }),
                json!({ "choices": [{ "delta": { "content": tail } }] }),
                json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] }),
            ]
        };

        let mut sse = String::new();
        for chunk in chunks {
            sse.push_str(&format!("data: {chunk}\n\n"));
        }
        sse.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    let message = if tool_turn {
        json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": {
                    "name": "search_places",
                    "arguments": "{\"query\":\"coffee shops\",\"location\":\"Times Square\"}"
                }
            }]
        })
    } else {
        json!({ "role": "assistant", "content": text_answer(&body) })
    };

    Json(json!({
        "id": "fake-1",
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": if tool_turn { "tool_calls" } else { "stop" },
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19 }
    }))
    .into_response()
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_backend(ready: bool) -> (Arc<FakeBackend>, String) {
    let fake = Arc::new(FakeBackend::default());
    fake.ready.store(ready, Ordering::SeqCst);
    let app = Router::new()
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(completions))
        .with_state(Arc::clone(&fake));
    let addr = spawn(app).await;
    (fake, format!("http://{addr}/v1"))
}

// ── Fake tool ───────────────────────────────────────────────────────

struct FakePlaces;

#[async_trait]
impl Tool for FakePlaces {
    fn name(&self) -> &str {
        "search_places"
    }

    fn description(&self) -> &str {
        "Find places matching a query near a location"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "location": { "type": "string" }
            },
            "required": ["query", "location"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        Ok(json!({
            "places": [{
                "name": "Joe Coffee",
                "address": format!("near {}", args["location"].as_str().unwrap_or_default()),
                "rating": 4.6
            }]
        }))
    }
}

// ── Gateway under test ──────────────────────────────────────────────

async fn spawn_gateway(backend_url: &str) -> String {
    let backend = BackendConfig {
        base_url: backend_url.to_string(),
        model: "fake-model".into(),
        health_timeout_secs: 1.0,
        infer_timeout_secs: 5.0,
        ..Default::default()
    };
    let provider = OpenAiProvider::new(&backend).unwrap();

    let tools_config = ToolsConfig::default();
    let mut registry = ToolRegistry::new();
    registry.register_tool(Arc::new(FakePlaces), &tools_config);
    let invoker = ToolInvoker::new(Arc::new(registry), tools_config.retry_backoff());

    let settings = AgentSettings {
        deadline_secs: 10.0,
        ..Default::default()
    };
    let agent = AgentLoop::new(Arc::new(provider), invoker, settings);
    let state = Arc::new(AppState::new(Arc::new(agent)));

    let addr = spawn(router(state)).await;
    format!("http://{addr}")
}

/// `data:` payloads of an SSE body, in order.
fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| payload.trim().to_string())
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_healthz_is_always_ok() {
    let gateway = spawn_gateway("http://127.0.0.1:9/v1").await;
    let resp = reqwest::get(format!("{gateway}/healthz")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn test_readyz_follows_backend() {
    let (fake, backend) = spawn_backend(false).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::get(format!("{gateway}/readyz")).await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ready"], false);

    fake.ready.store(true, Ordering::SeqCst);
    let resp = reqwest::get(format!("{gateway}/readyz")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_agent_runs_tool_round_trip() {
    let (fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/agent"))
        .json(&json!({ "input": "Find top coffee shops near Times Square" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["output"], "Joe Coffee is the top pick near Times Square.");
    assert_eq!(body["turns"], 2);
    assert_eq!(body["tool_calls"], 1);
    assert_eq!(fake.completions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_agent_rejects_empty_input() {
    let (_fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;
    let client = reqwest::Client::new();

    for path in ["/agent", "/agent/stream"] {
        let resp = client
            .post(format!("{gateway}{path}"))
            .json(&json!({ "input": "   " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{path}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["kind"], "InvalidRequest", "{path}");
    }
}

#[tokio::test]
async fn test_agent_rejects_malformed_body() {
    let (_fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/agent"))
        .header(header::CONTENT_TYPE.as_str(), "application/json")
        .body("{\"prompt\": 1}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "InvalidRequest");
}

#[tokio::test]
async fn test_agent_reports_unreachable_backend() {
    let gateway = spawn_gateway("http://127.0.0.1:9/v1").await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/agent"))
        .json(&json!({ "input": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "BackendUnavailable");
}

#[tokio::test]
async fn test_agent_stream_emits_tool_events_then_final() {
    let (_fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/agent/stream"))
        .json(&json!({ "input": "Find top coffee shops near Times Square" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()[header::CONTENT_TYPE.as_str()]
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("event: final"));

    let events: Vec<Value> = sse_data(&body)
        .iter()
        .filter(|d| !d.is_empty())
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();

    let call = kinds.iter().position(|k| *k == "tool_call").unwrap();
    let result = kinds.iter().position(|k| *k == "tool_result").unwrap();
    assert!(call < result);
    assert_eq!(kinds.last(), Some(&"final"));

    let tool_result = &events[result];
    assert_eq!(tool_result["name"], "search_places");
    assert_eq!(tool_result["ok"], true);

    let streamed: String = events
        .iter()
        .filter(|e| e["type"] == "delta")
        .filter_map(|e| e["text"].as_str())
        .collect();
    assert_eq!(streamed, "Joe Coffee is the top pick near Times Square.");
    assert_eq!(events.last().unwrap()["output"], streamed);
}

#[tokio::test]
async fn test_chat_completions_blocking() {
    let (_fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({
            "model": "anything",
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "ping" }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "fake-model");
    assert_eq!(body["choices"][0]["message"]["content"], "echo: ping");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 19);
}

#[tokio::test]
async fn test_chat_completions_streaming_ends_with_done() {
    let (_fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({
            "stream": true,
            "messages": [{ "role": "user", "content": "ping" }]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = resp.text().await.unwrap();
    let data = sse_data(&body);
    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));

    let chunks: Vec<Value> = data[..data.len() - 1]
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));

    let id = chunks[0]["id"].as_str().unwrap();
    assert!(chunks.iter().all(|c| c["id"] == id));

    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "echo: ping");
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_chat_completions_rejects_orphan_tool_message() {
    let (fake, backend) = spawn_backend(true).await;
    let gateway = spawn_gateway(&backend).await;

    let resp = reqwest::Client::new()
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({
            "messages": [
                { "role": "user", "content": "hi" },
                { "role": "tool", "tool_call_id": "call_9", "content": "{}" }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "InvalidRequest");
    assert_eq!(fake.completions.load(Ordering::SeqCst), 0);
}
