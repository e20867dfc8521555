//! Route handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ApiError, SharedState};
use crate::agent::{AgentError, Conversation};
use crate::provider::types::{ChatMessage, LlmResponse, StreamEvent, ToolCallMessage};
use crate::provider::EventStream;

// ============================================================================
// Health
// ============================================================================

pub fn health_routes() -> Router<SharedState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn readyz(State(state): State<SharedState>) -> Response {
    if state.check_ready().await {
        Json(json!({ "ready": true })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "error": "inference backend is not reachable" })),
        )
            .into_response()
    }
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AgentRequest {
    pub input: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: String,
    pub turns: u32,
    pub tool_calls: usize,
}

pub fn agent_routes() -> Router<SharedState> {
    Router::new()
        .route("/agent", post(agent))
        .route("/agent/stream", post(agent_stream))
}

async fn agent(
    State(state): State<SharedState>,
    body: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<Json<AgentResponse>, ApiError> {
    let Json(req) = body?;
    let out = state.agent.run(&req.input).await?;
    Ok(Json(AgentResponse {
        output: out.output,
        turns: out.turns,
        tool_calls: out.tool_calls,
    }))
}

async fn agent_stream(
    State(state): State<SharedState>,
    body: Result<Json<AgentRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Json(req) = body?;
    // Reject before switching to an event stream so bad input gets a plain 400.
    if req.input.trim().is_empty() {
        return Err(AgentError::invalid_request("input must not be empty").into());
    }

    let events = Arc::clone(&state.agent)
        .run_stream(req.input)
        .map(|event| Event::default().event(event.name()).json_data(&event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============================================================================
// OpenAI-compatible pass-through
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Accepted for compatibility; the configured backend model is always used.
    #[serde(default)]
    pub model: Option<String>,
}

pub fn completion_routes() -> Router<SharedState> {
    Router::new().route("/v1/chat/completions", post(chat_completions))
}

async fn chat_completions(
    State(state): State<SharedState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    let conversation = Conversation::from_messages(req.messages)?;
    let provider = Arc::clone(state.agent.provider());

    if let Some(requested) = req.model.as_deref().filter(|m| *m != provider.model()) {
        debug!(requested, serving = provider.model(), "Ignoring client model override");
    }

    let meta = CompletionMeta::new(provider.model());

    if req.stream {
        let events = provider.stream(conversation.messages(), &[]).await?;
        Ok(Sse::new(completion_chunks(events, meta)).into_response())
    } else {
        let response = provider.complete(conversation.messages(), &[]).await?;
        Ok(Json(meta.completion(response)).into_response())
    }
}

/// Identity shared by every chunk of one pass-through response.
#[derive(Debug, Clone)]
struct CompletionMeta {
    id: String,
    model: String,
    created: i64,
}

impl CompletionMeta {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn completion(&self, response: LlmResponse) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": response.content,
        });
        if !response.tool_calls.is_empty() {
            let calls: Vec<ToolCallMessage> =
                response.tool_calls.iter().map(ToolCallMessage::from).collect();
            message["tool_calls"] = json!(calls);
        }
        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": response.finish_reason,
            }],
            "usage": response.usage,
        })
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Event {
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        Event::default().data(body.to_string())
    }
}

/// Role chunk, one chunk per delta, a finish chunk, then `[DONE]`. A backend
/// failure mid-stream becomes a final content chunk so clients still see `[DONE]`.
fn completion_chunks(
    events: EventStream,
    meta: CompletionMeta,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let head = stream::once(futures::future::ready(
        meta.chunk(json!({ "role": "assistant" }), None),
    ));

    let body = events.map(move |item| match item {
        Ok(StreamEvent::Delta(text)) => meta.chunk(json!({ "content": text }), None),
        Ok(StreamEvent::Completed { finish_reason, .. }) => {
            meta.chunk(json!({}), Some(finish_reason.as_str()))
        }
        Err(e) => {
            warn!(error = %e, "Pass-through stream failed");
            meta.chunk(
                json!({ "content": format!("Model stream failed: {e}") }),
                Some("stop"),
            )
        }
    });

    let done = stream::once(futures::future::ready(Event::default().data("[DONE]")));

    head.chain(body).chain(done).map(Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{ToolCallRequest, Usage};
    use serde_json::Map;

    #[test]
    fn test_completion_body_shape() {
        let meta = CompletionMeta::new("qwen");
        let body = meta.completion(LlmResponse {
            content: Some("Hi".into()),
            tool_calls: vec![],
            finish_reason: "stop".into(),
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 1,
                total_tokens: 4,
            },
        });

        assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "qwen");
        assert_eq!(body["choices"][0]["message"]["content"], "Hi");
        assert!(body["choices"][0]["message"].get("tool_calls").is_none());
        assert_eq!(body["usage"]["total_tokens"], 4);
    }

    #[test]
    fn test_completion_body_carries_tool_calls() {
        let meta = CompletionMeta::new("qwen");
        let body = meta.completion(LlmResponse {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: "call_1".into(),
                name: "search_places".into(),
                arguments: Map::new(),
            }],
            finish_reason: "tool_calls".into(),
            usage: Usage::default(),
        });

        let call = &body["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["arguments"], "{}");
    }
}
