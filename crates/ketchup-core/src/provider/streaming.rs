//! SSE parser for OpenAI-compatible streaming chat completions.
//!
//! Event framing is done by `eventsource-stream`. Each event's `data` is
//! parsed as a completion chunk: text deltas are forwarded immediately and
//! tool-call fragments accumulate until the backend signals the end of the
//! turn. Tool calls only leave this module fully assembled.

use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use uuid::Uuid;

use super::error::BackendError;
use super::types::{StreamEvent, ToolCallRequest};

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse the raw argument string of a tool call into a JSON object.
///
/// Empty arguments are treated as `{}`. A missing id is replaced with a
/// generated one so tool results can still be correlated.
pub(crate) fn assemble_tool_call(
    id: Option<String>,
    name: String,
    raw_arguments: &str,
) -> Result<ToolCallRequest, BackendError> {
    if name.trim().is_empty() {
        return Err(BackendError::MalformedToolCall {
            tool: String::new(),
            reason: "tool call has no function name".into(),
            raw_arguments: raw_arguments.to_string(),
        });
    }

    let raw = if raw_arguments.trim().is_empty() {
        "{}"
    } else {
        raw_arguments
    };

    let arguments = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(BackendError::MalformedToolCall {
                tool: name,
                reason: format!("arguments must be a JSON object, got {}", json_type(&other)),
                raw_arguments: raw_arguments.to_string(),
            })
        }
        Err(e) => {
            return Err(BackendError::MalformedToolCall {
                tool: name,
                reason: e.to_string(),
                raw_arguments: raw_arguments.to_string(),
            })
        }
    };

    let id = id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));

    Ok(ToolCallRequest {
        id,
        name,
        arguments,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Turn an SSE byte stream into [`StreamEvent`]s.
///
/// The returned stream is finite: it ends after the `Completed` event or after
/// the first error.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
    endpoint: String,
) -> impl Stream<Item = Result<StreamEvent, BackendError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let events = Box::pin(byte_stream.eventsource());

    stream::unfold(
        Some((events, StreamState::default())),
        move |carry| {
            let endpoint = endpoint.clone();
            async move {
                let (mut events, mut state) = carry?;
                loop {
                    let step = match events.next().await {
                        Some(Ok(event)) => state.process_data(&event.data),
                        Some(Err(EventStreamError::Transport(e))) => {
                            Err(BackendError::unavailable(&endpoint, e))
                        }
                        Some(Err(e)) => Err(BackendError::InvalidResponse {
                            reason: format!("malformed event stream: {e}"),
                        }),
                        // Body ended without `[DONE]`.
                        None if state.saw_any_chunk => state.finalize().map(Step::Finish),
                        None => Err(BackendError::InvalidResponse {
                            reason: "stream ended before any completion chunk".into(),
                        }),
                    };

                    match step {
                        Ok(Step::Continue) => continue,
                        Ok(Step::Emit(ev)) => return Some((Ok(ev), Some((events, state)))),
                        Ok(Step::Finish(ev)) => return Some((Ok(ev), None)),
                        Err(e) => return Some((Err(e), None)),
                    }
                }
            }
        },
    )
}

enum Step {
    Continue,
    Emit(StreamEvent),
    Finish(StreamEvent),
}

/// Tool-call fragments keyed by their `index` in the delta array.
#[derive(Default)]
struct PendingCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct StreamState {
    content: String,
    pending: Vec<PendingCall>,
    finish_reason: Option<String>,
    saw_any_chunk: bool,
}

impl StreamState {
    /// Handle the `data` field of one dispatched SSE event.
    fn process_data(&mut self, data: &str) -> Result<Step, BackendError> {
        let data = data.trim();
        if data == "[DONE]" {
            return self.finalize().map(Step::Finish);
        }
        if data.is_empty() {
            return Ok(Step::Continue);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(data).map_err(|e| BackendError::InvalidResponse {
                reason: format!("failed to parse SSE chunk: {e}"),
            })?;

        if let Some(err) = chunk.error {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(BackendError::InvalidResponse {
                reason: format!("backend reported a stream error: {message}"),
            });
        }

        self.saw_any_chunk = true;
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(Step::Continue);
        };

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            self.absorb_tool_delta(tc);
        }

        match choice.delta.content {
            Some(text) if !text.is_empty() => {
                self.content.push_str(&text);
                Ok(Step::Emit(StreamEvent::Delta(text)))
            }
            _ => Ok(Step::Continue),
        }
    }

    fn absorb_tool_delta(&mut self, tc: ToolCallDelta) {
        let index = tc.index.unwrap_or(0);
        let pos = match self.pending.iter().position(|p| p.index == index) {
            Some(pos) => pos,
            None => {
                self.pending.push(PendingCall {
                    index,
                    ..Default::default()
                });
                self.pending.len() - 1
            }
        };
        let pending = &mut self.pending[pos];

        if let Some(id) = tc.id.filter(|id| !id.is_empty()) {
            pending.id = Some(id);
        }
        if let Some(function) = tc.function {
            if let Some(name) = function.name {
                pending.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                pending.arguments.push_str(&args);
            }
        }
    }

    fn finalize(&mut self) -> Result<StreamEvent, BackendError> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.index);

        let tool_calls = pending
            .into_iter()
            .map(|p| assemble_tool_call(p.id, p.name, &p.arguments))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StreamEvent::Completed {
            content: std::mem::take(&mut self.content),
            tool_calls,
            finish_reason: self.finish_reason.take().unwrap_or_else(|| "stop".into()),
        })
    }
}
