//! Client-facing events of a streaming agent run.

use futures::stream::BoxStream;
use serde::Serialize;

use super::error::{AgentError, ErrorKind};
use crate::tools::{ToolCallResult, ToolFailureKind};

/// Events emitted by [`AgentLoop::run_stream`](super::AgentLoop::run_stream).
///
/// Any number of non-terminal events is followed by exactly one `Final` or
/// `Error`, after which the stream ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Delta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
    },
    ToolResult {
        id: String,
        name: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<ToolFailureKind>,
    },
    Final {
        output: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Final { .. } | AgentEvent::Error { .. })
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Delta { .. } => "delta",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Final { .. } => "final",
            AgentEvent::Error { .. } => "error",
        }
    }
}

impl From<AgentError> for AgentEvent {
    fn from(err: AgentError) -> Self {
        AgentEvent::Error {
            kind: err.kind,
            message: err.message,
        }
    }
}

impl From<&ToolCallResult> for AgentEvent {
    fn from(result: &ToolCallResult) -> Self {
        AgentEvent::ToolResult {
            id: result.id.clone(),
            name: result.name.clone(),
            ok: result.is_success(),
            kind: result.failure_kind(),
        }
    }
}

pub type AgentEventStream = BoxStream<'static, AgentEvent>;

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Incrementally removes `<think>…</think>` reasoning blocks from text that
/// arrives in arbitrary chunks. Tags match case-insensitively and may be split
/// across chunks.
///
/// Leading whitespace is dropped and trailing whitespace is held back until
/// more visible text follows, so the concatenated output equals
/// [`strip_reasoning`] of the whole text.
#[derive(Debug, Default)]
pub struct ThinkFilter {
    inside: bool,
    pending: String,
    started: bool,
    held_whitespace: String,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the visible text it releases.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut visible = String::new();

        loop {
            let tag = if self.inside { CLOSE_TAG } else { OPEN_TAG };
            if let Some(pos) = find_tag(&self.pending, tag) {
                if !self.inside {
                    visible.push_str(&self.pending[..pos]);
                }
                self.pending.drain(..pos + tag.len());
                self.inside = !self.inside;
                continue;
            }

            // Hold back a suffix that could be the start of the next tag.
            let keep = partial_tag_suffix(&self.pending, tag);
            let split = self.pending.len() - keep;
            if !self.inside {
                visible.push_str(&self.pending[..split]);
            }
            self.pending.drain(..split);
            return self.release(visible);
        }
    }

    /// Flush held-back text at end of stream. An unterminated block and
    /// trailing whitespace are dropped.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        let out = if self.inside {
            String::new()
        } else {
            self.release(rest)
        };
        self.held_whitespace.clear();
        out
    }

    fn release(&mut self, visible: String) -> String {
        let text = if self.started {
            visible.as_str()
        } else {
            visible.trim_start()
        };
        let body = text.trim_end();
        if body.is_empty() {
            if self.started {
                self.held_whitespace.push_str(text);
            }
            return String::new();
        }

        self.started = true;
        let mut out = std::mem::take(&mut self.held_whitespace);
        out.push_str(body);
        self.held_whitespace.push_str(&text[body.len()..]);
        out
    }
}

/// Remove reasoning blocks from a complete text and trim it.
pub fn strip_reasoning(text: &str) -> String {
    let mut filter = ThinkFilter::new();
    let mut out = filter.push(text);
    out.push_str(&filter.finish());
    out
}

/// Byte offset of the first ASCII case-insensitive occurrence of `tag`.
fn find_tag(text: &str, tag: &str) -> Option<usize> {
    text.as_bytes()
        .windows(tag.len())
        .position(|w| w.eq_ignore_ascii_case(tag.as_bytes()))
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    let bytes = text.as_bytes();
    (1..tag.len())
        .rev()
        .find(|&n| {
            bytes.len() >= n && bytes[bytes.len() - n..].eq_ignore_ascii_case(&tag.as_bytes()[..n])
        })
        .unwrap_or(0)
}
