//! Inference backend error types.
//!
//! Structured logging is the caller's responsibility; these variants carry the
//! context needed to build a useful log line or client-facing error.

use thiserror::Error;

/// Errors raised by an [`LlmProvider`](super::LlmProvider).
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connect failure, transport error, or request timeout.
    #[error("inference backend unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// The backend answered with a non-success HTTP status.
    #[error("inference backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The backend answered 2xx but the body did not match the chat-completions shape.
    #[error("invalid response from inference backend: {reason}")]
    InvalidResponse { reason: String },

    /// A tool call in the response had unparseable arguments or no name.
    #[error("malformed tool call '{tool}': {reason}")]
    MalformedToolCall {
        tool: String,
        reason: String,
        raw_arguments: String,
    },
}

impl BackendError {
    pub(crate) fn unavailable(endpoint: &str, err: impl std::fmt::Display) -> Self {
        BackendError::Unavailable {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether a transport-level retry may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable { .. } => true,
            BackendError::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}
