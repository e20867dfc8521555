//! Reasons a conversation loop aborts.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::conversation::ConversationError;
use crate::provider::BackendError;

/// Client-visible abort categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    BackendUnavailable,
    BackendError,
    MalformedToolCall,
    BudgetExhausted,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::BackendError => "BackendError",
            ErrorKind::MalformedToolCall => "MalformedToolCall",
            ErrorKind::BudgetExhausted => "BudgetExhausted",
            ErrorKind::InvalidRequest => "InvalidRequest",
        }
    }

    /// HTTP status used by the gateway for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::BackendUnavailable
            | ErrorKind::BackendError
            | ErrorKind::MalformedToolCall => 502,
            ErrorKind::BudgetExhausted => 504,
            ErrorKind::InvalidRequest => 400,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error of a conversation loop.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn turns_exhausted(max_turns: u32) -> Self {
        Self::new(
            ErrorKind::BudgetExhausted,
            format!("no final answer within {max_turns} turns"),
        )
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(
            ErrorKind::BudgetExhausted,
            "request deadline reached before a final answer",
        )
    }
}

impl From<BackendError> for AgentError {
    fn from(err: BackendError) -> Self {
        let kind = match &err {
            BackendError::Unavailable { .. } => ErrorKind::BackendUnavailable,
            BackendError::Status { .. } | BackendError::InvalidResponse { .. } => {
                ErrorKind::BackendError
            }
            BackendError::MalformedToolCall { .. } => ErrorKind::MalformedToolCall,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ConversationError> for AgentError {
    fn from(err: ConversationError) -> Self {
        Self::invalid_request(err.to_string())
    }
}
