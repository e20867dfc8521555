//! JSON error responses for the HTTP surface.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::agent::{AgentError, ConversationError};
use crate::provider::BackendError;

/// Error returned from a handler. Renders as
/// `{"error": {"kind": ..., "message": ...}}` with the kind's status code.
#[derive(Debug)]
pub struct ApiError(pub AgentError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(kind = %self.0.kind, error = %self.0.message, "Request failed");
        }
        let body = json!({ "error": self.0 });
        (status, Json(body)).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self(err.into())
    }
}

impl From<ConversationError> for ApiError {
    fn from(err: ConversationError) -> Self {
        Self(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(AgentError::invalid_request(rejection.body_text()))
    }
}
