//! Tool dispatch: validation, timeout, retry, and ordered fan-out.

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{schema, ToolFailure, ToolFailureKind, ToolRegistry};
use crate::provider::types::{ChatMessage, ToolCallRequest};

/// Outcome of one tool call, ready to be fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub outcome: Result<Value, ToolFailure>,
    pub attempts: u32,
    pub latency: Duration,
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure_kind(&self) -> Option<ToolFailureKind> {
        self.outcome.as_ref().err().map(|f| f.kind)
    }

    /// Serialized payload as it appears in the tool message.
    pub fn content(&self) -> String {
        match &self.outcome {
            Ok(Value::String(s)) => s.clone(),
            Ok(value) => value.to_string(),
            Err(failure) => json!({ "error": failure }).to_string(),
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::tool_result(&self.id, &self.name, &self.content())
    }

    fn failed(call: &ToolCallRequest, failure: ToolFailure, attempts: u32, started: Instant) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome: Err(failure),
            attempts,
            latency: started.elapsed(),
        }
    }
}

/// Dispatches tool calls against a shared registry.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    retry_backoff: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, retry_backoff: Duration) -> Self {
        Self {
            registry,
            retry_backoff,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run a single call. Never panics and never returns an error: every
    /// failure is folded into the result.
    pub async fn invoke(&self, call: &ToolCallRequest) -> ToolCallResult {
        let started = Instant::now();

        let Some(entry) = self.registry.resolve(&call.name) else {
            warn!(tool = %call.name, id = %call.id, "Model requested unknown tool");
            return ToolCallResult::failed(
                call,
                ToolFailure::new(
                    ToolFailureKind::UnknownTool,
                    format!("no tool named '{}'", call.name),
                ),
                0,
                started,
            );
        };

        if let Err(reason) = schema::validate_arguments(&entry.spec.parameters, &call.arguments) {
            debug!(tool = %call.name, %reason, "Rejected tool arguments");
            return ToolCallResult::failed(
                call,
                ToolFailure::new(ToolFailureKind::InvalidArguments, reason),
                0,
                started,
            );
        }

        let spec = &entry.spec;
        let max_attempts = if spec.idempotent {
            spec.max_retries + 1
        } else {
            1
        };

        let mut attempts = 0;
        let failure = loop {
            attempts += 1;
            let (failure, retryable) =
                match tokio::time::timeout(spec.timeout, entry.handler.execute(&call.arguments))
                    .await
                {
                    Ok(Ok(value)) => {
                        debug!(
                            tool = %call.name,
                            attempts,
                            latency_ms = started.elapsed().as_millis() as u64,
                            "Tool call succeeded"
                        );
                        return ToolCallResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            outcome: Ok(value),
                            attempts,
                            latency: started.elapsed(),
                        };
                    }
                    Ok(Err(e)) => {
                        let retryable = e.is_retryable();
                        (
                            ToolFailure::new(ToolFailureKind::ToolExecutionError, e.to_string()),
                            retryable,
                        )
                    }
                    Err(_) => (
                        ToolFailure::new(
                            ToolFailureKind::ToolTimeout,
                            format!("'{}' timed out after {:?}", call.name, spec.timeout),
                        ),
                        true,
                    ),
                };

            if !retryable || attempts >= max_attempts {
                break failure;
            }
            warn!(
                tool = %call.name,
                attempt = attempts,
                error = %failure.message,
                "Tool call failed, retrying"
            );
            tokio::time::sleep(self.retry_backoff).await;
        };

        warn!(
            tool = %call.name,
            kind = ?failure.kind,
            attempts,
            error = %failure.message,
            "Tool call failed"
        );
        ToolCallResult::failed(call, failure, attempts, started)
    }

    /// Run all calls with at most `max_concurrent` in flight. A freed slot is
    /// refilled as soon as any call finishes. Results come back in the order
    /// the calls were requested, whatever order they finish in.
    pub async fn invoke_all(
        &self,
        calls: &[ToolCallRequest],
        max_concurrent: usize,
    ) -> Vec<ToolCallResult> {
        let pending: Vec<_> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| async move { (index, self.invoke(call).await) })
            .collect();

        let mut finished: Vec<(usize, ToolCallResult)> = stream::iter(pending)
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await;
        finished.sort_unstable_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, result)| result).collect()
    }
}
