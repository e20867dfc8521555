//! Inference backend client.
//!
//! Defines the `LlmProvider` trait the conversation loop talks to. The
//! `openai` module implements it for any OpenAI-compatible server (vLLM,
//! llama.cpp, etc.); tests substitute scripted providers.

pub mod error;
pub mod openai;
pub mod streaming;
pub mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::BackendError;
use types::{ChatMessage, LlmResponse, StreamEvent, ToolDefinition};

/// Finite, non-restartable sequence of streaming events for one turn.
pub type EventStream = BoxStream<'static, Result<StreamEvent, BackendError>>;

/// Trait for inference backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the whole assistant turn.
    ///
    /// Returned tool calls always have parseable ids, names and arguments;
    /// anything else is reported as [`BackendError::MalformedToolCall`].
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, BackendError>;

    /// Start a streaming chat completion.
    ///
    /// The stream ends with exactly one [`StreamEvent::Completed`] on success.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<EventStream, BackendError>;

    /// Lightweight readiness check. Never errors and never retries.
    async fn probe_ready(&self) -> bool;

    /// Model identifier sent with every request.
    fn model(&self) -> &str;
}
