//! OpenAI-compatible inference backend.
//!
//! Talks to any server exposing `/chat/completions` and `/models` (vLLM,
//! llama.cpp server, Ollama's OpenAI shim). Direct HTTP via `reqwest`.
//!
//! Two HTTP clients are kept: one with the long inference timeout and one
//! with the short readiness-probe timeout, so a slow completion never holds
//! up a probe.

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::error::BackendError;
use super::streaming::{assemble_tool_call, parse_sse_stream};
use super::types::{ChatMessage, LlmResponse, ToolDefinition, Usage};
use super::{EventStream, LlmProvider};
use crate::config::{secs_to_duration, BackendConfig};

/// Base delay for exponential backoff between transport retries (milliseconds).
const BASE_DELAY_MS: u64 = 500;

/// Upper bound on random jitter added to each backoff (milliseconds).
const MAX_JITTER_MS: u64 = 250;

pub struct OpenAiProvider {
    client: Client,
    health_client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    send_n_predict: bool,
    transport_retries: u32,
}

impl OpenAiProvider {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let client = Client::builder()
            .connect_timeout(secs_to_duration(config.connect_timeout_secs))
            .timeout(secs_to_duration(config.infer_timeout_secs))
            .pool_max_idle_per_host(config.max_connections)
            .build()
            .map_err(|e| BackendError::unavailable(&base_url, e))?;

        let health_client = Client::builder()
            .timeout(secs_to_duration(config.health_timeout_secs))
            .build()
            .map_err(|e| BackendError::unavailable(&base_url, e))?;

        debug!(base_url = %base_url, model = %config.model, "Initialized inference backend client");

        Ok(Self {
            client,
            health_client,
            api_key: config.api_key.clone(),
            base_url,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            send_n_predict: config.send_n_predict,
            transport_retries: config.transport_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolDefinition],
        stream: bool,
    ) -> CompletionRequest<'a> {
        let tools_opt = if tools.is_empty() { None } else { Some(tools) };
        CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: tools_opt,
            tool_choice: tools_opt.map(|_| "auto"),
            stream: stream.then_some(true),
            // llama.cpp's OpenAI shim ignores max_tokens on some paths.
            n_predict: self.send_n_predict.then_some(self.max_tokens),
        }
    }

    /// POST the request, retrying transient failures up to `transport_retries`
    /// times with exponential backoff. Returns a response with a 2xx status.
    async fn send_with_retry(
        &self,
        body: &CompletionRequest<'_>,
    ) -> Result<reqwest::Response, BackendError> {
        let url = self.completions_url();
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                let delay = BASE_DELAY_MS * 2u64.pow(attempt - 1)
                    + rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
                warn!(attempt, delay_ms = delay, "Retrying inference backend request");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let result = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    Err(BackendError::Status {
                        status,
                        body: error_message(&text),
                    })
                }
                Err(e) => Err(BackendError::unavailable(&self.base_url, e)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.transport_retries => {
                    warn!(attempt, error = %e, "Transient inference backend error");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

// ── OpenAI API request/response types ───────────────────────────────

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n_predict: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageResponse>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallResponse>>,
}

#[derive(Deserialize)]
struct ToolCallResponse {
    #[serde(default)]
    id: Option<String>,
    function: FunctionCallResponse,
}

#[derive(Deserialize)]
struct FunctionCallResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct UsageResponse {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorResponse {
    Single(ErrorBody),
    Multiple(Vec<ErrorBody>),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorResponse {
    fn message(&self) -> String {
        match self {
            Self::Single(b) => b.error.message.clone(),
            Self::Multiple(v) => v
                .first()
                .map(|b| b.error.message.clone())
                .unwrap_or_else(|| "Unknown error".into()),
        }
    }
}

/// Prefer the structured `error.message`; fall back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.message())
        .unwrap_or_else(|_| body.to_string())
}

fn parse_completion(body: &str) -> Result<LlmResponse, BackendError> {
    let completion: CompletionResponse =
        serde_json::from_str(body).map_err(|e| BackendError::InvalidResponse {
            reason: format!("failed to parse chat completion: {e}"),
        })?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::InvalidResponse {
            reason: "backend returned no choices".into(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            assemble_tool_call(
                tc.id,
                tc.function.name,
                tc.function.arguments.as_deref().unwrap_or_default(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let usage = completion.usage.map_or(Usage::default(), |u| Usage {
        prompt_tokens: u.prompt_tokens.unwrap_or(0),
        completion_tokens: u.completion_tokens.unwrap_or(0),
        total_tokens: u.total_tokens.unwrap_or(0),
    });

    Ok(LlmResponse {
        content: choice.message.content,
        tool_calls,
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
        usage,
    })
}

// ── LlmProvider implementation ──────────────────────────────────────

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, BackendError> {
        debug!(
            model = %self.model,
            msg_count = messages.len(),
            tool_count = tools.len(),
            "Sending chat completion request"
        );

        let body = self.request_body(messages, tools, false);
        let response = self.send_with_retry(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::unavailable(&self.base_url, e))?;

        let parsed = parse_completion(&text)?;
        debug!(
            finish_reason = %parsed.finish_reason,
            tool_calls = parsed.tool_calls.len(),
            tokens = parsed.usage.total_tokens,
            "Received chat completion"
        );
        Ok(parsed)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<EventStream, BackendError> {
        debug!(
            model = %self.model,
            msg_count = messages.len(),
            tool_count = tools.len(),
            "Opening streaming chat completion"
        );

        let body = self.request_body(messages, tools, true);
        let response = self.send_with_retry(&body).await?;
        Ok(parse_sse_stream(Box::pin(response.bytes_stream()), self.base_url.clone()).boxed())
    }

    async fn probe_ready(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self
            .health_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(status = %resp.status(), "Readiness probe got non-success status");
                false
            }
            Err(e) => {
                debug!(error = %e, "Readiness probe failed");
                false
            }
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}
