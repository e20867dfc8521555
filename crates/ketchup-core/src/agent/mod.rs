//! Agent loop: drives a tool-calling conversation to completion.
//!
//! One request runs one [`ConversationLoop`]:
//! 1. Seed the conversation (system preamble + user input)
//! 2. Ask the backend for an assistant turn (`AwaitingModel`)
//! 3. If the turn requests tools, dispatch them concurrently, append the
//!    results in request order and go back to 2 (`ToolsRequested`)
//! 4. Otherwise the turn's content is the answer (`FinalAnswer`)
//!
//! The turn limit, the request deadline, backend failures and repeated
//! malformed tool calls end the loop in `Aborted`.

pub mod budget;
pub mod conversation;
pub mod error;
pub mod stream;

use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout_at;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::AgentSettings;
use crate::provider::types::{ChatMessage, StreamEvent, ToolCallRequest, ToolDefinition};
use crate::provider::LlmProvider;
use crate::tools::ToolInvoker;

pub use budget::LoopBudget;
pub use conversation::{Conversation, ConversationError};
pub use error::{AgentError, ErrorKind};
pub use stream::{strip_reasoning, AgentEvent, AgentEventStream, ThinkFilter};

const EVENT_BUFFER: usize = 64;

const FINALIZE_INSTRUCTION: &str = "The tool calls keep failing. Do not call any more tools. \
     Answer the user now with the information you already have.";

/// Successful result of a loop run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub output: String,
    pub turns: u32,
    pub tool_calls: usize,
}

/// Loop states. `FinalAnswer` and `Aborted` are terminal.
#[derive(Debug)]
pub enum LoopState {
    AwaitingModel,
    ToolsRequested(Vec<ToolCallRequest>),
    FinalAnswer(String),
    Aborted(AgentError),
}

/// Shared, request-independent parts of the agent: backend, tools and limits.
///
/// Cheap to share behind an `Arc`; every request gets its own
/// [`ConversationLoop`].
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    invoker: ToolInvoker,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn LlmProvider>, invoker: ToolInvoker, settings: AgentSettings) -> Self {
        Self {
            provider,
            invoker,
            settings,
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn start(
        &self,
        input: &str,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<ConversationLoop<'_>, AgentError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AgentError::invalid_request("input must not be empty"));
        }
        let conversation = Conversation::seeded(&self.settings.system_prompt, input);
        Ok(ConversationLoop::new(self, conversation, events))
    }

    /// Run one request to a terminal state and return the final answer.
    pub async fn run(&self, input: &str) -> Result<AgentOutput, AgentError> {
        let started = Instant::now();
        let result = self.start(input, None)?.run().await;
        log_outcome(&result, started);
        result
    }

    /// Streaming variant of [`run`](Self::run).
    ///
    /// The loop runs on its own task. The returned stream yields deltas and
    /// tool progress, then exactly one terminal `Final` or `Error` event.
    pub fn run_stream(self: Arc<Self>, input: String) -> AgentEventStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let started = Instant::now();
            let result = match self.start(&input, Some(tx.clone())) {
                Ok(run) => run.run().await,
                Err(e) => Err(e),
            };
            log_outcome(&result, started);

            let terminal = match result {
                Ok(out) => AgentEvent::Final { output: out.output },
                Err(e) => e.into(),
            };
            if tx.send(terminal).await.is_err() {
                debug!("Stream client went away before the terminal event");
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

fn log_outcome(result: &Result<AgentOutput, AgentError>, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(out) => info!(
            turns = out.turns,
            tool_calls = out.tool_calls,
            elapsed_ms,
            "Agent run complete"
        ),
        Err(e) => warn!(kind = %e.kind, error = %e.message, elapsed_ms, "Agent run aborted"),
    }
}

/// One assistant turn as seen by the loop.
struct ModelTurn {
    content: String,
    tool_calls: Vec<ToolCallRequest>,
}

/// Single-use state machine for one request.
pub struct ConversationLoop<'a> {
    agent: &'a AgentLoop,
    conversation: Conversation,
    budget: LoopBudget,
    tool_defs: Vec<ToolDefinition>,
    events: Option<mpsc::Sender<AgentEvent>>,
    reprompts_used: u32,
    failed_rounds: u32,
    finalizing: bool,
    tool_calls_made: usize,
}

impl<'a> ConversationLoop<'a> {
    fn new(
        agent: &'a AgentLoop,
        conversation: Conversation,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Self {
        Self {
            agent,
            conversation,
            budget: LoopBudget::from_settings(&agent.settings),
            tool_defs: agent.invoker.registry().definitions(),
            events,
            reprompts_used: 0,
            failed_rounds: 0,
            finalizing: false,
            tool_calls_made: 0,
        }
    }

    /// Drive the state machine until it reaches a terminal state.
    pub async fn run(mut self) -> Result<AgentOutput, AgentError> {
        let mut state = LoopState::AwaitingModel;
        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    if self.events.as_ref().is_some_and(|tx| tx.is_closed()) {
                        debug!("Stream client disconnected; stopping loop");
                        return Err(AgentError::invalid_request("client disconnected"));
                    }
                    self.await_model().await
                }
                LoopState::ToolsRequested(calls) => self.dispatch_tools(calls).await,
                LoopState::FinalAnswer(output) => {
                    return Ok(AgentOutput {
                        output,
                        turns: self.budget.turns_used(),
                        tool_calls: self.tool_calls_made,
                    })
                }
                LoopState::Aborted(err) => return Err(err),
            };
        }
    }

    async fn await_model(&mut self) -> LoopState {
        if !self.conversation.awaits_assistant() {
            return LoopState::Aborted(ConversationError::AssistantTurnPending.into());
        }

        let turn = match self.budget.start_turn() {
            Ok(turn) => turn,
            Err(e) => return LoopState::Aborted(e),
        };

        debug!(
            turn,
            messages = self.conversation.len(),
            finalizing = self.finalizing,
            "Calling model"
        );

        let result = if self.events.is_some() {
            self.stream_turn().await
        } else {
            self.complete_turn().await
        };

        match result {
            Ok(turn) if turn.tool_calls.is_empty() => {
                let output = if self.agent.settings.strip_reasoning {
                    strip_reasoning(&turn.content)
                } else {
                    turn.content.clone()
                };
                self.append_or_abort(ChatMessage::assistant(&turn.content))
                    .unwrap_or(LoopState::FinalAnswer(output))
            }
            Ok(turn) => {
                let message =
                    ChatMessage::assistant_with_tool_calls(Some(turn.content.as_str()), &turn.tool_calls);
                self.append_or_abort(message)
                    .unwrap_or(LoopState::ToolsRequested(turn.tool_calls))
            }
            Err(err)
                if err.kind == ErrorKind::MalformedToolCall
                    && self.reprompts_used < self.agent.settings.max_reprompts =>
            {
                self.reprompts_used += 1;
                warn!(
                    reprompt = self.reprompts_used,
                    error = %err.message,
                    "Model emitted a malformed tool call; re-prompting"
                );
                let correction = format!(
                    "Your last tool call could not be parsed ({}). Call the tool again with \
                     arguments that are a single valid JSON object, or answer directly.",
                    err.message
                );
                self.append_or_abort(ChatMessage::user(&correction))
                    .unwrap_or(LoopState::AwaitingModel)
            }
            Err(err) => LoopState::Aborted(err),
        }
    }

    fn active_tools(&self) -> &[ToolDefinition] {
        if self.finalizing {
            &[]
        } else {
            &self.tool_defs[..]
        }
    }

    async fn complete_turn(&self) -> Result<ModelTurn, AgentError> {
        let call = self
            .agent
            .provider
            .complete(self.conversation.messages(), self.active_tools());
        let response = timeout_at(self.budget.deadline(), call)
            .await
            .map_err(|_| AgentError::deadline_exceeded())??;

        debug!(
            tokens = response.usage.total_tokens,
            finish_reason = %response.finish_reason,
            tool_calls = response.tool_calls.len(),
            "Model turn complete"
        );
        Ok(ModelTurn {
            content: response.content.unwrap_or_default(),
            tool_calls: response.tool_calls,
        })
    }

    /// Forward content deltas as they arrive. Tool calls are only taken from
    /// the final `Completed` event, never from partial chunks.
    async fn stream_turn(&self) -> Result<ModelTurn, AgentError> {
        let deadline = self.budget.deadline();
        let strip = self.agent.settings.strip_reasoning;

        let open = self
            .agent
            .provider
            .stream(self.conversation.messages(), self.active_tools());
        let mut events = timeout_at(deadline, open)
            .await
            .map_err(|_| AgentError::deadline_exceeded())??;

        let mut filter = ThinkFilter::new();
        loop {
            let next = timeout_at(deadline, events.next())
                .await
                .map_err(|_| AgentError::deadline_exceeded())?;

            match next {
                Some(Ok(StreamEvent::Delta(text))) => {
                    let visible = if strip { filter.push(&text) } else { text };
                    self.emit_text(visible).await;
                }
                Some(Ok(StreamEvent::Completed {
                    content,
                    tool_calls,
                    finish_reason,
                })) => {
                    if strip {
                        self.emit_text(filter.finish()).await;
                    }
                    debug!(
                        finish_reason = %finish_reason,
                        tool_calls = tool_calls.len(),
                        "Streamed model turn complete"
                    );
                    return Ok(ModelTurn {
                        content,
                        tool_calls,
                    });
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(AgentError::new(
                        ErrorKind::BackendError,
                        "backend stream ended without a completion",
                    ))
                }
            }
        }
    }

    async fn dispatch_tools(&mut self, calls: Vec<ToolCallRequest>) -> LoopState {
        for call in &calls {
            info!(tool = %call.name, id = %call.id, "Dispatching tool call");
            self.emit(AgentEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
            })
            .await;
        }

        let results = self
            .agent
            .invoker
            .invoke_all(&calls, self.budget.max_concurrent_tools())
            .await;
        self.tool_calls_made += results.len();

        for result in &results {
            self.emit(AgentEvent::from(result)).await;
        }

        // Results that land after the deadline are never integrated.
        if let Err(e) = self.budget.check_deadline() {
            return LoopState::Aborted(e);
        }

        let all_failed = results.iter().all(|r| !r.is_success());
        for result in &results {
            if let Some(aborted) = self.append_or_abort(result.to_message()) {
                return aborted;
            }
        }

        if all_failed {
            self.failed_rounds += 1;
        } else {
            self.failed_rounds = 0;
        }

        let limit = self.agent.settings.max_failed_rounds;
        if limit > 0 && self.failed_rounds >= limit && !self.finalizing {
            warn!(
                rounds = self.failed_rounds,
                "Every tool call failed in consecutive rounds; asking the model to finalize"
            );
            self.finalizing = true;
            if let Some(aborted) = self.append_or_abort(ChatMessage::user(FINALIZE_INSTRUCTION)) {
                return aborted;
            }
        }

        LoopState::AwaitingModel
    }

    /// Append to the transcript. Returns the abort state on an invariant
    /// violation, which only happens when the backend reuses tool-call ids.
    fn append_or_abort(&mut self, message: ChatMessage) -> Option<LoopState> {
        self.conversation.push(message).err().map(|e| {
            LoopState::Aborted(AgentError::new(ErrorKind::MalformedToolCall, e.to_string()))
        })
    }

    async fn emit_text(&self, text: String) {
        if !text.is_empty() {
            self.emit(AgentEvent::Delta { text }).await;
        }
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            // A closed channel is noticed at the top of the next turn.
            let _ = tx.send(event).await;
        }
    }
}
