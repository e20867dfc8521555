//! Append-only conversation transcript.

use thiserror::Error;

use crate::provider::types::{ChatMessage, Role};

/// Violations of the transcript invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation must contain at least one message")]
    Empty,

    #[error("tool message has no tool_call_id")]
    MissingToolCallId,

    /// A tool message whose id was not requested by the preceding assistant turn.
    #[error("tool result '{id}' does not answer a call from the preceding assistant message")]
    OrphanToolResult { id: String },

    #[error("tool call '{id}' was answered more than once")]
    DuplicateToolResult { id: String },

    #[error("conversation must end with a non-assistant message before the next model turn")]
    AssistantTurnPending,
}

/// Ordered message sequence owned by one loop execution.
///
/// Messages can only be appended. A tool message must answer one of the calls
/// requested by the nearest preceding assistant message, with only other tool
/// messages in between.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    /// System preamble followed by the user's input.
    pub fn seeded(system_prompt: &str, input: &str) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.push(ChatMessage::user(input));
        Self { messages }
    }

    /// Build from a client-supplied message list, validating every tool message.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Result<Self, ConversationError> {
        if messages.is_empty() {
            return Err(ConversationError::Empty);
        }
        let mut conversation = Self {
            messages: Vec::with_capacity(messages.len()),
        };
        for message in messages {
            conversation.push(message)?;
        }
        Ok(conversation)
    }

    pub fn push(&mut self, message: ChatMessage) -> Result<(), ConversationError> {
        if message.role == Role::Tool {
            self.check_tool_result(&message)?;
        }
        self.messages.push(message);
        Ok(())
    }

    fn check_tool_result(&self, message: &ChatMessage) -> Result<(), ConversationError> {
        let id = message
            .tool_call_id
            .as_deref()
            .ok_or(ConversationError::MissingToolCallId)?;

        let orphan = || ConversationError::OrphanToolResult { id: id.to_string() };

        // Walk back over the current block of tool results to its assistant turn.
        let mut answered = Vec::new();
        for prev in self.messages.iter().rev() {
            match prev.role {
                Role::Tool => answered.extend(prev.tool_call_id.as_deref()),
                Role::Assistant => {
                    if !prev.requested_call_ids().any(|requested| requested == id) {
                        return Err(orphan());
                    }
                    if answered.contains(&id) {
                        return Err(ConversationError::DuplicateToolResult { id: id.to_string() });
                    }
                    return Ok(());
                }
                Role::System | Role::User => return Err(orphan()),
            }
        }
        Err(orphan())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True when the backend may be asked for the next assistant turn.
    pub fn awaits_assistant(&self) -> bool {
        self.last().is_some_and(|m| m.role != Role::Assistant)
    }
}
