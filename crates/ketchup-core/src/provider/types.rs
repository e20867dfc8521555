//! Chat types shared between the conversation loop and the inference backend.
//!
//! These mirror the OpenAI chat-completions wire shape closely enough that a
//! `ChatMessage` can be serialized straight into a request body.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Assistant turn that requests tools. The wire form keeps `content` as an
    /// empty string rather than null; some local servers reject null content.
    pub fn assistant_with_tool_calls(content: Option<&str>, calls: &[ToolCallRequest]) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.unwrap_or_default().to_string()),
            tool_calls: Some(calls.iter().map(ToolCallMessage::from).collect()),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, name: &str, result: &str) -> Self {
        Self {
            role: Role::Tool,
            content: Some(result.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn content_as_str(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Tool-call ids requested by this message (empty unless assistant).
    pub fn requested_call_ids(&self) -> impl Iterator<Item = &str> {
        self.tool_calls
            .iter()
            .flatten()
            .map(|tc| tc.id.as_str())
    }
}

/// Accepts `"text"`, `null`, or an array of content parts, flattening the
/// parts' `text` fields. Clients of the pass-through endpoint send either.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(parts)) => Some(
            parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<String>(),
        ),
        Some(other) => Some(other.to_string()),
    })
}

/// A tool call embedded in an assistant message (OpenAI format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".into()
}

/// The function name + raw JSON arguments within a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCallRequest> for ToolCallMessage {
    fn from(req: &ToolCallRequest) -> Self {
        Self {
            id: req.id.clone(),
            call_type: function_type(),
            function: FunctionCall {
                name: req.name.clone(),
                arguments: Value::Object(req.arguments.clone()).to_string(),
            },
        }
    }
}

/// A parsed tool call request (arguments already deserialized).
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// One assistant turn as returned by the backend.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Usage,
}

impl LlmResponse {
    /// Assistant message to append to the transcript for this turn.
    pub fn to_message(&self) -> ChatMessage {
        if self.tool_calls.is_empty() {
            ChatMessage::assistant(self.content.as_deref().unwrap_or_default())
        } else {
            ChatMessage::assistant_with_tool_calls(self.content.as_deref(), &self.tool_calls)
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Incremental event from a streaming completion.
///
/// A stream yields any number of `Delta`s and ends with exactly one
/// `Completed`, which carries the fully assembled tool calls (if any).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Completed {
        content: String,
        tool_calls: Vec<ToolCallRequest>,
        finish_reason: String,
    },
}

/// Tool definition in OpenAI function-calling format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub def_type: String,
    pub function: ToolFunctionDef,
}

/// Function metadata within a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_constructors() {
        let sys = ChatMessage::system("You are helpful.");
        assert_eq!(sys.role, Role::System);
        assert_eq!(sys.content_as_str().unwrap(), "You are helpful.");

        let user = ChatMessage::user("Hello");
        assert_eq!(user.role, Role::User);

        let asst = ChatMessage::assistant("Hi there!");
        assert_eq!(asst.role, Role::Assistant);
    }

    #[test]
    fn test_tool_result_message() {
        let msg = ChatMessage::tool_result("call_123", "search_places", "{\"places\":[]}");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_123"));
        assert_eq!(msg.name.as_deref(), Some("search_places"));
    }

    #[test]
    fn test_assistant_tool_calls_serialize_openai_shape() {
        let mut args = Map::new();
        args.insert("query".into(), json!("coffee"));
        let req = ToolCallRequest {
            id: "call_1".into(),
            name: "search_places".into(),
            arguments: args,
        };
        let msg = ChatMessage::assistant_with_tool_calls(None, &[req]);
        let wire = serde_json::to_value(&msg).unwrap();

        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["content"], "");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "search_places");
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            "{\"query\":\"coffee\"}"
        );
        assert!(wire.get("tool_call_id").is_none());
    }

    #[test]
    fn test_content_parts_are_flattened() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "world"}]
        }))
        .unwrap();
        assert_eq!(msg.content.as_deref(), Some("hello world"));

        let msg: ChatMessage =
            serde_json::from_value(json!({"role": "assistant", "content": null})).unwrap();
        assert!(msg.content.is_none());

        let msg: ChatMessage = serde_json::from_value(json!({"role": "user"})).unwrap();
        assert!(msg.content.is_none());
    }
}
