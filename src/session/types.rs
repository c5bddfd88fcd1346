//! Conversation data model: messages, tool calls and lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::TachikomaError;

/// Role of a conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
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

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = TachikomaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(TachikomaError::Codec(format!("unknown role '{}'", other))),
        }
    }
}

/// A tool invocation requested by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend-assigned call id (synthesised when the backend has none)
    pub id: String,
    /// Registered tool name
    pub name: String,
    /// Arguments object, passed to the tool unchanged
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }
}

/// The atomic unit of conversation.
///
/// `context_ids` is set once, when a reply is stamped for publishing, and
/// is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub speaker_id: String,
    pub role: Role,
    pub content: String,
    /// Causal snapshot, most-recent-first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_ids: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Present on tool-invocation records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    /// Create a message with a fresh id and the current time.
    pub fn new(speaker_id: &str, role: Role, content: &str) -> Self {
        Self {
            id: generate_id(speaker_id),
            speaker_id: speaker_id.to_string(),
            role,
            content: content.to_string(),
            context_ids: Vec::new(),
            timestamp: Utc::now(),
            tool_calls: None,
        }
    }

    pub fn user(speaker_id: &str, content: &str) -> Self {
        Self::new(speaker_id, Role::User, content)
    }

    pub fn assistant(speaker_id: &str, content: &str) -> Self {
        Self::new(speaker_id, Role::Assistant, content)
    }

    /// Tool-invocation record kept in the conversation ahead of its result.
    pub fn tool_invocation(speaker_id: &str, call: ToolCall) -> Self {
        let mut msg = Self::new(speaker_id, Role::Assistant, "");
        msg.tool_calls = Some(vec![call]);
        msg
    }

    /// `role=tool` message carrying a JSON-serialised result.
    pub fn tool_result(speaker_id: &str, content: &str) -> Self {
        Self::new(speaker_id, Role::Tool, content)
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// Generate a message id from speaker identity, timestamp and a random suffix.
///
/// Format: `{speaker}-{unix_millis}-{9 random alphanumerics}`.
pub fn generate_id(speaker_id: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(9).collect();
    format!("{}-{}-{}", speaker_id, Utc::now().timestamp_millis(), suffix)
}

/// Join/leave announcement action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Join,
    Leave,
}

/// Lifecycle announcement published on the system branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub speaker_id: String,
    pub action: Action,
    #[serde(default)]
    pub role: Role,
    /// Channel the participant is joining or leaving
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl SystemEvent {
    pub fn new(speaker_id: &str, action: Action, role: Role, channel: &str) -> Self {
        let content = match action {
            Action::Join => format!("\"{}\" joined the chat.", speaker_id),
            Action::Leave => format!("\"{}\" left the chat.", speaker_id),
        };
        Self {
            id: Some(generate_id(speaker_id)),
            speaker_id: speaker_id.to_string(),
            action,
            role,
            topic: channel.to_string(),
            model_name: None,
            system_prompt: None,
            content: Some(content),
        }
    }

    pub fn with_model(mut self, model_name: &str, system_prompt: &str) -> Self {
        self.model_name = Some(model_name.to_string());
        self.system_prompt = Some(system_prompt.to_string());
        self
    }
}

/// One agent's in-memory conversation log.
///
/// Append-only; the only truncation happens when a log is loaded from
/// history on restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from loaded history, keeping only the `limit` most recent messages.
    pub fn from_history(mut messages: Vec<Message>, limit: usize) -> Self {
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("agent-a");
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 9);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], "agent-a");
        assert_ne!(generate_id("agent-a"), generate_id("agent-a"));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!("tool".parse::<Role>().unwrap(), Role::Tool);
        assert!("self".parse::<Role>().is_err());
    }

    #[test]
    fn test_tool_invocation_record() {
        let msg = Message::tool_invocation("a", ToolCall::new("c1", "search", json!({"query": "rust"})));
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.has_tool_calls());
        assert!(!Message::assistant("a", "hi").has_tool_calls());
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::user("bob", "hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "user");
        assert!(value["timestamp"].is_i64());
        assert!(value.get("context_ids").is_none());
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn test_conversation_from_history_truncates_oldest() {
        let messages: Vec<Message> = (0..5).map(|i| Message::user("u", &i.to_string())).collect();
        let conv = Conversation::from_history(messages, 3);
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.messages()[0].content, "2");
        assert_eq!(conv.last().unwrap().content, "4");
    }

    #[test]
    fn test_system_event_with_model() {
        let event = SystemEvent::new("a", Action::Join, Role::Assistant, "lobby").with_model("m", "be nice");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "join");
        assert_eq!(value["model_name"], "m");
        assert_eq!(value["topic"], "lobby");
    }
}
