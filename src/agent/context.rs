//! Backend request construction.
//!
//! The backend sees a plain role-tagged transcript: bus metadata such as
//! message ids and `context_ids` never leaves the crate. Turns from other
//! participants are presented as `user` turns prefixed with the speaker's
//! id, so the backend can tell who said what in a group conversation.

use crate::providers::{ChatMessage, ChatRequest, ToolDefinition};
use crate::session::{Conversation, Message, Role};

/// Builds [`ChatRequest`]s for one agent.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    speaker_id: String,
    system_prompt: String,
}

impl ContextBuilder {
    pub fn new(speaker_id: &str) -> Self {
        Self {
            speaker_id: speaker_id.to_string(),
            system_prompt: String::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// Transcript for `state`, system prompt first.
    pub fn build_messages(&self, state: &Conversation) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(state.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::new(Role::System, self.system_prompt.as_str()));
        }
        messages.extend(state.messages().iter().map(|m| self.to_chat(m)));
        messages
    }

    pub fn build_request(&self, state: &Conversation, tools: Vec<ToolDefinition>) -> ChatRequest {
        ChatRequest {
            messages: self.build_messages(state),
            tools,
        }
    }

    fn to_chat(&self, message: &Message) -> ChatMessage {
        match message.role {
            Role::System | Role::Tool => ChatMessage::new(message.role, message.content.as_str()),
            _ if message.speaker_id == self.speaker_id => ChatMessage {
                role: message.role,
                content: message.content.clone(),
                tool_calls: message.tool_calls.clone(),
            },
            _ => ChatMessage::new(
                Role::User,
                format!("{}: {}", message.speaker_id, message.content),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolCall;
    use serde_json::json;

    #[test]
    fn test_system_prompt_first() {
        let builder = ContextBuilder::new("a").with_system_prompt("Be brief.");
        let mut state = Conversation::new();
        state.push(Message::user("bob", "hi"));

        let messages = builder.build_messages(&state);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "Be brief.");
    }

    #[test]
    fn test_empty_prompt_omitted() {
        let builder = ContextBuilder::new("a");
        assert!(builder.build_messages(&Conversation::new()).is_empty());
    }

    #[test]
    fn test_other_speakers_become_user_turns() {
        let builder = ContextBuilder::new("a");
        let mut state = Conversation::new();
        state.push(Message::user("bob", "hi"));
        state.push(Message::assistant("carol", "hello bob"));
        let mut own = Message::assistant("a", "hey");
        own.context_ids = vec!["x".into()];
        state.push(own);

        let messages = builder.build_messages(&state);
        assert_eq!(messages[0], ChatMessage::new(Role::User, "bob: hi"));
        assert_eq!(messages[1], ChatMessage::new(Role::User, "carol: hello bob"));
        assert_eq!(messages[2], ChatMessage::new(Role::Assistant, "hey"));
        let wire = serde_json::to_value(&messages[2]).unwrap();
        assert!(wire.get("context_ids").is_none());
        assert!(wire.get("id").is_none());
    }

    #[test]
    fn test_tool_records_kept() {
        let builder = ContextBuilder::new("a");
        let mut state = Conversation::new();
        state.push(Message::tool_invocation(
            "a",
            ToolCall::new("c1", "search", json!({"query": "q"})),
        ));
        state.push(Message::tool_result("a", "[]"));

        let request = builder.build_request(&state, Vec::new());
        assert_eq!(request.messages[0].role, Role::Assistant);
        assert_eq!(request.messages[0].tool_calls.as_ref().unwrap()[0].name, "search");
        assert_eq!(request.messages[1], ChatMessage::new(Role::Tool, "[]"));
    }
}
