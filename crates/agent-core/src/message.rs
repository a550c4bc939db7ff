//! Conversation Messages
//!
//! Standard message format used across the agent system.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content
    pub content: String,

    /// Creation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool result message
    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        let msg = Self::new(Role::Tool, content);
        match tool_call_id {
            Some(id) => msg.with_metadata("tool_call_id", serde_json::Value::String(id)),
            None => msg,
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The `{"role", "content"}` shape expected by chat-completion APIs
    pub fn to_chat_format(&self) -> serde_json::Value {
        serde_json::json!({
            "role": self.role,
            "content": self.content,
        })
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        // ~4 characters per token is a rough estimate
        (self.content.len() / 4) as u32 + 4 // +4 for role overhead
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.role, self.content)
    }
}

/// Conversation history owned by a single agent
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,

    /// Maximum number of messages kept (system messages are never dropped)
    #[serde(default = "default_max_messages")]
    max_messages: usize,
}

fn default_max_messages() -> usize {
    1000
}

impl Default for Conversation {
    fn default() -> Self {
        Self::with_limit(default_max_messages())
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(1),
        }
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.push(Message::system(prompt));
        conv
    }

    /// Add a message, dropping the oldest non-system message past the limit
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        while self.messages.len() > self.max_messages {
            match self.messages.iter().position(|m| m.role != Role::System) {
                Some(pos) => {
                    self.messages.remove(pos);
                }
                None => break,
            }
        }
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Clear all messages except system prompt
    pub fn clear_history(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    /// Remove every message
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Estimate total tokens in conversation
    pub fn estimate_tokens(&self) -> u32 {
        self.messages.iter().map(|m| m.estimate_tokens()).sum()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_message_roundtrip_keeps_fields() {
        let msg = Message::assistant("42").with_metadata("source", serde_json::json!("calc"));
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert_eq!(back.role, msg.role);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.timestamp, msg.timestamp);
        assert_eq!(back.metadata["source"], "calc");
    }

    #[test]
    fn test_chat_format_and_display() {
        let msg = Message::system("be brief");
        assert_eq!(
            msg.to_chat_format(),
            serde_json::json!({"role": "system", "content": "be brief"})
        );
        assert_eq!(msg.to_string(), "[system] be brief");
    }

    #[test]
    fn test_tool_message_records_call_id() {
        let msg = Message::tool("4", Some("call-1".into()));
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.metadata["tool_call_id"], "call-1");
    }

    #[test]
    fn test_conversation() {
        let mut conv = Conversation::with_system_prompt("You are helpful.");
        conv.push(Message::user("Hi"));
        conv.push(Message::assistant("Hello!"));

        assert_eq!(conv.len(), 3);
        assert!(conv.last().unwrap().role == Role::Assistant);

        conv.clear_history();
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_conversation_limit_keeps_system_prompt() {
        let mut conv = Conversation::with_limit(3);
        conv.push(Message::system("rules"));
        for i in 0..5 {
            conv.push(Message::user(format!("msg {i}")));
        }

        assert_eq!(conv.len(), 3);
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.messages()[1].content, "msg 3");
        assert_eq!(conv.messages()[2].content, "msg 4");
    }
}
