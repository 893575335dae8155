use serde::{Deserialize, Serialize};

/// Message role in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// A complete request handed to an AI client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Ask the backend for a JSON object reply.
    pub return_json: bool,
}

impl ChatRequest {
    pub fn from_message(message: &str) -> Self {
        Self { messages: vec![ChatMessage::user(message)], return_json: false }
    }

    /// An empty system prompt is left out.
    pub fn with_system(system_prompt: &str, message: &str, return_json: bool) -> Self {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.push(ChatMessage::user(message));
        Self { messages, return_json }
    }

    pub fn from_history(messages: &[ChatMessage]) -> Self {
        Self { messages: messages.to_vec(), return_json: false }
    }
}
