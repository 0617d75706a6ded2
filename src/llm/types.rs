use serde::{Deserialize, Serialize};

use super::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Overrides the chain's primary provider for this call.
    pub provider: Option<Provider>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            max_tokens: None,
            provider: None,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// System prompt, if any. Providers that take it out-of-band use this.
    pub fn system(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    /// Providers report input and output in separate frames; later non-zero
    /// counts win.
    pub fn merge(self, other: Usage) -> Usage {
        Usage {
            input_tokens: if other.input_tokens > 0 {
                other.input_tokens
            } else {
                self.input_tokens
            },
            output_tokens: if other.output_tokens > 0 {
                other.output_tokens
            } else {
                self.output_tokens
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
    pub provider: Provider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Content(String),
    Usage(Usage),
}
