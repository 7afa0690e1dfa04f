//! Model request/response types
//!
//! Provider-agnostic: one system prompt, a list of plain-text messages, and
//! a text reply with token usage for cost tracking.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything needed for one model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        debug!("Message::user: called");
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        debug!("Message::assistant: called");
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Response from a completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        }
    }
}

/// Token usage for cost tracking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Cost in USD for `model`, using per-million-token list prices
    pub fn cost_usd(&self, model: &str) -> f64 {
        debug!(%model, input = self.input_tokens, output = self.output_tokens, "TokenUsage::cost_usd: called");
        let (input_price, output_price) = match model {
            m if m.contains("opus") => (15.0, 75.0),
            m if m.contains("haiku") => (0.25, 1.25),
            m if m.contains("replay") => (0.0, 0.0),
            _ => (3.0, 15.0),
        };
        (self.input_tokens as f64 / 1_000_000.0) * input_price + (self.output_tokens as f64 / 1_000_000.0) * output_price
    }
}
