//! Model client errors

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// The provider answered with a failure status
    #[error("provider returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Provider-suggested back-off, if it sent one
        retry_after: Option<Duration>,
    },

    /// A scripted client was asked for more replies than it holds
    #[error("script exhausted after {0} responses")]
    Exhausted(usize),

    #[error("bad replay script {path}: {reason}")]
    Script { path: PathBuf, reason: String },

    #[error("LLM config: {0}")]
    Config(String),
}

impl LlmError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        LlmError::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Throttling (429) and server-side (5xx) failures are worth another try
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Status { status, .. } if *status == 429 || *status >= 500)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
