//! Replay provider: scripted responses read from a JSONL file
//!
//! Each line is either a response or a failure:
//!
//! ```text
//! {"content": "{\"status\": \"fail\", ...}", "usage": {"input_tokens": 900, "output_tokens": 120}}
//! {"error": {"status": 503, "message": "overloaded"}}
//! {"error": {"status": 429, "message": "slow down", "retry_after_ms": 2000}}
//! ```
//!
//! Used for offline runs and end-to-end tests; responses are served in file
//! order and the client errors once the script is exhausted.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError};

/// A scripted failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFailure {
    pub status: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

/// One scripted reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplayEntry {
    Failure { error: ReplayFailure },
    Response(CompletionResponse),
}

pub struct ReplayClient {
    name: String,
    model: String,
    entries: Vec<ReplayEntry>,
    cursor: AtomicUsize,
}

impl ReplayClient {
    /// Load a script from a JSONL file; blank lines and `#` comments are skipped
    pub fn from_file(path: impl AsRef<Path>, model: impl Into<String>) -> Result<Self, LlmError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "ReplayClient::from_file: called");
        let content = std::fs::read_to_string(path).map_err(|e| LlmError::Script {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(line).map_err(|e| LlmError::Script {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", lineno + 1, e),
            })?;
            entries.push(entry);
        }
        Ok(Self::new(entries, model))
    }

    pub fn new(entries: Vec<ReplayEntry>, model: impl Into<String>) -> Self {
        debug!(entry_count = entries.len(), "ReplayClient::new: called");
        Self {
            name: "llm:replay".to_string(),
            model: model.into(),
            entries,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Responses served so far
    pub fn served(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ReplayClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        debug!(%idx, messages = request.messages.len(), "ReplayClient::complete: called");
        match self.entries.get(idx) {
            Some(ReplayEntry::Response(resp)) => Ok(resp.clone()),
            Some(ReplayEntry::Failure { error }) => {
                // Throttling without an explicit hint still backs off
                let default_ms = (error.status == 429).then_some(1000);
                Err(LlmError::Status {
                    status: error.status,
                    message: error.message.clone(),
                    retry_after: error.retry_after_ms.or(default_ms).map(Duration::from_millis),
                })
            }
            None => Err(LlmError::Exhausted(self.entries.len())),
        }
    }
}
