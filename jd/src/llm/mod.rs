//! LLM client module for JobDaemon
//!
//! The model transport itself lives outside this crate. What lives here is
//! the client seam the pipeline calls through, plus the offline replay
//! provider.

use std::sync::Arc;

use tracing::debug;

pub mod client;
mod error;
mod replay;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use replay::{ReplayClient, ReplayEntry, ReplayFailure};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, TokenUsage};

use crate::config::LlmConfig;

/// Create an LLM client based on the provider specified in config
///
/// Supports the "replay" provider.
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(provider = %config.provider, model = %config.model, "create_client: called");
    match config.provider.as_str() {
        "replay" => {
            let path = config.replay_file.as_ref().ok_or_else(|| {
                LlmError::Config("llm.replay-file must be set for the replay provider".to_string())
            })?;
            debug!(path = %path.display(), "create_client: creating replay client");
            Ok(Arc::new(ReplayClient::from_file(path, config.model.clone())?))
        }
        other => {
            debug!(provider = %other, "create_client: unknown provider");
            Err(LlmError::Config(format!(
                "Unknown LLM provider: '{}'. Supported: replay",
                other
            )))
        }
    }
}
