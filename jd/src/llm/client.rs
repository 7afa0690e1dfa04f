//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError};

/// Stateless model client; each call is independent
///
/// Job workers never call a client directly. They go through the circuit
/// breaker registered for the client's [`name`](LlmClient::name).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Call-site name used to pick a circuit breaker (e.g. "llm:replay")
    fn name(&self) -> &str;

    /// Model identifier, used for cost accounting
    fn model(&self) -> &str;

    /// Send a single completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
