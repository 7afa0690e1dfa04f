//! JobDaemon - reliability plane for long-running multi-agent jobs
//!
//! A research pipeline calls an external model service over and over,
//! writes files and records what it learns in a shared knowledge store.
//! JobDaemon keeps such jobs honest when the model misbehaves, the process
//! dies or two jobs write at once.
//!
//! # Modules
//!
//! - [`jobs`] - Job manager: lifecycle, durable state, cancellation, recovery
//! - [`writes`] - Serialized write queue in front of the knowledge store
//! - [`breaker`] - Circuit breakers around external calls
//! - [`checkpoint`] - Per-run checkpoints for resume after a crash
//! - [`retry`] - Detection of agents stuck repeating the same feedback
//! - [`pipeline`] - The job runner that ties the above together
//! - [`llm`] - Model client seam and the offline replay provider
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod breaker;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod domain;
pub mod jobs;
pub mod llm;
pub mod persist;
pub mod pipeline;
pub mod retry;
pub mod writes;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{Config, LlmConfig};
pub use domain::{IdResolver, Job, JobFilter, JobStatus, JobUpdate, TransitionError, generate_id};
pub use jobs::{CancelContext, CancelReason, JobContext, JobError, JobLog, JobManager, JobOutcome, JobRunner, RecoveryStats};
pub use llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, ReplayClient, create_client};
pub use persist::{PersistError, atomic_write, atomic_write_json};
pub use pipeline::{PipelineJobConfig, PipelineRunner, PipelineSettings, StepReport};
pub use retry::{RetryLoopConfig, RetryLoopDetector, RetryLoopState, RetryVerdict, fingerprint, is_pass_status};
pub use writes::{WriteError, WriteOp, WriteOperation, WriteQueue, WriteQueueConfig, WriteQueueStats};
