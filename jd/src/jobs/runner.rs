//! The seam between the job manager and the work a job does

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{CancelContext, JobLog};

/// Everything a worker gets from the manager
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    /// Checkpoint key
    pub run_id: String,
    /// The job's config, unchanged
    pub config: Value,
    pub cancel: CancelContext,
    pub log: Arc<JobLog>,
}

/// How a worker finished when it did not error
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Normal completion
    Completed(Value),
    /// Cancellation was observed
    Cancelled(Value),
    /// The retry-loop detector stopped the loop; recorded as completed
    Aborted { reason: String, summary: Value },
}

impl JobOutcome {
    /// Result summary with the abort marker folded in
    pub fn aborted_summary(reason: &str, summary: Value) -> Value {
        let mut summary = match summary {
            Value::Object(map) => Value::Object(map),
            Value::Null => json!({}),
            other => json!({ "detail": other }),
        };
        if let Some(map) = summary.as_object_mut() {
            map.insert("outcome".to_string(), json!("retry_loop_aborted"));
            map.insert("abort_reason".to_string(), json!(reason));
        }
        summary
    }
}

/// Work executed for each started job
///
/// Errors and panics are both turned into a `failed` job by the manager.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> eyre::Result<JobOutcome>;
}
