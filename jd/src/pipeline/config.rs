//! Pipeline runner settings and per-job configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryLoopConfig;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are one stage of a multi-agent research pipeline. \
Work on the task, then reply with a single JSON object: \
{\"status\": \"pass\" | \"fail\", \"feedback\": <what still needs fixing>, \
\"entities\": [{\"id\", \"kind\", \"name\", \"properties\"}], \
\"relationships\": [{\"source\", \"target\", \"kind\", \"properties\"}], \
\"files\": [{\"path\", \"content\"}], \"summary\": <short text>}. \
Use status \"pass\" only when the work is complete.";

/// Process-wide runner settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Iteration cap when a job does not set one
    pub max_iterations: u32,
    /// Cool-downs a job will wait out on an open breaker before failing
    pub max_breaker_waits: u32,
    /// Retries of a retryable model error within one iteration
    pub max_call_retries: u32,
    /// Pause before retrying a retryable model error without its own hint
    pub retry_delay: Duration,
    pub max_tokens: u32,
    /// Parent of each run's default output directory
    pub outputs_dir: PathBuf,
    pub retry_loop: RetryLoopConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_breaker_waits: 3,
            max_call_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_tokens: 16384,
            outputs_dir: PathBuf::from("outputs"),
            retry_loop: RetryLoopConfig::default(),
        }
    }
}

/// The job config a pipeline job is submitted with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineJobConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// What the agents should produce
    pub task: String,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub max_iterations: Option<u32>,

    /// Where report files are written; defaults to `<outputs>/<run_id>`
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Per-job replay script, overriding the shared client
    #[serde(default)]
    pub replay_file: Option<PathBuf>,
}
