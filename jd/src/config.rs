//! JobDaemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::pipeline::PipelineSettings;
use crate::retry::RetryLoopConfig;
use crate::writes::WriteQueueConfig;

/// Main JobDaemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where job state, checkpoints and the knowledge store live
    pub storage: StorageConfig,

    /// Job manager settings
    pub jobs: JobsConfig,

    /// Serialized write queue tuning
    #[serde(rename = "write-queue")]
    pub write_queue: WriteQueueSection,

    /// Circuit breaker thresholds, shared by every breaker
    pub breaker: BreakerSection,

    /// Retry-loop detector limits
    #[serde(rename = "retry-loop")]
    pub retry_loop: RetryLoopSection,

    /// Pipeline runner defaults
    pub pipeline: PipelineSection,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .jobdaemon.yml
        let local_config = PathBuf::from(".jobdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/jobdaemon/jobdaemon.yml
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, before logging is set up
    ///
    /// Follows the same chain as [`load`](Self::load) and never fails.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => std::iter::once(PathBuf::from(".jobdaemon.yml"))
                .chain(user_config_path())
                .collect(),
        };
        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| Self::load_from_file(path).ok())
            .and_then(|config| config.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn write_queue_config(&self) -> WriteQueueConfig {
        WriteQueueConfig {
            batch_size: self.write_queue.batch_size.max(1),
            batch_timeout: Duration::from_millis(self.write_queue.batch_timeout_ms),
            max_queue_size: self.write_queue.max_queue_size.max(1),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            failure_rate_threshold: self.breaker.failure_rate_threshold,
            min_requests_for_rate: self.breaker.min_requests_for_rate,
            success_threshold: self.breaker.success_threshold,
            open_timeout: Duration::from_millis(self.breaker.open_timeout_ms),
            rate_window: self.breaker.rate_window,
        }
    }

    pub fn retry_loop_config(&self) -> RetryLoopConfig {
        RetryLoopConfig {
            max_consecutive_retries: self.retry_loop.max_consecutive_retries,
            history_size: self.retry_loop.history_size,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_iterations: self.pipeline.max_iterations,
            max_breaker_waits: self.pipeline.max_breaker_waits,
            max_call_retries: self.pipeline.max_call_retries,
            retry_delay: Duration::from_millis(self.pipeline.retry_delay_ms),
            max_tokens: self.llm.max_tokens,
            outputs_dir: self.storage.outputs_dir(),
            retry_loop: self.retry_loop_config(),
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("jobdaemon").join("jobdaemon.yml"))
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for jobs.json, job logs, checkpoints and outputs
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Knowledge store database; relative paths are under `state-dir`
    #[serde(rename = "knowledge-db")]
    pub knowledge_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/jobdaemon on Linux)
        let state_dir = dirs::data_dir()
            .map(|d| d.join("jobdaemon"))
            .unwrap_or_else(|| PathBuf::from(".jobdaemon"));
        Self {
            state_dir,
            knowledge_db: PathBuf::from("knowledge.db"),
        }
    }
}

impl StorageConfig {
    pub fn knowledge_db_path(&self) -> PathBuf {
        self.state_dir.join(&self.knowledge_db)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.state_dir.join("outputs")
    }
}

/// Job manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// How long shutdown waits for running jobs before aborting them
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl JobsConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Write queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueSection {
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    #[serde(rename = "batch-timeout-ms")]
    pub batch_timeout_ms: u64,

    #[serde(rename = "max-queue-size")]
    pub max_queue_size: usize,

    /// How long `stop` waits for the final flush
    #[serde(rename = "stop-timeout-ms")]
    pub stop_timeout_ms: u64,
}

impl Default for WriteQueueSection {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout_ms: 1_000,
            max_queue_size: 10_000,
            stop_timeout_ms: 30_000,
        }
    }
}

impl WriteQueueSection {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: u32,

    #[serde(rename = "failure-rate-threshold")]
    pub failure_rate_threshold: f64,

    #[serde(rename = "min-requests-for-rate")]
    pub min_requests_for_rate: u32,

    #[serde(rename = "success-threshold")]
    pub success_threshold: u32,

    #[serde(rename = "open-timeout-ms")]
    pub open_timeout_ms: u64,

    #[serde(rename = "rate-window")]
    pub rate_window: usize,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            failure_rate_threshold: defaults.failure_rate_threshold,
            min_requests_for_rate: defaults.min_requests_for_rate,
            success_threshold: defaults.success_threshold,
            open_timeout_ms: defaults.open_timeout.as_millis() as u64,
            rate_window: defaults.rate_window,
        }
    }
}

/// Retry-loop detector limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryLoopSection {
    #[serde(rename = "max-consecutive-retries")]
    pub max_consecutive_retries: u32,

    #[serde(rename = "history-size")]
    pub history_size: usize,
}

impl Default for RetryLoopSection {
    fn default() -> Self {
        Self {
            max_consecutive_retries: 2,
            history_size: 10,
        }
    }
}

/// Pipeline runner defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Iteration cap for jobs that do not set `max_iterations`
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    #[serde(rename = "max-breaker-waits")]
    pub max_breaker_waits: u32,

    #[serde(rename = "max-call-retries")]
    pub max_call_retries: u32,

    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_breaker_waits: 3,
            max_call_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "replay" supported)
    pub provider: String,

    /// Model identifier, used for cost accounting
    pub model: String,

    /// Scripted responses for the replay provider
    #[serde(rename = "replay-file")]
    pub replay_file: Option<PathBuf>,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "replay".to_string(),
            model: "replay".to_string(),
            replay_file: None,
            max_tokens: 16384,
        }
    }
}
