//! Job domain type
//!
//! A Job is one tracked unit of background work. Its status only moves along
//! the edges of the lifecycle state machine:
//!
//! ```text
//! queued  -> running | cancelled
//! running -> completed | failed | cancelled
//! ```
//!
//! Terminal jobs are frozen except for `annotations`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::id::generate_id;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, waiting for `start`
    #[default]
    Queued,
    /// Worker is executing
    Running,
    /// Worker finished normally
    Completed,
    /// Worker raised an error or panicked
    Failed,
    /// Cancellation was observed
    Cancelled,
}

impl JobStatus {
    /// Check if this status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Check whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    pub fn all() -> [JobStatus; 5] {
        [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!(
                "unknown job status '{}' (expected queued, running, completed, failed, cancelled)",
                other
            )),
        }
    }
}

/// Why an update was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {id} is {status} and can no longer change")]
    Terminal { id: String, status: JobStatus },

    #[error("job {id} cannot move from {from} to {to}")]
    Invalid { id: String, from: JobStatus, to: JobStatus },

    #[error("job {id}: {field} can only be set when the job ends {allowed}")]
    FieldNotAllowed {
        id: String,
        field: &'static str,
        allowed: &'static str,
    },
}

/// A field-level change request applied through the manager's update path
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub result_summary: Option<Value>,
    pub error: Option<String>,
    pub cancel_requested: Option<bool>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn completed(summary: Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result_summary: Some(summary),
            ..Default::default()
        }
    }

    pub fn cancelled(summary: Value) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            result_summary: Some(summary),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn cancel_requested() -> Self {
        Self {
            cancel_requested: Some(true),
            ..Default::default()
        }
    }
}

/// One tracked unit of orchestrated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: String,

    /// Current status
    pub status: JobStatus,

    /// Caller-owned configuration, passed to the worker unchanged
    pub config: Value,

    /// Checkpoint key; defaults to the job id
    pub run_id: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-job append-only text log
    pub logs_path: PathBuf,

    /// Structured result, set on completed/cancelled
    #[serde(default)]
    pub result_summary: Option<Value>,

    /// Failure detail, set on failed
    #[serde(default)]
    pub error: Option<String>,

    /// Cooperative cancellation flag (false -> true only)
    #[serde(default)]
    pub cancel_requested: bool,

    /// Post-hoc annotations, writable after the job ends
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
}

impl Job {
    /// Create a queued job; `logs_dir` is where its log file will live
    pub fn new(config: Value, logs_dir: &std::path::Path) -> Self {
        let name = config.get("name").and_then(Value::as_str).unwrap_or_default();
        Self::with_id(generate_id("job", name), config, logs_dir)
    }

    /// Create with a specific ID (for testing or recovery)
    pub fn with_id(id: impl Into<String>, config: Value, logs_dir: &std::path::Path) -> Self {
        let id = id.into();
        debug!(%id, "Job::with_id: called");
        let now = Utc::now();
        let run_id = config
            .get("run_id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| id.clone());
        Self {
            logs_path: logs_dir.join(format!("{}.log", id)),
            id,
            status: JobStatus::Queued,
            config,
            run_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result_summary: None,
            error: None,
            cancel_requested: false,
            annotations: BTreeMap::new(),
        }
    }

    /// Display name from config, falling back to the id
    pub fn name(&self) -> &str {
        self.config.get("name").and_then(Value::as_str).unwrap_or(&self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply an update, enforcing the lifecycle rules
    ///
    /// Either the whole update is applied or nothing changes.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), TransitionError> {
        debug!(id = %self.id, status = %self.status, ?update, "Job::apply: called");
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }

        let next = update.status.unwrap_or(self.status);
        if next != self.status && !self.status.can_transition_to(next) {
            return Err(TransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        if update.result_summary.is_some() && !matches!(next, JobStatus::Completed | JobStatus::Cancelled) {
            return Err(TransitionError::FieldNotAllowed {
                id: self.id.clone(),
                field: "result_summary",
                allowed: "completed or cancelled",
            });
        }
        if update.error.is_some() && next != JobStatus::Failed {
            return Err(TransitionError::FieldNotAllowed {
                id: self.id.clone(),
                field: "error",
                allowed: "failed",
            });
        }

        let now = Utc::now();
        if next != self.status {
            debug!(id = %self.id, from = %self.status, to = %next, "Job::apply: status transition");
            if next == JobStatus::Running {
                self.started_at = Some(now);
            }
            if next.is_terminal() {
                self.finished_at = Some(now);
            }
            self.status = next;
        }
        if let Some(summary) = update.result_summary {
            self.result_summary = Some(summary);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if update.cancel_requested == Some(true) {
            self.cancel_requested = true;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Record a post-hoc annotation; allowed in any status
    pub fn annotate(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!(id = %self.id, %key, "Job::annotate: called");
        self.annotations.insert(key, value);
        self.updated_at = Utc::now();
    }
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Only jobs whose name or id contains this text
    pub text: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            text: None,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status
            && job.status != status
        {
            return false;
        }
        if let Some(ref text) = self.text
            && !job.id.contains(text.as_str())
            && !job.name().contains(text.as_str())
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::path::Path;

    fn job() -> Job {
        Job::with_id("j1", json!({"name": "demo"}), Path::new("/tmp/logs"))
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(json!({"name": "Market Survey"}), Path::new("/tmp/logs"));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.run_id, job.id);
        assert!(job.id.ends_with("-job-market-survey"));
        assert_eq!(job.logs_path, Path::new("/tmp/logs").join(format!("{}.log", job.id)));
        assert!(!job.cancel_requested);
    }

    #[test]
    fn test_run_id_from_config() {
        let job = Job::with_id("j2", json!({"run_id": "r-old"}), Path::new("/tmp"));
        assert_eq!(job.run_id, "r-old");
    }

    #[test]
    fn test_happy_path_sets_timestamps() {
        let mut job = job();
        job.apply(JobUpdate::status(JobStatus::Running)).unwrap();
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_none());

        job.apply(JobUpdate::completed(json!({"iterations": 3}))).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert_eq!(job.result_summary, Some(json!({"iterations": 3})));
    }

    #[test]
    fn test_terminal_job_is_frozen() {
        let mut job = job();
        job.apply(JobUpdate::status(JobStatus::Running)).unwrap();
        job.apply(JobUpdate::failed("boom")).unwrap();

        let before = job.clone();
        let err = job.apply(JobUpdate::status(JobStatus::Running)).unwrap_err();
        assert!(matches!(err, TransitionError::Terminal { .. }));
        assert!(job.apply(JobUpdate::cancel_requested()).is_err());
        assert_eq!(job, before);

        job.annotate("quality", json!({"score": 0.4}));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.annotations["quality"]["score"], 0.4);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut job = job();
        let err = job.apply(JobUpdate::completed(json!({}))).unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Invalid {
                from: JobStatus::Queued,
                to: JobStatus::Completed,
                ..
            }
        ));
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_fields_tied_to_status() {
        let mut job = job();
        job.apply(JobUpdate::status(JobStatus::Running)).unwrap();

        let err = job
            .apply(JobUpdate {
                error: Some("nope".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::FieldNotAllowed { field: "error", .. }));

        let err = job
            .apply(JobUpdate {
                status: Some(JobStatus::Failed),
                result_summary: Some(json!({})),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::FieldNotAllowed { field: "result_summary", .. }));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn test_cancel_flag_is_monotonic() {
        let mut job = job();
        job.apply(JobUpdate::cancel_requested()).unwrap();
        job.apply(JobUpdate {
            cancel_requested: Some(false),
            ..Default::default()
        })
        .unwrap();
        assert!(job.cancel_requested);
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in JobStatus::all() {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_filter() {
        let mut running = job();
        running.apply(JobUpdate::status(JobStatus::Running)).unwrap();

        assert!(JobFilter::status(JobStatus::Running).matches(&running));
        assert!(!JobFilter::status(JobStatus::Queued).matches(&running));
        assert!(
            JobFilter {
                status: None,
                text: Some("dem".to_string())
            }
            .matches(&running)
        );
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::all().to_vec())
    }

    proptest! {
        #[test]
        fn prop_status_only_follows_lifecycle_edges(requests in prop::collection::vec(status_strategy(), 0..20)) {
            let mut job = job();
            for requested in requests {
                let before = job.status;
                let was_terminal = before.is_terminal();
                let result = job.apply(JobUpdate::status(requested));

                if was_terminal {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(job.status, before);
                } else if job.status != before {
                    prop_assert!(before.can_transition_to(job.status));
                }
            }
        }
    }
}
