//! Checkpoint / resume
//!
//! One JSON file per run id under the checkpoint directory, replaced
//! atomically after every completed iteration. A missing or unreadable file
//! means "no prior progress".

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::persist::{PersistError, atomic_write_json, file_stem};
use crate::retry::RetryLoopState;

/// Crash-recovery snapshot for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Last fully completed iteration
    pub iteration_index: u32,
    /// Side effects already applied; never repeated on resume
    #[serde(default)]
    pub files_written: BTreeSet<String>,
    #[serde(default)]
    pub cost_accumulated: f64,
    #[serde(default)]
    pub last_status: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_state: Option<RetryLoopState>,
    #[serde(default)]
    pub notes: Value,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, iteration_index: u32) -> Self {
        Self {
            run_id: run_id.into(),
            iteration_index,
            files_written: BTreeSet::new(),
            cost_accumulated: 0.0,
            last_status: String::new(),
            saved_at: Utc::now(),
            retry_state: None,
            notes: Value::Null,
        }
    }

    /// Iteration a resumed worker should run next
    pub fn next_iteration(&self) -> u32 {
        self.iteration_index + 1
    }
}

/// Directory of checkpoint files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "CheckpointStore::new: called");
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(run_id)))
    }

    /// Atomically replace the checkpoint for `checkpoint.run_id`
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistError> {
        debug!(run_id = %checkpoint.run_id, iteration = checkpoint.iteration_index, "CheckpointStore::save: called");
        let mut stamped = checkpoint.clone();
        stamped.saved_at = Utc::now();
        atomic_write_json(&self.path_for(&checkpoint.run_id), &stamped)
    }

    /// Load the checkpoint for `run_id`, if a readable one exists
    pub fn load(&self, run_id: &str) -> Option<Checkpoint> {
        debug!(%run_id, "CheckpointStore::load: called");
        let path = self.path_for(run_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%run_id, "CheckpointStore::load: no checkpoint");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read checkpoint, ignoring");
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) if checkpoint.run_id == run_id => Some(checkpoint),
            Ok(checkpoint) => {
                warn!(path = %path.display(), %run_id, found = %checkpoint.run_id, "Checkpoint belongs to another run, ignoring");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt checkpoint, ignoring");
                None
            }
        }
    }

    /// All readable checkpoints, newest first
    pub fn list(&self) -> Vec<Checkpoint> {
        debug!(dir = %self.dir.display(), "CheckpointStore::list: called");
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<Checkpoint> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let content = std::fs::read_to_string(&path).ok()?;
                serde_json::from_str::<Checkpoint>(&content).ok()
            })
            .collect();
        out.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        out
    }
}
