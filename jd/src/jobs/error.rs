//! Job manager errors

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{JobStatus, TransitionError};
use crate::persist::PersistError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("'{reference}' matches several jobs: {}", candidates.join(", "))]
    Ambiguous { reference: String, candidates: Vec<String> },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Job {id} is {status}; only finished jobs can be resumed")]
    NotResumable { id: String, status: JobStatus },

    #[error("Another jobdaemon process holds {0}")]
    AlreadyLocked(PathBuf),

    #[error("Corrupt job state file {path}: {reason}")]
    StateFile { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Persist(#[from] PersistError),
}
