//! Crash-safe file persistence
//!
//! Every durable file this crate owns (job state, checkpoints, pipeline
//! outputs) is written with [`atomic_write`]: the bytes go to a temp file in
//! the destination directory, are synced, then renamed over the target. A
//! reader always sees either the previous complete file or the new one.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Persistence failure, returned as a value so callers can log and continue
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `bytes` to `path` via temp file + rename in the same directory
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    debug!(path = %path.display(), len = bytes.len(), "atomic_write: called");
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| PersistError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PersistError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| PersistError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| PersistError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    debug!(path = %path.display(), "atomic_write_json: called");
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Serialize {
        path: path.to_path_buf(),
        source: e,
    })?;
    atomic_write(path, &bytes)
}

/// Map an arbitrary id onto a single safe path component
///
/// Ids made only of alphanumerics, `-` and `_` are used as-is. Anything else
/// is sanitized and suffixed with `.` plus a digest of the original id; safe
/// ids never contain `.`, so distinct ids never share a stem.
pub fn file_stem(id: &str) -> String {
    let safe = |c: char| c.is_alphanumeric() || c == '-' || c == '_';
    if !id.is_empty() && id.chars().all(safe) {
        return id.to_string();
    }
    let sanitized: String = id.chars().map(|c| if safe(c) { c } else { '_' }).collect();
    let digest = hex::encode(&Sha256::digest(id.as_bytes())[..8]);
    if sanitized.is_empty() {
        format!("_.{}", digest)
    } else {
        format!("{}.{}", sanitized, digest)
    }
}
