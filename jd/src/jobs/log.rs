//! Per-job text log
//!
//! One append-only file per job, one line per record:
//! `<rfc3339> <LEVEL> <message>`. Writes are best-effort; a failed write is
//! reported to the process trace log and otherwise ignored.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use tracing::{Level, debug, warn};

pub struct JobLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        debug!(path = %path.display(), "JobLog::new: called");
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write(Level::INFO, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.write(Level::WARN, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(Level::ERROR, message.as_ref());
    }

    /// Append one record
    pub fn write(&self, level: Level, message: &str) {
        let mut guard = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            match open_append(&self.path) {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to open job log");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{} {} {}\n",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                level,
                message.replace('\n', " ")
            );
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                warn!(path = %self.path.display(), error = %e, "Failed to write job log");
            }
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Last `lines` records of a job log; empty if the file is missing
pub fn tail(path: &Path, lines: usize) -> Vec<String> {
    debug!(path = %path.display(), %lines, "tail: called");
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };
    let all: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
    let skip = all.len().saturating_sub(lines);
    all.into_iter().skip(skip).collect()
}
