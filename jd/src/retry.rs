//! Retry-loop detection
//!
//! A job's iteration loop feeds every review outcome through
//! [`RetryLoopDetector::check`]. Feedback is fingerprinted after
//! canonicalization, so the same complaints reported in a different order
//! still count as a repeat. Once the same fingerprint has been seen
//! `max_consecutive_retries` times in a row the detector tells the loop to
//! stop instead of spinning.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Detector limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLoopConfig {
    /// Abort once the same feedback has been seen this many times in a row
    pub max_consecutive_retries: u32,
    /// Fingerprints kept in the ring
    pub history_size: usize,
}

impl Default for RetryLoopConfig {
    fn default() -> Self {
        Self {
            max_consecutive_retries: 2,
            history_size: 10,
        }
    }
}

/// Exportable detector memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLoopState {
    /// Most recent fingerprints, oldest first
    pub history: VecDeque<String>,
    /// Calls whose fingerprint matched the one immediately before
    pub consecutive_repeat_count: u32,
    /// Iteration of the last non-pass check
    #[serde(default)]
    pub last_iteration: Option<u32>,
}

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryVerdict {
    pub should_abort: bool,
    pub reason: Option<String>,
}

impl RetryVerdict {
    fn proceed() -> Self {
        Self {
            should_abort: false,
            reason: None,
        }
    }
}

pub struct RetryLoopDetector {
    config: RetryLoopConfig,
    state: RetryLoopState,
}

impl RetryLoopDetector {
    pub fn new(config: RetryLoopConfig) -> Self {
        debug!(?config, "RetryLoopDetector::new: called");
        Self {
            config,
            state: RetryLoopState::default(),
        }
    }

    /// Record one review outcome and decide whether the loop should stop
    ///
    /// A `pass` status clears the repeat counter and never aborts.
    pub fn check(&mut self, status: &str, feedback: &Value, iteration: u32) -> RetryVerdict {
        debug!(%status, %iteration, "RetryLoopDetector::check: called");
        if is_pass_status(status) {
            debug!("RetryLoopDetector::check: pass status, resetting");
            self.state.consecutive_repeat_count = 0;
            self.state.history.clear();
            return RetryVerdict::proceed();
        }

        let fp = fingerprint(feedback);
        if self.state.history.back() == Some(&fp) {
            self.state.consecutive_repeat_count += 1;
        } else {
            self.state.consecutive_repeat_count = 0;
        }
        self.state.history.push_back(fp);
        while self.state.history.len() > self.config.history_size.max(1) {
            self.state.history.pop_front();
        }
        self.state.last_iteration = Some(iteration);

        let seen_in_a_row = self.state.consecutive_repeat_count + 1;
        debug!(%seen_in_a_row, max = self.config.max_consecutive_retries, "RetryLoopDetector::check: evaluated");
        if seen_in_a_row >= self.config.max_consecutive_retries.max(1) {
            let reason = format!(
                "identical feedback seen {} times in a row (iteration {})",
                seen_in_a_row, iteration
            );
            info!(%iteration, %reason, "Retry loop detected");
            return RetryVerdict {
                should_abort: true,
                reason: Some(reason),
            };
        }
        RetryVerdict::proceed()
    }

    pub fn export(&self) -> RetryLoopState {
        self.state.clone()
    }

    /// Restore memory saved by [`export`](Self::export), trimming to the ring size
    pub fn restore(&mut self, mut state: RetryLoopState) {
        debug!(history = state.history.len(), repeats = state.consecutive_repeat_count, "RetryLoopDetector::restore: called");
        while state.history.len() > self.config.history_size.max(1) {
            state.history.pop_front();
        }
        self.state = state;
    }

    pub fn consecutive_repeat_count(&self) -> u32 {
        self.state.consecutive_repeat_count
    }
}

/// The one definition of a passing review status
pub fn is_pass_status(status: &str) -> bool {
    let status = status.trim();
    status.eq_ignore_ascii_case("pass") || status.eq_ignore_ascii_case("passed")
}

/// SHA-256 hex digest of the canonical form of `feedback`
pub fn fingerprint(feedback: &Value) -> String {
    let canonical = canonicalize(feedback).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Order-independent form: object keys sorted, array elements sorted by their own canonical text
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            // serde_json::Map keeps keys sorted unless preserve_order is on
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect())
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonicalize).collect();
            items.sort_by_cached_key(|v| v.to_string());
            Value::Array(items)
        }
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}
