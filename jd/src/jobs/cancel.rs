//! Cooperative cancellation handed to each job worker

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a worker should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel` was called on the job
    Requested,
    /// The job's `max_runtime_secs` elapsed
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "cancellation requested"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Cancellation token plus an optional deadline
///
/// Workers poll [`check`](Self::check) at iteration boundaries. Nothing here
/// interrupts an in-flight call.
#[derive(Debug, Clone)]
pub struct CancelContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Err` once cancellation was requested or the deadline passed
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.token.is_cancelled() {
            return Err(CancelReason::Requested);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CancelReason::DeadlineExceeded);
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Resolves when the context is cancelled or its deadline passes
    pub async fn cancelled(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CancelReason::Requested,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelReason::Requested
            }
        }
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<(), CancelReason> {
        tokio::select! {
            reason = self.cancelled() => Err(reason),
            _ = tokio::time::sleep(duration) => self.check(),
        }
    }
}
