//! Circuit breaker state machine
//!
//! ```text
//! closed    --failures or failure rate-->   open
//! open      --open_timeout elapsed-->       half_open
//! half_open --success_threshold successes--> closed
//! half_open --any failure-->                open
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::BreakerConfig;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing, calls are rejected
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Call counters, monotonic until [`CircuitBreaker::reset`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub state_changes: u64,
}

/// Error returned by a guarded call
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the call
    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The guarded call's own error, unchanged
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    window: VecDeque<bool>,
    stats: BreakerStats,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            window: VecDeque::new(),
            stats: BreakerStats::default(),
        }
    }
}

/// Fault isolation for one guarded call-site
///
/// Shared by reference (usually `Arc`) between every job that calls the
/// same dependency. Counters live under one mutex which is never held across
/// the guarded call itself.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        debug!(%name, ?config, "CircuitBreaker::new: called");
        Self {
            name,
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Guard an async call
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        debug!(name = %self.name, "CircuitBreaker::call: called");
        self.admit()?;
        let result = f().await;
        self.record(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Guard a blocking call
    pub fn call_sync<F, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        debug!(name = %self.name, "CircuitBreaker::call_sync: called");
        self.admit()?;
        let result = f();
        self.record(result.is_ok());
        result.map_err(BreakerError::Inner)
    }

    /// Current state, with an expired open timeout reported as half-open
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        self.lock().stats.clone()
    }

    /// Time left before an open breaker starts probing
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(self.config.open_timeout.saturating_sub(opened_at.elapsed())),
            _ => None,
        }
    }

    /// Operator reset: back to closed with fresh counters and stats
    pub fn reset(&self) {
        info!(name = %self.name, "Circuit breaker manually reset");
        *self.lock() = Inner::new();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        if inner.state == CircuitState::Open {
            inner.stats.rejected += 1;
            let retry_after = inner
                .opened_at
                .map(|t| self.config.open_timeout.saturating_sub(t.elapsed()))
                .unwrap_or(self.config.open_timeout);
            debug!(name = %self.name, ?retry_after, "CircuitBreaker::admit: rejected");
            return Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after,
            });
        }
        inner.stats.total_calls += 1;
        Ok(())
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|t| t.elapsed() >= self.config.open_timeout)
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn record(&self, success: bool) {
        let mut inner = self.lock();
        let now = Utc::now();
        if success {
            inner.stats.successes += 1;
            inner.stats.last_success = Some(now);
        } else {
            inner.stats.failures += 1;
            inner.stats.last_failure = Some(now);
        }

        match inner.state {
            CircuitState::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes += 1;
                } else {
                    inner.consecutive_successes = 0;
                    inner.consecutive_failures += 1;
                }
                inner.window.push_back(success);
                while inner.window.len() > self.config.rate_window.max(1) {
                    inner.window.pop_front();
                }
                if self.should_trip(&inner) {
                    warn!(
                        name = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        "Circuit breaker opening"
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold.max(1) {
                        info!(name = %self.name, "Circuit breaker closing (dependency recovered)");
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                } else {
                    warn!(name = %self.name, "Circuit breaker probe failed, reopening");
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            // Outcome of a call admitted before another caller tripped the breaker
            CircuitState::Open => {}
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
            return true;
        }
        let requests = inner.window.len();
        if requests == 0 || (requests as u32) < self.config.min_requests_for_rate {
            return false;
        }
        let failures = inner.window.iter().filter(|ok| !**ok).count();
        failures as f64 / requests as f64 >= self.config.failure_rate_threshold
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        debug!(name = %self.name, from = %inner.state, %to, "CircuitBreaker::transition: called");
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.window.clear();
        inner.stats.state_changes += 1;
        inner.opened_at = if to == CircuitState::Open { Some(Instant::now()) } else { None };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig::with_failure_threshold(threshold)
                .open_timeout(Duration::from_millis(timeout_ms))
                .success_threshold(2),
        )
    }

    fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.call_sync(|| Err::<(), _>("boom".to_string()))
    }

    fn succeed(b: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        b.call_sync(|| Ok::<_, String>(7))
    }

    #[test]
    fn test_opens_after_threshold_and_rejects_without_calling() {
        let b = breaker(3, 60_000);
        for _ in 0..3 {
            assert!(matches!(fail(&b), Err(BreakerError::Inner(ref e)) if e == "boom"));
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = b.call_sync(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        assert!(result.unwrap_err().is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let stats = b.stats();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.state_changes, 1);
        assert!(b.retry_after().is_some());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let b = breaker(3, 60_000);
        fail(&b).unwrap_err();
        fail(&b).unwrap_err();
        succeed(&b).unwrap();
        fail(&b).unwrap_err();
        fail(&b).unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_after_successes() {
        let b = breaker(1, 30);
        fail(&b).unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(succeed(&b).unwrap(), 7);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        // open, half_open, closed
        assert_eq!(b.stats().state_changes, 3);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(1, 30);
        fail(&b).unwrap_err();
        std::thread::sleep(Duration::from_millis(50));

        fail(&b).unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(succeed(&b).unwrap_err().is_open());
    }

    #[test]
    fn test_failure_rate_trips() {
        let config = BreakerConfig {
            failure_threshold: 100,
            failure_rate_threshold: 0.5,
            min_requests_for_rate: 4,
            success_threshold: 1,
            open_timeout: Duration::from_secs(60),
            rate_window: 10,
        };
        let b = CircuitBreaker::new("rate", config);
        succeed(&b).unwrap();
        fail(&b).unwrap_err();
        succeed(&b).unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        // 2 of 4 failed
        fail(&b).unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_clears_everything() {
        let b = breaker(1, 60_000);
        fail(&b).unwrap_err();
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats(), BreakerStats::default());
    }

    #[tokio::test]
    async fn test_async_call_passes_errors_verbatim() {
        let b = breaker(2, 60_000);
        let ok = b.call(|| async { Ok::<_, std::io::Error>("done") }).await.unwrap();
        assert_eq!(ok, "done");

        let err = b
            .call(|| async { Err::<(), _>(std::io::Error::other("disk")) })
            .await
            .unwrap_err();
        let inner = err.into_inner().unwrap();
        assert_eq!(inner.to_string(), "disk");
    }
}
