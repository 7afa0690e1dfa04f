//! Circuit breaker thresholds

use std::time::Duration;

/// Immutable breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker
    pub failure_threshold: u32,

    /// Failure ratio over the rate window that trips a closed breaker
    pub failure_rate_threshold: f64,

    /// Window size below which the failure ratio is ignored
    pub min_requests_for_rate: u32,

    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,

    /// How long an open breaker rejects calls before probing
    pub open_timeout: Duration,

    /// Number of most recent outcomes the failure ratio is computed over
    pub rate_window: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            min_requests_for_rate: 10,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            rate_window: 20,
        }
    }
}

impl BreakerConfig {
    /// Config that only trips on consecutive failures
    pub fn with_failure_threshold(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            ..Default::default()
        }
    }

    pub fn open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn success_threshold(mut self, success_threshold: u32) -> Self {
        self.success_threshold = success_threshold;
        self
    }
}
