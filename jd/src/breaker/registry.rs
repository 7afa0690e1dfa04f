//! Named breakers shared across jobs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};

/// Hands out one shared breaker per call-site name
///
/// Every job that talks to the same provider gets the same `Arc`, so one
/// job's failures protect the others.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `name`
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        debug!(%name, "BreakerRegistry::get: called");
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshot of every breaker, sorted by name
    pub fn snapshot(&self) -> Vec<(String, CircuitState, BreakerStats)> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
            guard.values().cloned().collect()
        };
        let mut out: Vec<_> = breakers
            .iter()
            .map(|b| (b.name().to_string(), b.state(), b.stats()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn reset_all(&self) {
        let guard = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        for breaker in guard.values() {
            breaker.reset();
        }
    }
}
