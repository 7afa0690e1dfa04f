//! Circuit breaker around unreliable external calls

mod circuit;
mod config;
mod registry;

pub use circuit::{BreakerError, BreakerStats, CircuitBreaker, CircuitState};
pub use config::BreakerConfig;
pub use registry::BreakerRegistry;
