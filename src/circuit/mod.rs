//! Per-target circuit breakers.
//!
//! ```text
//!   CLOSED --(failure_threshold counted failures)--> OPEN
//!   OPEN --(now >= next_attempt_time, next execute)--> HALF_OPEN (single probe)
//!   HALF_OPEN --(probe succeeds)--> CLOSED
//!   HALF_OPEN --(probe fails)--> OPEN
//! ```

mod breaker;
mod registry;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use breaker::CircuitBreaker;
pub use registry::CircuitBreakerRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Counted failures inside one monitoring window that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before admitting a probe.
    pub recovery_timeout: Duration,
    /// Rolling window for counters and failure-rate stats.
    pub monitoring_period: Duration,
    /// Error messages containing any of these are returned but never counted.
    pub expected_errors: Vec<String>,
    /// Capacity of the recent-outcome ring.
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
            expected_errors: Vec::new(),
            window_size: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The call was rejected without invoking the operation.
    #[error("circuit breaker open for {key}")]
    Open {
        key: String,
        retry_at: Option<DateTime<Utc>>,
    },
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}
