use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specta::Type;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct CircuitBreakerStats {
    pub key: String,
    pub state: CircuitState,
    /// Counters of the current monitoring window.
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u32,
    /// Derived from the outcome ring, not from the window counters.
    pub failure_rate: f64,
    pub average_duration_ms: Option<u64>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    /// If state is open, the earliest moment a probe call is admitted.
    pub next_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}
