use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type, Default)]
pub struct DeliveryStats {
    pub total: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    /// Delivered over finished (delivered + failed), 0.0 when nothing finished.
    pub success_rate: f64,
    pub average_duration_ms: Option<f64>,
    pub by_event: BTreeMap<String, u64>,
    pub by_status_code: BTreeMap<u16, u64>,
    pub errors: Vec<ErrorAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct ErrorAnalysis {
    pub message: String,
    pub count: u64,
    pub percentage: f64,
    pub last_seen: DateTime<Utc>,
    pub status_codes: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct HealthMetrics {
    pub webhook_id: Uuid,
    /// Success rate over the last `sample_size` attempts.
    pub recent_success_rate: f64,
    pub sample_size: u32,
    /// Mean attempt duration over the trailing 24 hours.
    pub average_response_time_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}
