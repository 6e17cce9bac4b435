use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

/// One attempt-series for delivering one event to one webhook.
///
/// Status only changes through the transitions in `crate::delivery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub workspace_id: Uuid,
    pub event: String,
    /// Serialized JSON document, never rewritten after creation.
    pub payload: String,

    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,

    pub http_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,

    /// Set iff the delivery is pending a scheduled retry (`attempt_count > 0`).
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,

    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}
