use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
pub struct DeliveryAttemptLog {
    pub id: Uuid,
    pub delivery_id: Uuid,
    pub webhook_id: Uuid,
    pub attempt_no: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    pub success: bool,
    pub http_status_code: Option<u16>,
    pub response_body: Option<String>,

    pub error_kind: Option<AttemptErrorKind>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorKind {
    Timeout,
    Network,
    HttpStatus,
    CircuitOpen,
    Unexpected,
}
