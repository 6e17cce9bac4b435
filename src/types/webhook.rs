use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

/// A registered delivery target. Never serialized directly: the API renders
/// [`WebhookResponse`](super::WebhookResponse), which withholds the secret.
#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub secret: Option<String>,
    pub status: WebhookStatus,
    pub events: BTreeSet<String>,

    pub http_method: HttpMethod,
    pub content_type: ContentType,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Base unit of the retry backoff.
    pub retry_delay_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub signature_header: Option<String>,
    pub signature_algorithm: Option<String>,

    // Lifetime counters, never reset.
    pub success_count: u64,
    pub failure_count: u64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_delivery_status: Option<DeliveryOutcome>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Active,
    Paused,
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
pub enum ContentType {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/x-www-form-urlencoded")]
    FormUrlEncoded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Failure,
}
