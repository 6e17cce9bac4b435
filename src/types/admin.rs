use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

use super::{
    CircuitBreakerStats, ContentType, DeliveryAttemptLog, DeliveryOutcome, HttpMethod, Webhook,
    WebhookDelivery, WebhookStatus,
};

/// Admin view of a webhook. The signing secret is reduced to `has_secret`.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct WebhookResponse {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub has_secret: bool,
    pub status: WebhookStatus,
    pub events: BTreeSet<String>,
    pub http_method: HttpMethod,
    pub content_type: ContentType,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub signature_header: Option<String>,
    pub signature_algorithm: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_delivery_status: Option<DeliveryOutcome>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Webhook> for WebhookResponse {
    fn from(webhook: Webhook) -> Self {
        Self {
            id: webhook.id,
            workspace_id: webhook.workspace_id,
            user_id: webhook.user_id,
            url: webhook.url,
            has_secret: webhook.secret.is_some_and(|secret| !secret.is_empty()),
            status: webhook.status,
            events: webhook.events,
            http_method: webhook.http_method,
            content_type: webhook.content_type,
            timeout_ms: webhook.timeout_ms,
            max_retries: webhook.max_retries,
            retry_delay_ms: webhook.retry_delay_ms,
            headers: webhook.headers,
            signature_header: webhook.signature_header,
            signature_algorithm: webhook.signature_algorithm,
            success_count: webhook.success_count,
            failure_count: webhook.failure_count,
            last_delivery_at: webhook.last_delivery_at,
            last_delivery_status: webhook.last_delivery_status,
            last_error: webhook.last_error,
            created_at: webhook.created_at,
            updated_at: webhook.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct EmitEventResponse {
    pub delivery_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ListDeliveriesResponse {
    pub deliveries: Vec<WebhookDelivery>,
    pub next_before: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ListAttemptsResponse {
    pub attempts: Vec<DeliveryAttemptLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct UpdateWebhookStatusRequest {
    pub status: WebhookStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct UpdateWebhookStatusResponse {
    pub webhook_id: Uuid,
    pub status: WebhookStatus,
    pub cancelled_deliveries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct ListCircuitsResponse {
    pub circuits: Vec<CircuitBreakerStats>,
}

/// Minimal registration input; everything but the target is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct CreateWebhookRequest {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub http_method: Option<HttpMethod>,
    pub content_type: Option<ContentType>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub headers: Option<BTreeMap<String, String>>,
}
