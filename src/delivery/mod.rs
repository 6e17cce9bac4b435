//! Delivery lifecycle: backoff, state transitions and the events they emit.

mod backoff;
mod events;
mod transitions;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use backoff::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
pub use events::{DeliveryEvent, EventPublisher};
pub use transitions::{
    CANCELLED_MESSAGE, DEFAULT_MAX_ATTEMPTS, DeliveryFailure, DeliveryResponse, TransitionError,
};

use crate::types::{ContentType, CreateWebhookRequest, HttpMethod, Webhook, WebhookStatus};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

impl Webhook {
    /// New active webhook with zeroed counters; unset options take defaults.
    pub fn register(req: CreateWebhookRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: req.workspace_id,
            user_id: req.user_id,
            url: req.url,
            secret: req.secret,
            status: WebhookStatus::Active,
            events: req.events.into_iter().collect::<BTreeSet<_>>(),
            http_method: req.http_method.unwrap_or(HttpMethod::Post),
            content_type: req.content_type.unwrap_or(ContentType::Json),
            timeout_ms: req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: req.max_retries.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            retry_delay_ms: req
                .retry_delay_ms
                .unwrap_or(DEFAULT_BASE_DELAY.as_millis() as u64),
            headers: req.headers.unwrap_or_default(),
            signature_header: None,
            signature_algorithm: None,
            success_count: 0,
            failure_count: 0,
            last_delivery_at: None,
            last_delivery_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WebhookStatus::Active
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.events.contains(event)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::for_webhook(self)
    }
}
