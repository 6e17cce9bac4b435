//! Repository contracts for deliveries and webhooks.
//!
//! The dispatcher only talks to these traits; [`SqliteStore`] is the
//! production adapter.

mod rows;
mod sqlite;
mod stats;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    DeliveryAttemptLog, DeliveryOutcome, DeliveryStats, DeliveryStatus, Webhook, WebhookDelivery,
    WebhookStatus,
};

pub use sqlite::SqliteStore;

/// Retry rows whose `next_retry_at` lies further back than this are overdue:
/// no backoff schedule ever waits longer.
pub const OVERDUE_RETRY_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ListDeliveriesParams {
    pub limit: i64,
    pub before: Option<DeliveryCursor>,
    pub status: Option<DeliveryStatus>,
    pub webhook_id: Option<Uuid>,
    pub workspace_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ListDeliveriesResult {
    pub deliveries: Vec<WebhookDelivery>,
    pub next_before: Option<DeliveryCursor>,
}

#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub webhook_id: Option<Uuid>,
    pub workspace_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Webhooks whose breaker is rejecting calls right now.
///
/// `claim_due` leaves their deliveries alone so they cannot crowd out other
/// targets, except rows due at or before `starved_before`, which still have to
/// reach the dispatcher to be failed.
#[derive(Debug, Clone, Default)]
pub struct BlockedWebhooks {
    pub ids: Vec<Uuid>,
    pub starved_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn insert(&self, delivery: &WebhookDelivery) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WebhookDelivery>, StoreError>;

    /// Atomically leases up to `limit` due deliveries to `worker_id`, oldest
    /// due first. Rows under a live lease are never returned.
    async fn claim_due(
        &self,
        limit: u32,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
        blocked: &BlockedWebhooks,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Extends `worker_id`'s lease to `now + lease`. Returns false when the
    /// lease already expired or belongs to someone else; the caller must not
    /// attempt the delivery then.
    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drops `worker_id`'s lease without touching the delivery.
    async fn release(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Never-attempted deliveries created at or before `older_than`.
    async fn find_pending_deliveries(
        &self,
        limit: u32,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    async fn find_ready_for_retry(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Retries due more than [`OVERDUE_RETRY_GRACE`] ago.
    async fn find_overdue_retries(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    /// Optimistic update keyed on the status and attempt count the caller
    /// read. Any lease is left in place. `attempt` is appended in the same
    /// transaction.
    async fn save(
        &self,
        delivery: &WebhookDelivery,
        expected_status: DeliveryStatus,
        expected_attempt_count: u32,
        attempt: Option<&DeliveryAttemptLog>,
    ) -> Result<(), StoreError>;

    /// Like [`save`](Self::save), but also requires the row to be leased by
    /// `worker_id`, and clears the lease.
    async fn save_leased(
        &self,
        delivery: &WebhookDelivery,
        worker_id: &str,
        expected_status: DeliveryStatus,
        expected_attempt_count: u32,
        attempt: Option<&DeliveryAttemptLog>,
    ) -> Result<(), StoreError>;

    async fn list_attempts(&self, delivery_id: Uuid) -> Result<Vec<DeliveryAttemptLog>, StoreError>;

    /// Forces `status` onto `ids`. Exhausted rows are never set back to
    /// `pending`, and `delivered` clears the error message.
    async fn bulk_update_status(
        &self,
        ids: &[Uuid],
        status: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Returns the ids of the deliveries it cancelled.
    async fn cancel_pending_for_webhook(
        &self,
        webhook_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Deletes finished deliveries created before `older_than`.
    async fn cleanup_old_deliveries(
        &self,
        older_than: DateTime<Utc>,
        keep_successful: bool,
    ) -> Result<u64, StoreError>;

    async fn list(&self, params: &ListDeliveriesParams)
    -> Result<ListDeliveriesResult, StoreError>;

    /// Newest first.
    async fn recent_attempts(
        &self,
        webhook_id: Uuid,
        limit: u32,
    ) -> Result<Vec<DeliveryAttemptLog>, StoreError>;

    async fn get_stats(&self, filter: &StatsFilter) -> Result<DeliveryStats, StoreError>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<(), StoreError>;

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError>;

    /// Active webhooks of `workspace_id` subscribed to `event`.
    async fn find_subscribed(
        &self,
        workspace_id: Uuid,
        event: &str,
    ) -> Result<Vec<Webhook>, StoreError>;

    async fn list_active(&self) -> Result<Vec<Webhook>, StoreError>;

    async fn record_delivery_outcome(
        &self,
        id: Uuid,
        outcome: DeliveryOutcome,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_webhook_status(
        &self,
        id: Uuid,
        status: WebhookStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Cancels the webhook's pending deliveries and deletes it in one
    /// transaction. Returns the ids of the cancelled deliveries.
    async fn delete_webhook(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<Vec<Uuid>, StoreError>;
}
