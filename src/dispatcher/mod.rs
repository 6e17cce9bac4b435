//! Fan-out, batch processing and background loops.

mod client;
mod config;
mod health;
mod pool;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use client::{
    ATTEMPT_HEADER, AttemptError, DEFAULT_SIGNATURE_HEADER, DELIVERY_ID_HEADER, DeliveryClient,
    EVENT_HEADER, PayloadSigner,
};
pub use config::{DispatcherConfig, LEASE_HEADROOM};
pub use health::compute_health;
pub use pool::WorkerPool;

use crate::circuit::{CircuitBreakerRegistry, CircuitError};
use crate::delivery::{DeliveryEvent, DeliveryFailure, EventPublisher, TransitionError};
use crate::store::{BlockedWebhooks, DeliveryRepository, StoreError, WebhookRepository};
use crate::time::{Clock, millis};
use crate::types::{
    AttemptErrorKind, DeliveryAttemptLog, DeliveryOutcome, DeliveryStatus, Webhook,
    WebhookDelivery, WebhookStatus,
};

pub const CIRCUIT_OPEN_MESSAGE: &str = "circuit breaker open";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("worker shutdown timed out after {timeout_ms}ms")]
    ShutdownTimeout { timeout_ms: u64 },
}

/// What one `process_batch` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deferred: usize,
    /// Outcomes dropped because the row changed underneath us.
    pub conflicts: usize,
    /// Claimed rows skipped because the lease ran out before their attempt.
    pub lease_lost: usize,
}

impl BatchReport {
    /// True when nothing moved forward: only deferrals or an empty claim.
    pub fn is_idle(&self) -> bool {
        self.delivered + self.retried + self.failed + self.cancelled + self.conflicts == 0
    }

    fn record(&mut self, outcome: Processed) {
        match outcome {
            Processed::Delivered => self.delivered += 1,
            Processed::Retried => self.retried += 1,
            Processed::Failed => self.failed += 1,
            Processed::Cancelled => self.cancelled += 1,
            Processed::Deferred => self.deferred += 1,
            Processed::Conflict => self.conflicts += 1,
            Processed::LeaseLost => self.lease_lost += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Delivered,
    Retried,
    Failed,
    Cancelled,
    Deferred,
    Conflict,
    LeaseLost,
}

pub struct Dispatcher {
    deliveries: Arc<dyn DeliveryRepository>,
    webhooks: Arc<dyn WebhookRepository>,
    registry: Arc<CircuitBreakerRegistry>,
    client: DeliveryClient,
    events: EventPublisher,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        deliveries: Arc<dyn DeliveryRepository>,
        webhooks: Arc<dyn WebhookRepository>,
        registry: Arc<CircuitBreakerRegistry>,
        client: DeliveryClient,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            deliveries,
            webhooks,
            registry,
            client,
            events: EventPublisher::default(),
            clock,
            config,
        }
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn deliveries(&self) -> &Arc<dyn DeliveryRepository> {
        &self.deliveries
    }

    pub fn webhooks(&self) -> &Arc<dyn WebhookRepository> {
        &self.webhooks
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Creates one pending delivery per active webhook of `workspace_id`
    /// subscribed to `event_type`.
    pub async fn emit(
        &self,
        workspace_id: Uuid,
        event_type: &str,
        payload: &str,
    ) -> Result<Vec<WebhookDelivery>, DispatchError> {
        serde_json::from_str::<serde::de::IgnoredAny>(payload)
            .map_err(|err| DispatchError::InvalidPayload(err.to_string()))?;

        let webhooks = self
            .webhooks
            .find_subscribed(workspace_id, event_type)
            .await?;
        let now = self.clock.now();

        let mut created = Vec::with_capacity(webhooks.len());
        for webhook in webhooks.iter().filter(|webhook| webhook.is_active()) {
            let (delivery, event) = WebhookDelivery::create(
                webhook.id,
                workspace_id,
                event_type,
                payload,
                webhook.max_retries,
                now,
            );
            self.deliveries.insert(&delivery).await?;
            self.events.publish([event]);
            created.push(delivery);
        }

        info!(
            workspace_id = %workspace_id,
            event = event_type,
            deliveries = created.len(),
            "event fanned out"
        );

        Ok(created)
    }

    /// Claims due deliveries for `worker_id` and runs one attempt each.
    ///
    /// Only the claim itself can fail the batch; per-delivery store errors are
    /// logged and the delivery is picked up again once its lease expires.
    pub async fn process_batch(&self, worker_id: &str) -> Result<BatchReport, DispatchError> {
        let now = self.clock.now();
        let blocked = self.blocked_webhooks(now);
        let claimed = self
            .deliveries
            .claim_due(
                self.config.batch_size,
                worker_id,
                self.config.lease_duration,
                now,
                &blocked,
            )
            .await?;

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(worker_id, claimed = claimed.len(), "claimed deliveries");

        for delivery in claimed {
            let delivery_id = delivery.id;
            match self.process_delivery(worker_id, delivery).await {
                Ok(outcome) => report.record(outcome),
                Err(err) => warn!(
                    worker_id,
                    delivery_id = %delivery_id,
                    error = %err,
                    "delivery left for a later poll"
                ),
            }
        }

        Ok(report)
    }

    async fn process_delivery(
        &self,
        worker_id: &str,
        mut delivery: WebhookDelivery,
    ) -> Result<Processed, DispatchError> {
        let expected_status = delivery.status;
        let expected_attempts = delivery.attempt_count;

        let webhook = self
            .webhooks
            .get_webhook(delivery.webhook_id)
            .await?
            .filter(Webhook::is_active);
        let Some(webhook) = webhook else {
            let events = delivery.cancel(self.clock.now())?;
            info!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                "webhook missing or inactive, delivery cancelled"
            );
            return self
                .persist(worker_id, &delivery, expected_status, expected_attempts, None, events)
                .await
                .map(|saved| if saved { Processed::Cancelled } else { Processed::Conflict });
        };
        let webhook = self.bounded_timeout(webhook);

        // The claim lease covers the whole batch; each attempt gets a fresh one.
        let renewed = self
            .deliveries
            .renew_lease(
                delivery.id,
                worker_id,
                self.config.lease_duration,
                self.clock.now(),
            )
            .await?;
        if !renewed {
            info!(
                worker_id,
                delivery_id = %delivery.id,
                "lease expired before attempt, delivery skipped"
            );
            return Ok(Processed::LeaseLost);
        }

        let breaker = self.registry.get(&webhook.id.to_string());
        let attempt_no = delivery.attempt_count + 1;
        let started_at = self.clock.now();
        let result = breaker
            .execute(|| self.client.deliver(&webhook, &delivery, attempt_no))
            .await;
        let finished_at = self.clock.now();

        let (events, attempt, outcome_error) = match result {
            Ok(response) => {
                let attempt = DeliveryAttemptLog {
                    success: true,
                    http_status_code: Some(response.http_status_code),
                    response_body: response.body.clone(),
                    duration_ms: response.duration_ms.unwrap_or_default(),
                    ..attempt_log(&delivery, attempt_no, started_at, finished_at)
                };
                info!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    attempt = attempt_no,
                    status = response.http_status_code,
                    "delivery succeeded"
                );
                (delivery.mark_delivered(finished_at, response), attempt, None)
            }
            Err(CircuitError::Open { retry_at, .. }) => {
                if !self.is_starved(&delivery, finished_at) {
                    self.deliveries.release(delivery.id, worker_id).await?;
                    debug!(
                        delivery_id = %delivery.id,
                        webhook_id = %webhook.id,
                        retry_at = ?retry_at,
                        "circuit open, delivery deferred"
                    );
                    return Ok(Processed::Deferred);
                }
                warn!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    "delivery starved behind open circuit, failing attempt"
                );
                let attempt = DeliveryAttemptLog {
                    error_kind: Some(AttemptErrorKind::CircuitOpen),
                    error_message: Some(CIRCUIT_OPEN_MESSAGE.to_string()),
                    ..attempt_log(&delivery, attempt_no, started_at, finished_at)
                };
                let events = delivery.mark_failed(
                    finished_at,
                    &webhook.backoff_policy(),
                    DeliveryFailure::message(CIRCUIT_OPEN_MESSAGE),
                )?;
                (events, attempt, Some(CIRCUIT_OPEN_MESSAGE.to_string()))
            }
            Err(CircuitError::Inner(err)) => {
                let message = err.to_string();
                let (http_status_code, response_body) = match &err {
                    AttemptError::HttpStatus {
                        status_code, body, ..
                    } => (Some(*status_code), body.clone()),
                    _ => (None, None),
                };
                let attempt = DeliveryAttemptLog {
                    http_status_code,
                    response_body,
                    error_kind: Some(err.kind()),
                    error_message: Some(message.clone()),
                    duration_ms: err.duration_ms(),
                    ..attempt_log(&delivery, attempt_no, started_at, finished_at)
                };
                warn!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    attempt = attempt_no,
                    error = %message,
                    "delivery attempt failed"
                );
                let events = delivery.mark_failed(
                    finished_at,
                    &webhook.backoff_policy(),
                    err.into_failure(),
                )?;
                (events, attempt, Some(message))
            }
        };

        let processed = match delivery.status {
            DeliveryStatus::Delivered => Processed::Delivered,
            DeliveryStatus::Pending => Processed::Retried,
            DeliveryStatus::Failed => Processed::Failed,
        };

        let saved = self
            .persist(
                worker_id,
                &delivery,
                expected_status,
                expected_attempts,
                Some(&attempt),
                events,
            )
            .await?;

        let outcome = if outcome_error.is_none() {
            DeliveryOutcome::Success
        } else {
            DeliveryOutcome::Failure
        };
        if let Err(err) = self
            .webhooks
            .record_delivery_outcome(webhook.id, outcome, outcome_error.as_deref(), finished_at)
            .await
        {
            warn!(webhook_id = %webhook.id, error = %err, "failed to record webhook outcome");
        }

        Ok(if saved { processed } else { Processed::Conflict })
    }

    /// Saves and publishes. `Ok(false)` means the row moved on concurrently
    /// and the outcome was discarded.
    async fn persist(
        &self,
        worker_id: &str,
        delivery: &WebhookDelivery,
        expected_status: DeliveryStatus,
        expected_attempts: u32,
        attempt: Option<&DeliveryAttemptLog>,
        events: Vec<DeliveryEvent>,
    ) -> Result<bool, DispatchError> {
        match self
            .deliveries
            .save_leased(delivery, worker_id, expected_status, expected_attempts, attempt)
            .await
        {
            Ok(()) => {
                self.events.publish(events);
                Ok(true)
            }
            Err(StoreError::Conflict(reason)) => {
                info!(
                    delivery_id = %delivery.id,
                    reason = %reason,
                    "delivery changed concurrently, outcome discarded"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn is_starved(&self, delivery: &WebhookDelivery, now: DateTime<Utc>) -> bool {
        now - delivery.due_at() >= millis(self.config.starvation_threshold)
    }

    /// Webhooks to leave out of the next claim. Rows old enough to starve are
    /// still claimed so they can be failed.
    fn blocked_webhooks(&self, now: DateTime<Utc>) -> BlockedWebhooks {
        BlockedWebhooks {
            ids: self
                .registry
                .rejecting_keys()
                .iter()
                .filter_map(|key| Uuid::parse_str(key).ok())
                .collect(),
            starved_before: Some(now - millis(self.config.starvation_threshold)),
        }
    }

    /// Caps the attempt timeout of webhooks stored before the lease was
    /// shortened, so no attempt can outlive its lease.
    fn bounded_timeout(&self, mut webhook: Webhook) -> Webhook {
        let max_ms =
            u64::try_from(self.config.max_attempt_timeout().as_millis()).unwrap_or(u64::MAX);
        if webhook.timeout_ms > max_ms {
            debug!(
                webhook_id = %webhook.id,
                timeout_ms = webhook.timeout_ms,
                max_ms,
                "attempt timeout capped to lease"
            );
            webhook.timeout_ms = max_ms;
        }
        webhook
    }

    /// Sets the webhook's status. Anything but `active` also cancels its
    /// pending deliveries; returns how many were cancelled.
    pub async fn set_webhook_status(
        &self,
        webhook_id: Uuid,
        status: WebhookStatus,
    ) -> Result<u64, DispatchError> {
        let now = self.clock.now();
        self.webhooks
            .set_webhook_status(webhook_id, status, now)
            .await?;
        if status == WebhookStatus::Active {
            return Ok(0);
        }
        let cancelled = self
            .deliveries
            .cancel_pending_for_webhook(webhook_id, now)
            .await?;
        Ok(self.publish_cancellations(webhook_id, &cancelled, now))
    }

    /// Deletes the webhook and cancels its pending deliveries.
    pub async fn delete_webhook(&self, webhook_id: Uuid) -> Result<u64, DispatchError> {
        let now = self.clock.now();
        let cancelled = self.webhooks.delete_webhook(webhook_id, now).await?;
        Ok(self.publish_cancellations(webhook_id, &cancelled, now))
    }

    fn publish_cancellations(&self, webhook_id: Uuid, ids: &[Uuid], at: DateTime<Utc>) -> u64 {
        self.events
            .publish(ids.iter().map(|&delivery_id| DeliveryEvent::Cancelled {
                delivery_id,
                webhook_id,
                at,
            }));
        ids.len() as u64
    }
}

/// Failed-attempt skeleton; callers fill in what they observed.
fn attempt_log(
    delivery: &WebhookDelivery,
    attempt_no: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> DeliveryAttemptLog {
    DeliveryAttemptLog {
        id: Uuid::new_v4(),
        delivery_id: delivery.id,
        webhook_id: delivery.webhook_id,
        attempt_no,
        started_at,
        finished_at,
        success: false,
        http_status_code: None,
        response_body: None,
        error_kind: None,
        error_message: None,
        duration_ms: 0,
    }
}
