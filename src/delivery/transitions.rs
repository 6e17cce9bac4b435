use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::{BackoffPolicy, DeliveryEvent};
use crate::time::millis;
use crate::types::{DeliveryStatus, WebhookDelivery};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("delivery {id} is already delivered")]
    AlreadyDelivered { id: Uuid },
    #[error("delivery {id} is not pending (status {status:?})")]
    NotPending { id: Uuid, status: DeliveryStatus },
    #[error(
        "delivery {id} cannot be retried (status {status:?}, attempt {attempt_count} of {max_attempts})"
    )]
    RetryNotAllowed {
        id: Uuid,
        status: DeliveryStatus,
        attempt_count: u32,
        max_attempts: u32,
    },
}

/// A 2xx response from the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub http_status_code: u16,
    pub body: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub duration_ms: Option<u64>,
}

/// Everything captured from a failed attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub error_message: String,
    pub http_status_code: Option<u16>,
    pub body: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub duration_ms: Option<u64>,
}

impl DeliveryFailure {
    pub fn message(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            ..Self::default()
        }
    }
}

impl WebhookDelivery {
    pub fn create(
        webhook_id: Uuid,
        workspace_id: Uuid,
        event: impl Into<String>,
        payload: impl Into<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> (Self, DeliveryEvent) {
        let delivery = Self {
            id: Uuid::new_v4(),
            webhook_id,
            workspace_id,
            event: event.into(),
            payload: payload.into(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            http_status_code: None,
            response_body: None,
            response_headers: None,
            error_message: None,
            duration_ms: None,
            next_retry_at: None,
            delivered_at: None,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        let event = DeliveryEvent::Created {
            delivery_id: delivery.id,
            webhook_id: delivery.webhook_id,
            workspace_id: delivery.workspace_id,
            event: delivery.event.clone(),
            at: now,
        };
        (delivery, event)
    }

    /// Idempotent: a second call on a delivered row changes nothing.
    pub fn mark_delivered(
        &mut self,
        now: DateTime<Utc>,
        response: DeliveryResponse,
    ) -> Vec<DeliveryEvent> {
        if self.status == DeliveryStatus::Delivered {
            return Vec::new();
        }

        self.status = DeliveryStatus::Delivered;
        self.http_status_code = Some(response.http_status_code);
        self.response_body = response.body;
        self.response_headers = response.headers;
        self.duration_ms = response.duration_ms;
        self.error_message = None;
        self.next_retry_at = None;
        self.delivered_at = Some(now);
        self.updated_at = now;

        vec![DeliveryEvent::Succeeded {
            delivery_id: self.id,
            webhook_id: self.webhook_id,
            http_status_code: response.http_status_code,
            attempt_count: self.attempt_count,
            at: now,
        }]
    }

    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
        failure: DeliveryFailure,
    ) -> Result<Vec<DeliveryEvent>, TransitionError> {
        if self.status != DeliveryStatus::Pending {
            return Err(TransitionError::NotPending {
                id: self.id,
                status: self.status,
            });
        }

        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        self.http_status_code = failure.http_status_code;
        self.response_body = failure.body;
        self.response_headers = failure.headers;
        self.duration_ms = failure.duration_ms;
        self.error_message = Some(failure.error_message.clone());
        self.updated_at = now;

        let will_retry = self.attempt_count < self.max_attempts;
        let mut events = vec![DeliveryEvent::Failed {
            delivery_id: self.id,
            webhook_id: self.webhook_id,
            attempt_count: self.attempt_count,
            http_status_code: self.http_status_code,
            error_message: failure.error_message,
            will_retry,
            at: now,
        }];

        if will_retry {
            let delay = backoff.delay_for_attempt(self.attempt_count);
            let next = now + millis(delay);
            self.next_retry_at = Some(next);
            events.push(DeliveryEvent::RetryScheduled {
                delivery_id: self.id,
                webhook_id: self.webhook_id,
                attempt_count: self.attempt_count,
                next_retry_at: Some(next),
                at: now,
            });
        } else {
            self.status = DeliveryStatus::Failed;
            self.next_retry_at = None;
        }

        Ok(events)
    }

    /// Makes the delivery due immediately. Never touches `attempt_count`.
    pub fn schedule_retry(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryEvent>, TransitionError> {
        if !self.can_retry() {
            return Err(TransitionError::RetryNotAllowed {
                id: self.id,
                status: self.status,
                attempt_count: self.attempt_count,
                max_attempts: self.max_attempts,
            });
        }

        self.status = DeliveryStatus::Pending;
        self.next_retry_at = (self.attempt_count > 0).then_some(now);
        self.updated_at = now;

        Ok(vec![DeliveryEvent::RetryScheduled {
            delivery_id: self.id,
            webhook_id: self.webhook_id,
            attempt_count: self.attempt_count,
            next_retry_at: self.next_retry_at,
            at: now,
        }])
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Vec<DeliveryEvent>, TransitionError> {
        if self.status == DeliveryStatus::Delivered {
            return Err(TransitionError::AlreadyDelivered { id: self.id });
        }

        self.status = DeliveryStatus::Failed;
        self.error_message = Some(CANCELLED_MESSAGE.to_string());
        self.next_retry_at = None;
        self.updated_at = now;

        Ok(vec![DeliveryEvent::Cancelled {
            delivery_id: self.id,
            webhook_id: self.webhook_id,
            at: now,
        }])
    }

    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
            && matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::Failed)
    }

    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.can_retry() && self.next_retry_at.is_some_and(|at| now >= at)
    }

    pub fn is_new(&self) -> bool {
        self.status == DeliveryStatus::Pending && self.attempt_count == 0
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }

    /// When the delivery became (or becomes) eligible for an attempt.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use super::*;

    fn delivery(max_attempts: u32) -> WebhookDelivery {
        let (delivery, _) = WebhookDelivery::create(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "task.created",
            r#"{"id":1}"#,
            max_attempts,
            Utc::now(),
        );
        delivery
    }

    fn ok(code: u16) -> DeliveryResponse {
        DeliveryResponse {
            http_status_code: code,
            body: Some("ok".to_string()),
            headers: None,
            duration_ms: Some(12),
        }
    }

    fn assert_invariants(delivery: &WebhookDelivery) {
        assert!(delivery.attempt_count <= delivery.max_attempts);
        assert_eq!(
            delivery.next_retry_at.is_some(),
            delivery.status == DeliveryStatus::Pending && delivery.attempt_count > 0,
            "next_retry_at out of sync for {delivery:?}"
        );
    }

    #[test]
    fn create_starts_pending_and_new() {
        let (delivery, event) = WebhookDelivery::create(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "task.created",
            "{}",
            0,
            Utc::now(),
        );
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.max_attempts, 1);
        assert!(delivery.is_new());
        assert!(!delivery.is_terminal());
        assert_eq!(event.name(), "delivery.created");
        assert_invariants(&delivery);
    }

    #[test]
    fn failures_below_limit_schedule_backoff() {
        let mut delivery = delivery(5);
        let policy = BackoffPolicy::default();
        let now = Utc::now();

        let events = delivery
            .mark_failed(now, &policy, DeliveryFailure::message("HTTP 500"))
            .unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_count, 1);
        assert_eq!(delivery.next_retry_at, Some(now + Duration::seconds(1)));
        let names: Vec<_> = events.iter().map(DeliveryEvent::name).collect();
        assert_eq!(names, ["delivery.failed", "delivery.retry_scheduled"]);
        assert_invariants(&delivery);
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let mut delivery = delivery(20);
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        let mut previous = Duration::zero();

        for _ in 0..19 {
            delivery
                .mark_failed(now, &policy, DeliveryFailure::message("timeout"))
                .unwrap();
            let delay = delivery.next_retry_at.unwrap() - now;
            assert!(delay > Duration::zero());
            assert!(delay >= previous);
            assert!(delay <= Duration::minutes(5));
            previous = delay;
            assert_invariants(&delivery);
        }
        assert_eq!(previous, Duration::minutes(5));
    }

    #[test]
    fn exhausting_attempts_fails_terminally() {
        let mut delivery = delivery(2);
        let policy = BackoffPolicy::default();
        let now = Utc::now();

        delivery
            .mark_failed(now, &policy, DeliveryFailure::message("HTTP 503"))
            .unwrap();
        let events = delivery
            .mark_failed(now, &policy, DeliveryFailure::message("HTTP 503"))
            .unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.attempt_count, 2);
        assert_eq!(delivery.next_retry_at, None);
        assert!(delivery.is_terminal());
        assert!(!delivery.can_retry());
        assert!(matches!(
            events.as_slice(),
            [DeliveryEvent::Failed { will_retry: false, .. }]
        ));
        assert_invariants(&delivery);

        let err = delivery
            .mark_failed(now, &policy, DeliveryFailure::message("late"))
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotPending { .. }));
        assert_eq!(delivery.attempt_count, 2);
    }

    #[test]
    fn mark_delivered_is_idempotent() {
        let mut delivery = delivery(3);
        let first = Utc::now();

        let events = delivery.mark_delivered(first, ok(200));
        assert_eq!(events.len(), 1);
        let snapshot = delivery.clone();

        let events = delivery.mark_delivered(first + Duration::seconds(10), ok(204));
        assert!(events.is_empty());
        assert_eq!(delivery, snapshot);
        assert_eq!(delivery.delivered_at, Some(first));
        assert_invariants(&delivery);
    }

    #[test]
    fn delivered_after_failure_clears_retry_state() {
        let mut delivery = delivery(3);
        let now = Utc::now();
        delivery
            .mark_failed(now, &BackoffPolicy::default(), DeliveryFailure::message("boom"))
            .unwrap();

        delivery.mark_delivered(now + Duration::seconds(2), ok(200));

        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivery.error_message, None);
        assert_eq!(delivery.next_retry_at, None);
        assert_eq!(delivery.attempt_count, 1);
        assert_invariants(&delivery);
    }

    #[test]
    fn cancel_rejected_once_delivered() {
        let mut delivery = delivery(3);
        delivery.mark_delivered(Utc::now(), ok(200));
        let snapshot = delivery.clone();

        let err = delivery.cancel(Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::AlreadyDelivered { .. }));
        assert_eq!(delivery, snapshot);
    }

    #[test]
    fn cancel_fails_pending_delivery() {
        let mut delivery = delivery(3);
        let events = delivery.cancel(Utc::now()).unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(events[0].name(), "delivery.cancelled");
        assert_invariants(&delivery);
    }

    #[test]
    fn schedule_retry_revives_cancelled_delivery() {
        let mut delivery = delivery(3);
        let now = Utc::now();
        delivery
            .mark_failed(now, &BackoffPolicy::default(), DeliveryFailure::message("x"))
            .unwrap();
        delivery.cancel(now).unwrap();

        let later = now + Duration::seconds(30);
        delivery.schedule_retry(later).unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_count, 1);
        assert_eq!(delivery.next_retry_at, Some(later));
        assert!(delivery.is_retry_due(later));
        assert_invariants(&delivery);
    }

    #[test]
    fn schedule_retry_rejected_when_exhausted() {
        let mut delivery = delivery(1);
        let now = Utc::now();
        delivery
            .mark_failed(now, &BackoffPolicy::default(), DeliveryFailure::message("x"))
            .unwrap();
        let snapshot = delivery.clone();

        let err = delivery.schedule_retry(now).unwrap_err();
        assert!(matches!(err, TransitionError::RetryNotAllowed { .. }));
        assert_eq!(delivery, snapshot);
    }

    #[test]
    fn retry_due_only_after_next_retry_at() {
        let mut delivery = delivery(3);
        let now = Utc::now();
        let policy = BackoffPolicy::new(StdDuration::from_secs(10), StdDuration::from_secs(60));
        delivery
            .mark_failed(now, &policy, DeliveryFailure::message("x"))
            .unwrap();

        assert!(!delivery.is_retry_due(now + Duration::seconds(9)));
        assert!(delivery.is_retry_due(now + Duration::seconds(10)));
        assert!(!delivery.is_new());
    }
}
