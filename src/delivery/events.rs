//! Domain events emitted by delivery transitions.
//!
//! Publishing is fire-and-forget: a lagging or absent subscriber never fails
//! the transition that produced the event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DeliveryEvent {
    #[serde(rename = "delivery.created")]
    Created {
        delivery_id: Uuid,
        webhook_id: Uuid,
        workspace_id: Uuid,
        event: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "delivery.succeeded")]
    Succeeded {
        delivery_id: Uuid,
        webhook_id: Uuid,
        http_status_code: u16,
        attempt_count: u32,
        at: DateTime<Utc>,
    },
    #[serde(rename = "delivery.failed")]
    Failed {
        delivery_id: Uuid,
        webhook_id: Uuid,
        attempt_count: u32,
        http_status_code: Option<u16>,
        error_message: String,
        will_retry: bool,
        at: DateTime<Utc>,
    },
    #[serde(rename = "delivery.retry_scheduled")]
    RetryScheduled {
        delivery_id: Uuid,
        webhook_id: Uuid,
        attempt_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    #[serde(rename = "delivery.cancelled")]
    Cancelled {
        delivery_id: Uuid,
        webhook_id: Uuid,
        at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "delivery.created",
            Self::Succeeded { .. } => "delivery.succeeded",
            Self::Failed { .. } => "delivery.failed",
            Self::RetryScheduled { .. } => "delivery.retry_scheduled",
            Self::Cancelled { .. } => "delivery.cancelled",
        }
    }

    pub fn delivery_id(&self) -> Uuid {
        match self {
            Self::Created { delivery_id, .. }
            | Self::Succeeded { delivery_id, .. }
            | Self::Failed { delivery_id, .. }
            | Self::RetryScheduled { delivery_id, .. }
            | Self::Cancelled { delivery_id, .. } => *delivery_id,
        }
    }
}

/// Broadcasts delivery events to downstream consumers (health, UI, audit).
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    pub fn publish<I>(&self, events: I)
    where
        I: IntoIterator<Item = DeliveryEvent>,
    {
        for event in events {
            tracing::debug!(
                event = event.name(),
                delivery_id = %event.delivery_id(),
                "delivery event"
            );
            // No receivers is fine.
            let _ = self.sender.send(event);
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
