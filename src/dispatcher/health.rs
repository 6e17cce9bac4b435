use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::{DispatchError, Dispatcher};
use crate::store::StoreError;
use crate::types::{DeliveryAttemptLog, HealthMetrics, WebhookStatus};

impl Dispatcher {
    /// Disables active webhooks whose recent failure rate is over the
    /// configured threshold and cancels their pending deliveries.
    pub async fn run_health_sweep(&self) -> Result<Vec<Uuid>, DispatchError> {
        let webhooks = self.webhooks.list_active().await?;
        let mut disabled = Vec::new();

        for webhook in webhooks {
            let attempts = match self
                .deliveries
                .recent_attempts(webhook.id, self.config.health_window)
                .await
            {
                Ok(attempts) => attempts,
                Err(err) => {
                    warn!(webhook_id = %webhook.id, error = %err, "health sweep skipped webhook");
                    continue;
                }
            };

            if attempts.len() < self.config.health_min_samples as usize {
                continue;
            }

            let failures = attempts.iter().filter(|attempt| !attempt.success).count();
            let failure_rate = failures as f64 / attempts.len() as f64;
            if failure_rate <= self.config.health_failure_threshold {
                continue;
            }

            let cancelled = self
                .set_webhook_status(webhook.id, WebhookStatus::Disabled)
                .await?;

            warn!(
                webhook_id = %webhook.id,
                failure_rate,
                samples = attempts.len(),
                cancelled,
                "webhook disabled by health sweep"
            );
            disabled.push(webhook.id);
        }

        info!(disabled = disabled.len(), "health sweep finished");
        Ok(disabled)
    }

    pub async fn health_metrics(&self, webhook_id: Uuid) -> Result<HealthMetrics, DispatchError> {
        if self.webhooks.get_webhook(webhook_id).await?.is_none() {
            return Err(StoreError::NotFound("webhook not found".to_string()).into());
        }
        let attempts = self
            .deliveries
            .recent_attempts(webhook_id, self.config.health_window)
            .await?;
        Ok(compute_health(webhook_id, &attempts, self.clock.now()))
    }
}

/// Health over `attempts`, newest first. The response-time average only
/// counts attempts finished in the trailing 24 hours.
pub fn compute_health(
    webhook_id: Uuid,
    attempts: &[DeliveryAttemptLog],
    now: DateTime<Utc>,
) -> HealthMetrics {
    let sample_size = attempts.len();
    let successes = attempts.iter().filter(|attempt| attempt.success).count();
    let recent_success_rate = if sample_size == 0 {
        1.0
    } else {
        successes as f64 / sample_size as f64
    };

    let day_ago = now - Duration::hours(24);
    let durations: Vec<u64> = attempts
        .iter()
        .filter(|attempt| attempt.finished_at >= day_ago)
        .map(|attempt| attempt.duration_ms)
        .collect();
    let average_response_time_ms = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
    };

    let consecutive_failures = attempts
        .iter()
        .take_while(|attempt| !attempt.success)
        .count();

    HealthMetrics {
        webhook_id,
        recent_success_rate,
        sample_size: u32::try_from(sample_size).unwrap_or(u32::MAX),
        average_response_time_ms,
        consecutive_failures: u32::try_from(consecutive_failures).unwrap_or(u32::MAX),
        last_success_at: attempts
            .iter()
            .find(|attempt| attempt.success)
            .map(|attempt| attempt.finished_at),
        last_failure_at: attempts
            .iter()
            .find(|attempt| !attempt.success)
            .map(|attempt| attempt.finished_at),
    }
}
