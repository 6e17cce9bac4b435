use std::time::Duration;

use crate::types::Webhook;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(300_000);

/// Exponential backoff: `min(base * 2^(attempt - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Policy for a webhook whose `retry_delay_ms` is the base unit.
    pub fn for_webhook(webhook: &Webhook) -> Self {
        if webhook.retry_delay_ms == 0 {
            return Self::default();
        }
        Self::new(Duration::from_millis(webhook.retry_delay_ms), DEFAULT_MAX_DELAY)
    }

    /// Delay after the `attempt`-th failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_one_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn caps_at_five_minutes() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(256));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn nondecreasing_in_attempt() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
