use std::time::Duration;

use crate::circuit::CircuitBreakerConfig;

/// Lease time kept free after the longest permitted attempt.
pub const LEASE_HEADROOM: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub shutdown_timeout: Duration,
    /// How long a delivery may stay deferred behind an open breaker before it
    /// is failed instead. Defaults to the breaker monitoring period.
    pub starvation_threshold: Duration,
    pub health_interval: Duration,
    pub health_window: u32,
    pub health_min_samples: u32,
    /// Failure rate (0.0 to 1.0) above which the sweep disables a webhook.
    pub health_failure_threshold: f64,
    pub user_agent: String,
    pub circuit: CircuitBreakerConfig,
}

impl DispatcherConfig {
    /// Longest per-attempt timeout that still ends inside a freshly renewed
    /// lease. Headroom shrinks to half the lease for very short leases.
    pub fn max_attempt_timeout(&self) -> Duration {
        let headroom = LEASE_HEADROOM.min(self.lease_duration / 2);
        self.lease_duration.saturating_sub(headroom)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from `lookup`; unset or unparsable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let mut starvation_set = false;

        if let Some(value) = lookup("COURIER_WORKER_COUNT")
            && let Ok(parsed) = value.parse::<usize>()
        {
            config.worker_count = parsed.max(1);
        }
        if let Some(value) = lookup("COURIER_BATCH_SIZE")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.batch_size = parsed.max(1);
        }
        if let Some(value) = lookup("COURIER_POLL_INTERVAL_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.poll_interval = Duration::from_millis(parsed);
        }
        if let Some(value) = lookup("COURIER_LEASE_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.lease_duration = Duration::from_millis(parsed.max(1));
        }
        if let Some(value) = lookup("COURIER_SHUTDOWN_TIMEOUT_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.shutdown_timeout = Duration::from_millis(parsed);
        }
        if let Some(value) = lookup("COURIER_STARVATION_THRESHOLD_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.starvation_threshold = Duration::from_millis(parsed);
            starvation_set = true;
        }
        if let Some(value) = lookup("COURIER_HEALTH_INTERVAL_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.health_interval = Duration::from_millis(parsed.max(1));
        }
        if let Some(value) = lookup("COURIER_HEALTH_WINDOW")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.health_window = parsed.max(1);
        }
        if let Some(value) = lookup("COURIER_HEALTH_MIN_SAMPLES")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.health_min_samples = parsed.max(1);
        }
        if let Some(value) = lookup("COURIER_HEALTH_FAILURE_THRESHOLD")
            && let Ok(parsed) = value.parse::<f64>()
        {
            config.health_failure_threshold = parsed.clamp(0.0, 1.0);
        }
        if let Some(value) = lookup("COURIER_HTTP_USER_AGENT")
            && !value.trim().is_empty()
        {
            config.user_agent = value.trim().to_string();
        }

        if let Some(value) = lookup("COURIER_CIRCUIT_FAILURE_THRESHOLD")
            && let Ok(parsed) = value.parse::<u32>()
        {
            config.circuit.failure_threshold = parsed.max(1);
        }
        if let Some(value) = lookup("COURIER_CIRCUIT_RECOVERY_TIMEOUT_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.circuit.recovery_timeout = Duration::from_millis(parsed);
        }
        if let Some(value) = lookup("COURIER_CIRCUIT_MONITORING_PERIOD_MS")
            && let Ok(parsed) = value.parse::<u64>()
        {
            config.circuit.monitoring_period = Duration::from_millis(parsed.max(1));
        }
        if let Some(value) = lookup("COURIER_CIRCUIT_WINDOW_SIZE")
            && let Ok(parsed) = value.parse::<usize>()
        {
            config.circuit.window_size = parsed;
        }
        if let Some(value) = lookup("COURIER_CIRCUIT_EXPECTED_ERRORS") {
            config.circuit.expected_errors = value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }

        if !starvation_set {
            config.starvation_threshold = config.circuit.monitoring_period;
        }

        config
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let circuit = CircuitBreakerConfig::default();
        Self {
            worker_count: 4,
            batch_size: 10,
            poll_interval: Duration::from_millis(1_000),
            lease_duration: Duration::from_millis(60_000),
            shutdown_timeout: Duration::from_millis(30_000),
            starvation_threshold: circuit.monitoring_period,
            health_interval: Duration::from_millis(300_000),
            health_window: 50,
            health_min_samples: 10,
            health_failure_threshold: 0.9,
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            circuit,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> DispatcherConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        DispatcherConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = config_from(&[]);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.starvation_threshold, Duration::from_secs(120));
    }

    #[test]
    fn parses_overrides_and_ignores_garbage() {
        let config = config_from(&[
            ("COURIER_BATCH_SIZE", "25"),
            ("COURIER_WORKER_COUNT", "not-a-number"),
            ("COURIER_CIRCUIT_MONITORING_PERIOD_MS", "5000"),
            ("COURIER_CIRCUIT_EXPECTED_ERRORS", "HTTP 404, ,HTTP 410"),
            ("COURIER_HEALTH_FAILURE_THRESHOLD", "1.7"),
        ]);

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.circuit.monitoring_period, Duration::from_secs(5));
        assert_eq!(config.starvation_threshold, Duration::from_secs(5));
        assert_eq!(config.circuit.expected_errors, vec!["HTTP 404", "HTTP 410"]);
        assert!((config.health_failure_threshold - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn attempt_timeout_stays_inside_lease() {
        assert_eq!(config_from(&[]).max_attempt_timeout(), Duration::from_secs(50));

        let short = config_from(&[("COURIER_LEASE_MS", "4000")]);
        assert_eq!(short.max_attempt_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn explicit_starvation_threshold_wins() {
        let config = config_from(&[
            ("COURIER_CIRCUIT_MONITORING_PERIOD_MS", "5000"),
            ("COURIER_STARVATION_THRESHOLD_MS", "750"),
        ]);
        assert_eq!(config.starvation_threshold, Duration::from_millis(750));
    }
}
