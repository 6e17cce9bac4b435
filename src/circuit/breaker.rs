use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use chrono::{DateTime, Utc};

use super::{CircuitBreakerConfig, CircuitError};
use crate::time::{Clock, millis};
use crate::types::{CircuitBreakerStats, CircuitState};

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: DateTime<Utc>,
    success: bool,
    duration_ms: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_requests: u32,
    window_started_at: DateTime<Utc>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    outcomes: VecDeque<Outcome>,
}

impl BreakerState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            window_started_at: now,
            last_failure_time: None,
            last_success_time: None,
            next_attempt_time: None,
            probe_in_flight: false,
            outcomes: VecDeque::new(),
        }
    }

    fn reset_counters(&mut self, now: DateTime<Utc>) {
        self.failure_count = 0;
        self.success_count = 0;
        self.total_requests = 0;
        self.window_started_at = now;
    }
}

/// Circuit breaker guarding calls to one target.
///
/// State lives behind a synchronous mutex that is never held across the
/// guarded operation's `.await`.
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            key: key.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::new(now)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `op` under the breaker.
    ///
    /// An open breaker rejects with [`CircuitError::Open`] without invoking
    /// `op`. Once the recovery timeout has elapsed the first caller becomes
    /// the half-open probe and everyone else is rejected until it finishes.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let probe = self.admit()?;
        let _guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let started = Instant::now();
        let result = op().await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => self.on_success(duration_ms),
            Err(err) => self.on_failure(&err.to_string(), duration_ms),
        }

        result.map_err(CircuitError::Inner)
    }

    /// Whether a call issued now would be admitted. No side effects.
    pub fn is_call_permitted(&self) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.next_attempt_time.is_some_and(|at| now >= at),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.roll_window(&mut inner, now);

        let window_start = now - millis(self.config.monitoring_period);
        let recent: Vec<&Outcome> = inner
            .outcomes
            .iter()
            .filter(|outcome| outcome.at >= window_start)
            .collect();
        let failures = recent.iter().filter(|outcome| !outcome.success).count();
        let failure_rate = if recent.is_empty() {
            0.0
        } else {
            failures as f64 / recent.len() as f64
        };
        let average_duration_ms = if recent.is_empty() {
            None
        } else {
            let total: u64 = recent.iter().map(|outcome| outcome.duration_ms).sum();
            Some(total / recent.len() as u64)
        };

        CircuitBreakerStats {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            failure_rate,
            average_duration_ms,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            next_attempt_time: inner.next_attempt_time,
        }
    }

    pub fn force_open(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.open(&mut inner, now);
    }

    pub fn force_close(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.next_attempt_time = None;
        inner.probe_in_flight = false;
        inner.reset_counters(now);
        tracing::info!(circuit = %self.key, "circuit breaker force-closed");
    }

    pub fn reset(&self) {
        let now = self.clock.now();
        *self.lock() = BreakerState::new(now);
        tracing::info!(circuit = %self.key, "circuit breaker reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the admitted call is the half-open probe.
    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.roll_window(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => match inner.next_attempt_time {
                Some(at) if now >= at => {
                    inner.state = CircuitState::HalfOpen;
                    inner.next_attempt_time = None;
                    inner.probe_in_flight = true;
                    tracing::info!(circuit = %self.key, "circuit breaker half-open, probing");
                    Ok(true)
                }
                retry_at => Err(CircuitError::Open {
                    key: self.key.clone(),
                    retry_at,
                }),
            },
            CircuitState::HalfOpen if inner.probe_in_flight => Err(CircuitError::Open {
                key: self.key.clone(),
                retry_at: None,
            }),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self, duration_ms: u64) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.push_outcome(&mut inner, now, true, duration_ms);
        inner.success_count = inner.success_count.saturating_add(1);
        inner.total_requests = inner.total_requests.saturating_add(1);
        inner.last_success_time = Some(now);

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.probe_in_flight = false;
            inner.reset_counters(now);
            tracing::info!(circuit = %self.key, "circuit breaker closed after successful probe");
        }
    }

    fn on_failure(&self, message: &str, duration_ms: u64) {
        if self
            .config
            .expected_errors
            .iter()
            .any(|expected| message.contains(expected.as_str()))
        {
            tracing::debug!(circuit = %self.key, error = message, "expected error, not counted");
            return;
        }

        let now = self.clock.now();
        let mut inner = self.lock();
        self.push_outcome(&mut inner, now, false, duration_ms);
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.total_requests = inner.total_requests.saturating_add(1);
        inner.last_failure_time = Some(now);

        match inner.state {
            CircuitState::HalfOpen => self.open(&mut inner, now),
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.open(&mut inner, now);
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut BreakerState, now: DateTime<Utc>) {
        let next_attempt = now + millis(self.config.recovery_timeout);
        inner.state = CircuitState::Open;
        inner.next_attempt_time = Some(next_attempt);
        inner.probe_in_flight = false;
        tracing::warn!(
            circuit = %self.key,
            failures = inner.failure_count,
            next_attempt_time = %next_attempt,
            "circuit breaker opened"
        );
    }

    fn roll_window(&self, inner: &mut BreakerState, now: DateTime<Utc>) {
        if inner.state == CircuitState::Closed
            && now - inner.window_started_at >= millis(self.config.monitoring_period)
        {
            inner.reset_counters(now);
        }
    }

    fn push_outcome(
        &self,
        inner: &mut BreakerState,
        at: DateTime<Utc>,
        success: bool,
        duration_ms: u64,
    ) {
        if self.config.window_size == 0 {
            return;
        }
        while inner.outcomes.len() >= self.config.window_size {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(Outcome {
            at,
            success,
            duration_ms,
        });
    }
}

/// Frees the half-open probe slot if the guarded future is dropped mid-call.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }
}
