use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{CircuitBreaker, CircuitBreakerConfig};
use crate::time::Clock;
use crate::types::CircuitBreakerStats;

/// Owns at most one breaker per key. Built once in `main` and shared by `Arc`.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the breaker for `key`, creating it on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        if let Some(breaker) = breakers.get(key) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(
            key,
            self.config.clone(),
            Arc::clone(&self.clock),
        ));
        breakers.insert(key.to_string(), Arc::clone(&breaker));
        breaker
    }

    pub fn get_existing(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(key).cloned()
    }

    /// Stats for every known breaker, ordered by key.
    pub fn stats_all(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        let mut stats: Vec<CircuitBreakerStats> =
            breakers.iter().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Keys whose breaker would reject a call issued now.
    pub fn rejecting_keys(&self) -> Vec<String> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.lock().values().cloned().collect();
        breakers
            .iter()
            .filter(|breaker| !breaker.is_call_permitted())
            .map(|breaker| breaker.key().to_string())
            .collect()
    }

    /// Opens the breaker for `key`, creating it if it does not exist yet.
    pub fn force_open(&self, key: &str) -> CircuitBreakerStats {
        let breaker = self.get(key);
        breaker.force_open();
        breaker.stats()
    }

    pub fn force_close(&self, key: &str) -> Option<CircuitBreakerStats> {
        let breaker = self.get_existing(key)?;
        breaker.force_close();
        Some(breaker.stats())
    }

    pub fn reset(&self, key: &str) -> Option<CircuitBreakerStats> {
        let breaker = self.get_existing(key)?;
        breaker.reset();
        Some(breaker.stats())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
