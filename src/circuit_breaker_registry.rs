//! Registry for managing named circuit breakers.
//!
//! Independent call sites protecting the same logical dependency should share
//! one breaker per name so failure accounting is shared. The registry is an
//! explicit value owned by the application and passed where needed, not a
//! hidden global.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitConfigError,
};
use tracing::warn;

/// In-memory store of named breakers. Clones share the same underlying map.
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker registered under `name`, creating it from `config` on
    /// first use.
    ///
    /// An existing breaker wins and the supplied config is ignored, so every
    /// call site for a logical dependency observes the same instance.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, CircuitConfigError> {
        {
            let map = self.inner.read().expect("circuit breaker registry poisoned");
            if let Some(existing) = map.get(name) {
                return Ok(existing.clone());
            }
        }

        let mut map = self.inner.write().expect("circuit breaker registry poisoned");
        // Re-check under the write lock; another caller may have raced us here.
        if let Some(existing) = map.get(name) {
            return Ok(existing.clone());
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config)?);
        map.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Get a breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        map.get(name).cloned()
    }

    /// Register a pre-built breaker, overwriting any existing entry.
    ///
    /// Overwrite is deliberate: the last registration wins. Callers should
    /// normally use unique names per breaker and treat an overwrite as a
    /// replacement, not a merge of state.
    pub fn register(&self, breaker: Arc<CircuitBreaker>) {
        let mut map = self.inner.write().expect("circuit breaker registry poisoned");
        let name = breaker.name().to_string();
        if map.contains_key(&name) {
            warn!(target: "backstop::circuit_breaker_registry", name = %name, "circuit breaker name replaced; last registration wins");
        }
        map.insert(name, breaker);
    }

    /// Names currently registered, sorted for determinism.
    pub fn names(&self) -> Vec<String> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reset every registered breaker to Closed with zeroed counters.
    pub async fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset().await;
        }
    }

    /// Status of every registered breaker, sorted by name.
    pub async fn all_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses = Vec::new();
        for breaker in self.snapshot() {
            statuses.push(breaker.status().await);
        }
        statuses
    }

    // Clones out of the lock so callers can await without holding it.
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        let mut breakers: Vec<(String, Arc<CircuitBreaker>)> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        breakers.sort_by(|a, b| a.0.cmp(&b.0));
        breakers.into_iter().map(|(_, b)| b).collect()
    }
}
