//! Registry of named circuit breakers.
//!
//! Breakers are created lazily on first lookup. The map lock guards only
//! lookup and insertion, so traffic through different breakers never
//! contends on it.

use crate::core::error::CircuitOpenError;
use crate::core::Result;
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatistics,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Owns every breaker in the process.
///
/// Build one at startup and pass it to whoever needs it.
pub struct CircuitBreakerRegistry {
    /// Registered breakers
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    /// Configuration for breakers created through [`get`](Self::get)
    defaults: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Create a registry with the given defaults.
    pub fn new(defaults: CircuitBreakerConfig) -> Result<Self> {
        defaults.validate()?;
        Ok(Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
        })
    }

    /// Get a breaker, creating it with the registry defaults if needed.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(breaker = %name, "creating circuit breaker");
            // Defaults were validated in `new`
            Arc::new(CircuitBreaker::with_validated(name, self.defaults.clone()))
        });
        Arc::clone(breaker)
    }

    /// Get a breaker, creating it with `config` if needed.
    ///
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Ok(Arc::clone(breaker));
        }

        config.validate()?;
        let mut breakers = self.breakers.write();
        let breaker = breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_validated(name, config)));
        Ok(Arc::clone(breaker))
    }

    /// Run `op` through the named breaker.
    pub async fn execute<F, Fut, T, E>(&self, name: &str, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let breaker = self.get(name);
        breaker.execute(op).await
    }

    /// Remove a breaker. Returns it if it existed.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(name)
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    /// Open every breaker (emergency stop).
    pub fn trip_all(&self) {
        tracing::warn!("tripping all circuit breakers");
        for breaker in self.snapshot() {
            breaker.trip();
        }
    }

    /// Statistics for every breaker, keyed by name.
    pub fn all_statistics(&self) -> HashMap<String, CircuitBreakerStatistics> {
        self.snapshot()
            .into_iter()
            .map(|b| (b.name().to_string(), b.statistics()))
            .collect()
    }

    /// Names of registered breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Clone the breaker handles so the map lock is not held while they are used.
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults: CircuitBreakerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::resilience::circuit_breaker::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_get_creates_breaker() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.is_empty());

        let breaker = registry.get("payments");
        assert_eq!(breaker.name(), "payments");
        assert_eq!(breaker.config().failure_threshold, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("db");
        let b = registry.get("db");
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure();
        assert_eq!(b.failure_count(), 1);
    }

    #[test]
    fn test_get_or_create_with_override() {
        let registry = CircuitBreakerRegistry::default();
        let custom = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(5),
            half_open_trial_count: 1,
        };
        let breaker = registry.get_or_create_with("search", custom).unwrap();
        assert_eq!(breaker.config().failure_threshold, 2);

        // Existing breaker keeps its configuration
        let again = registry
            .get_or_create_with("search", CircuitBreakerConfig::default())
            .unwrap();
        assert_eq!(again.config().failure_threshold, 2);
    }

    #[test]
    fn test_reset_all_and_trip_all() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        })
        .unwrap();

        registry.get("a").record_failure();
        registry.get("b").record_failure();
        assert_eq!(registry.get("a").state(), CircuitState::Open);

        registry.reset_all();
        assert!(registry.get("a").is_closed());
        assert!(registry.get("b").is_closed());

        registry.trip_all();
        assert!(registry.get("a").is_open());
        assert!(registry.get("b").is_open());
    }

    #[test]
    fn test_all_statistics() {
        let registry = CircuitBreakerRegistry::default();
        registry.get("a").record_success();
        registry.get("b").record_failure();

        let stats = registry.all_statistics();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["a"].total_successes, 1);
        assert_eq!(stats["b"].total_failures, 1);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_through_registry() {
        let registry = CircuitBreakerRegistry::default();
        let value: std::result::Result<&str, Error> =
            registry.execute("echo", || async { Ok("pong") }).await;
        assert_eq!(value.unwrap(), "pong");
        assert_eq!(registry.get("echo").statistics().total_successes, 1);
    }

    #[test]
    fn test_concurrent_get_creates_once() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("shared"))
            })
            .collect();

        let breakers: Vec<Arc<CircuitBreaker>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = CircuitBreakerRegistry::default();
        registry.get("gone");
        assert!(registry.remove("gone").is_some());
        assert!(registry.remove("gone").is_none());
        assert!(registry.is_empty());
    }
}
