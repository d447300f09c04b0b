//! # Circuit Breaker Registry
//!
//! Breaker state keyed by `(step id, scope)`. Breakers are looked up by stable id, so the
//! registry never holds on to the steps it protects.

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitState, SystemCircuitBreakerMetrics};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Identifies one breaker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakerKey {
    pub step_id: String,
    pub scope: String,
}

impl BreakerKey {
    pub fn new(step_id: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            scope: scope.into(),
        }
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.step_id, self.scope)
    }
}

/// Shared, explicitly constructed store of circuit breakers
#[derive(Debug, Default, Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<BreakerKey, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing breaker for the key, or a new one built from `config`.
    /// The configuration of an existing breaker is left untouched.
    pub fn get_or_create(
        &self,
        step_id: &str,
        scope: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let key = BreakerKey::new(step_id, scope);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(breaker = %key, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(key.to_string(), config))
            })
            .clone()
    }

    pub fn get(&self, step_id: &str, scope: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&BreakerKey::new(step_id, scope))
            .map(|entry| entry.value().clone())
    }

    pub fn state(&self, step_id: &str, scope: &str) -> Option<CircuitState> {
        self.get(step_id, scope).map(|breaker| breaker.state())
    }

    /// Drop a breaker; the next `get_or_create` starts closed
    pub fn remove(&self, step_id: &str, scope: &str) -> bool {
        self.breakers
            .remove(&BreakerKey::new(step_id, scope))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut breakers: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().metrics())
            .collect();
        breakers.sort_by(|a, b| a.name.cmp(&b.name));

        SystemCircuitBreakerMetrics {
            total_breakers: breakers.len(),
            open_breakers: breakers
                .iter()
                .filter(|m| m.current_state == CircuitState::Open)
                .count(),
            half_open_breakers: breakers
                .iter()
                .filter(|m| m.current_state == CircuitState::HalfOpen)
                .count(),
            breakers,
        }
    }
}
