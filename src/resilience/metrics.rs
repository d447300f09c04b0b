//! Circuit breaker metrics snapshots.

use super::CircuitState;
use serde::Serialize;

/// Point-in-time counters for one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub current_state: CircuitState,
    /// Calls that reached the protected operation
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls failed fast without reaching the operation
    pub rejected_count: u64,
    pub consecutive_failures: u32,
}

impl CircuitBreakerMetrics {
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_calls as f64
        }
    }
}

/// Aggregate view over every breaker in a registry
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemCircuitBreakerMetrics {
    pub total_breakers: usize,
    pub open_breakers: usize,
    pub half_open_breakers: usize,
    pub breakers: Vec<CircuitBreakerMetrics>,
}
