//! # Circuit Breaker Implementation
//!
//! Fault isolation for step execution with three states: Closed (normal operation),
//! Open (failing fast) and Half-Open (a single trial call testing recovery).
//!
//! All transitions are compare-and-swap on an atomic state byte, and the half-open trial
//! slot is claimed with a compare-and-swap on its own flag, so concurrent invocations of
//! the same protected step can never run two trials at once.

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - exactly one trial call is allowed
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

/// Admission granted for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Releases a claimed trial slot if the trial future is dropped before reporting
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Core circuit breaker implementation with atomic state management
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Breaker name for logging and metrics, typically `step_id:scope`
    name: String,

    state: AtomicU8,

    config: CircuitBreakerConfig,

    consecutive_failures: AtomicU32,

    trial_in_flight: AtomicBool,

    /// Time when circuit was opened (for reset timeout calculations)
    opened_at: Mutex<Option<Instant>>,

    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            consecutive_failures: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            opened_at: Mutex::new(None),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// While open, fails with `CIRCUIT_BREAKER_OPEN` without calling `operation`.
    pub async fn call<T, F, Fut>(&self, operation: F) -> OrchestrationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestrationResult<T>>,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = operation().await;
        guard.armed = false;

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(_) => self.record_success(admission),
            Err(err) => self.record_failure(admission, err),
        }
        result
    }

    fn admit(&self) -> OrchestrationResult<Admission> {
        match self.state() {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock();
                let elapsed = opened_at.map(|at| at.elapsed());
                match elapsed {
                    Some(elapsed) if elapsed >= self.config.reset_timeout => {
                        if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                            info!(component = %self.name, "🟡 Circuit breaker half-open (testing recovery)");
                        }
                        self.claim_trial()
                    }
                    _ => {
                        let retry_after = elapsed
                            .map(|elapsed| self.config.reset_timeout.saturating_sub(elapsed))
                            .unwrap_or(self.config.reset_timeout);
                        Err(self.reject(Some(retry_after)))
                    }
                }
            }
            CircuitState::HalfOpen => self.claim_trial(),
        }
    }

    fn claim_trial(&self) -> OrchestrationResult<Admission> {
        if self.state() == CircuitState::HalfOpen
            && self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(component = %self.name, "Trial call admitted");
            Ok(Admission::Trial)
        } else {
            Err(self.reject(None))
        }
    }

    fn reject(&self, retry_after: Option<std::time::Duration>) -> OrchestrationError {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
        debug!(component = %self.name, "Call rejected by open circuit");
        OrchestrationError::circuit_open(self.name.clone(), retry_after)
    }

    fn record_success(&self, admission: Admission) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        match admission {
            Admission::Trial => {
                self.consecutive_failures.store(0, Ordering::Release);
                if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    *self.opened_at.lock() = None;
                    info!(component = %self.name, "🟢 Circuit breaker closed (recovered)");
                }
                self.trial_in_flight.store(false, Ordering::Release);
            }
            Admission::Normal => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
        }
    }

    fn record_failure(&self, admission: Admission, err: &OrchestrationError) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        match admission {
            Admission::Trial => {
                *self.opened_at.lock() = Some(Instant::now());
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    warn!(component = %self.name, error = %err, "🔴 Trial call failed, circuit re-opened");
                }
                self.trial_in_flight.store(false, Ordering::Release);
            }
            Admission::Normal => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    *self.opened_at.lock() = Some(Instant::now());
                    error!(
                        component = %self.name,
                        consecutive_failures = failures,
                        failure_threshold = self.config.failure_threshold,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "🔴 Circuit breaker opened (failing fast)"
                    );
                }
            }
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        *self.opened_at.lock() = Some(Instant::now());
        self.state.store(CircuitState::Open as u8, Ordering::Release);
    }

    /// Force circuit to closed state and reset failure tracking
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        self.consecutive_failures.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        *self.opened_at.lock() = None;
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            name: self.name.clone(),
            current_state: self.state(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    async fn fail(circuit: &CircuitBreaker) -> OrchestrationResult<()> {
        circuit
            .call(|| async { Err(OrchestrationError::generic("boom")) })
            .await
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = breaker(3, 100);

        assert_eq!(circuit.state(), CircuitState::Closed);
        let result = circuit.call(|| async { Ok("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let circuit = breaker(2, 100);
        let _ = fail(&circuit).await;
        circuit.call(|| async { Ok(()) }).await.unwrap();
        let _ = fail(&circuit).await;

        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_without_calling() {
        let circuit = breaker(2, 1_000);
        let _ = fail(&circuit).await;
        let _ = fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitBreakerOpen);
        assert!(err.retry_after().is_some());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let circuit = Arc::new(breaker(1, 50));
        let _ = fail(&circuit).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let circuit = circuit.clone();
            tokio::spawn(async move {
                circuit
                    .call(move || async move {
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let concurrent = circuit.call(|| async { Ok(()) }).await;
        assert_eq!(concurrent.unwrap_err().code(), ErrorCode::CircuitBreakerOpen);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let circuit = breaker(1, 50);
        let _ = fail(&circuit).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let _ = fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let circuit = breaker(1, 50);
        let _ = fail(&circuit).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let pending = circuit.call(|| std::future::pending::<OrchestrationResult<()>>());
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;

        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let circuit = breaker(1, 1_000);

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
