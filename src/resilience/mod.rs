//! # Resilience Module
//!
//! Circuit breakers that isolate failing steps.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: Closed / Open / Half-Open state machine with atomic transitions
//! - **Registry**: Breakers keyed by `(step id, scope)`, shared by every enhanced step
//! - **Metrics**: Per-breaker counters and a system-wide summary
//!
//! ## Usage
//!
//! ```rust
//! use orchestration_core::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let breakers = CircuitBreakerRegistry::new();
//! let breaker = breakers.get_or_create(
//!     "charge-card",
//!     "default",
//!     CircuitBreakerConfig {
//!         failure_threshold: 5,
//!         reset_timeout: Duration::from_secs(30),
//!     },
//! );
//!
//! let result = breaker.call(|| async { Ok::<_, orchestration_core::OrchestrationError>("charged") }).await;
//! assert!(result.is_ok());
//! # });
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::CircuitBreakerConfig;
pub use manager::{BreakerKey, CircuitBreakerRegistry};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
