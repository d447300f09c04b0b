//! # Step Enhancers
//!
//! Decorators that wrap a step's executor with cross-cutting behavior. Every enhancer
//! returns a new [`WorkflowStep`](crate::steps::WorkflowStep) that shares the original's
//! metadata allocation: ids and definitions never change, only execution does.
//!
//! ## Composition
//!
//! Enhancers nest. The one applied first sits closest to the executor:
//!
//! ```text
//! with_retry(with_timeout(step))   each retry attempt gets a fresh timeout
//! with_timeout(with_retry(step))   one timeout bounds all attempts together
//! ```
//!
//! ```rust
//! use orchestration_core::enhancers::{with_metrics, with_retry, with_timeout, MetricsConfig, RetryConfig, TimeoutConfig};
//! use orchestration_core::metrics::InMemoryMetrics;
//! use orchestration_core::steps::{step_fn, StepFactory};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let step = StepFactory::new()
//!     .builder("fetch")
//!     .id("fetch")
//!     .build(step_fn(|_, _| async { Ok(json!({"status": 200})) }))
//!     .unwrap();
//!
//! let metrics = InMemoryMetrics::new();
//! let enhanced = with_metrics(
//!     &with_retry(
//!         &with_timeout(&step, TimeoutConfig::new(Duration::from_secs(2))),
//!         RetryConfig::fixed(3, Duration::from_millis(100)),
//!     ),
//!     MetricsConfig::default(),
//!     Arc::new(metrics.clone()),
//! );
//!
//! assert_eq!(enhanced.id(), "fetch");
//! assert!(enhanced.execute(json!({}), "wf").await.success);
//! assert_eq!(metrics.snapshot("fetch").unwrap().successes, 1);
//! # });
//! ```

pub mod circuit_breaker;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod timeout;
pub mod validation;

pub use circuit_breaker::{with_circuit_breaker, DEFAULT_SCOPE};
pub use logging::{with_logging, LoggingConfig};
pub use metrics::{with_metrics, MetricsConfig};
pub use retry::{with_retry, RetryConfig};
pub use timeout::{with_timeout, TimeoutConfig};
pub use validation::{with_validation, ValidationConfig};
