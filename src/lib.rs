#![allow(clippy::doc_markdown)] // Allow technical terms like JSON Schema, SemVer in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Orchestration Core
//!
//! Building blocks for workflow orchestration engines.
//!
//! ## Overview
//!
//! The crate provides the pieces a workflow engine composes around its own execution model:
//! a validated catalog of reusable steps, composable behavior wrappers for those steps,
//! several scheduling strategies behind one facade, and an in-process event bus with
//! wildcard subscriptions. Everything reports failures through one error taxonomy with
//! stable machine-readable codes.
//!
//! ## Module Organization
//!
//! - [`steps`] - Step definitions, JSON Schema payload validation, the step factory
//! - [`registry`] - Step catalog with search, usage statistics, import and export
//! - [`enhancers`] - Retry, timeout, validation, metrics, circuit breaker and logging wrappers
//! - [`resilience`] - Circuit breaker state machine and the shared breaker registry
//! - [`scheduler`] - Cron, interval, priority, conditional and distributed scheduling
//! - [`events`] - Publish/subscribe with `*`/`**` topic patterns, bounded history and replay
//! - [`error`] - Error taxonomy and codes
//! - [`config`] - Layered TOML/environment configuration
//! - [`logging`] - Structured logging setup and the caller-supplied log sink seam
//!
//! ## Quick Start
//!
//! ```rust
//! use orchestration_core::enhancers::with_retry;
//! use orchestration_core::steps::{step_fn, RetryPolicy, StepDefinition, StepFactory};
//! use std::time::Duration;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let factory = StepFactory::new();
//! let step = factory
//!     .create_step(
//!         StepDefinition::new("greet"),
//!         step_fn(|input, _ctx| async move { Ok(json!({"hello": input["name"]})) }),
//!     )
//!     .unwrap();
//!
//! let step = with_retry(&step, RetryPolicy::fixed(3, Duration::from_millis(10)));
//! let result = step.execute(json!({"name": "ada"}), "wf-1").await;
//! assert!(result.success);
//! # });
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and doc tests
//! cargo bench --features benchmarks
//! ```

pub mod config;
pub mod constants;
pub mod enhancers;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod steps;
pub mod utils;

pub use config::{ConfigLoader, OrchestrationConfig};
pub use error::{ErrorCode, OrchestrationError, OrchestrationResult};
pub use events::{Event, EventBus, EventBusConfig};
pub use registry::StepRegistry;
pub use scheduler::{ScheduleDefinition, Scheduler, SchedulerConfig, TriggerSpec};
pub use steps::{StepDefinition, StepFactory, StepResult, WorkflowStep};
