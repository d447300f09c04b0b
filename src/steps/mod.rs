//! # Steps
//!
//! Validated, versioned units of work. A [`StepFactory`] turns a [`StepDefinition`] plus a
//! [`StepExecutor`] into a [`WorkflowStep`], whose metadata is immutable and shared by
//! every enhancer wrapped around it.
//!
//! ```rust
//! use orchestration_core::steps::{step_fn, StepFactory};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let step = StepFactory::new()
//!     .builder("greet")
//!     .category("demo")
//!     .build(step_fn(|input, _ctx| async move {
//!         Ok(json!({"greeting": format!("hello {}", input["name"].as_str().unwrap_or("world"))}))
//!     }))
//!     .unwrap();
//!
//! let result = step.execute(json!({"name": "ada"}), "workflow-1").await;
//! assert!(result.success);
//! # });
//! ```

pub mod definition;
pub mod execution;
pub mod factory;
pub mod policy;
pub mod schema;

pub use definition::{is_semver, StepDefinition, StepMetadata};
pub use execution::{step_fn, StepContext, StepExecutor, StepPerformance, StepResult, WorkflowStep};
pub use factory::{StepBuilder, StepFactory, ValidationReport};
pub use policy::{BackoffStrategy, RetryPolicy};
pub use schema::{SchemaViolation, StepSchema};
