//! # Step Execution
//!
//! The executor seam ([`StepExecutor`]), the per-invocation [`StepContext`] and the
//! standard [`WorkflowStep`] that validates, executes and reports a step as a
//! [`StepResult`].
//!
//! Executor failures and panics never escape `WorkflowStep::execute`; they are captured
//! in the returned result with `success == false`.

use super::definition::StepMetadata;
use super::policy::run_with_retry;
use crate::error::{OrchestrationError, OrchestrationResult};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Identifiers and attempt number for one step invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepContext {
    pub workflow_id: String,
    pub execution_id: String,
    pub step_id: String,
    /// 1-based attempt counter, advanced by retrying wrappers
    pub attempt: u32,
    pub metadata: HashMap<String, Value>,
}

impl StepContext {
    pub fn new(workflow_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            attempt: 1,
            metadata: HashMap::new(),
        }
    }

    pub fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// The unit of work behind a step
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value>;
}

struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> StepExecutor for FnExecutor<F>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = OrchestrationResult<Value>> + Send + 'static,
{
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        (self.0)(input, context.clone()).await
    }
}

/// Adapt an async closure into a [`StepExecutor`]
///
/// ```rust
/// use orchestration_core::steps::step_fn;
/// use serde_json::json;
///
/// let executor = step_fn(|input, _ctx| async move { Ok(json!({"echo": input})) });
/// # let _ = executor;
/// ```
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepExecutor>
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OrchestrationResult<Value>> + Send + 'static,
{
    Arc::new(FnExecutor(f))
}

/// Timing captured for one execution
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepPerformance {
    /// Wall-clock duration in fractional milliseconds
    pub duration_ms: f64,
    /// Heap delta of the execution. The runtime offers no per-task allocation
    /// accounting, so this is always `None`.
    pub memory_delta_bytes: Option<i64>,
}

/// Outcome of `WorkflowStep::execute`
#[derive(Debug, Clone)]
pub struct StepResult {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<OrchestrationError>,
    pub performance: StepPerformance,
    pub attempts: u32,
}

impl StepResult {
    fn from_outcome(outcome: OrchestrationResult<Value>, attempts: u32, elapsed: Duration) -> Self {
        let performance = StepPerformance {
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            memory_delta_bytes: None,
        };
        match outcome {
            Ok(output) => Self {
                success: true,
                output: Some(output),
                error: None,
                performance,
                attempts,
            },
            Err(error) => Self {
                success: false,
                output: None,
                error: Some(error),
                performance,
                attempts,
            },
        }
    }

    /// Convert into a plain `Result`, dropping timing information
    pub fn into_result(self) -> OrchestrationResult<Value> {
        match (self.error, self.output) {
            (Some(error), _) => Err(error),
            (None, output) => Ok(output.unwrap_or(Value::Null)),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "output": self.output,
            "error": self.error.as_ref().map(OrchestrationError::to_json),
            "performance": self.performance,
            "attempts": self.attempts,
        })
    }
}

/// A created step: shared immutable metadata plus its executor
#[derive(Clone)]
pub struct WorkflowStep {
    metadata: Arc<StepMetadata>,
    executor: Arc<dyn StepExecutor>,
}

impl WorkflowStep {
    pub fn new(metadata: StepMetadata, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            metadata: Arc::new(metadata),
            executor,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    pub fn shared_metadata(&self) -> Arc<StepMetadata> {
        Arc::clone(&self.metadata)
    }

    pub fn executor(&self) -> Arc<dyn StepExecutor> {
        Arc::clone(&self.executor)
    }

    /// Same step (same metadata allocation) behind a different executor
    pub fn with_executor(&self, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            metadata: Arc::clone(&self.metadata),
            executor,
        }
    }

    /// Whether both handles share one metadata allocation
    pub fn shares_metadata_with(&self, other: &WorkflowStep) -> bool {
        Arc::ptr_eq(&self.metadata, &other.metadata)
    }

    /// Call the executor directly, bypassing validation and definition-level policies
    pub async fn invoke(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        self.executor.execute(input, context).await
    }

    /// Run the step for a workflow with a fresh execution context
    pub async fn execute(&self, input: Value, workflow_id: &str) -> StepResult {
        let context = StepContext::new(workflow_id, self.id());
        self.execute_with_context(input, context).await
    }

    /// Validate input, run the executor under the definition's retry and timeout
    /// policies, then validate output
    #[instrument(skip(self, input, context), fields(step_id = %self.metadata.id, workflow_id = %context.workflow_id))]
    pub async fn execute_with_context(&self, input: Value, context: StepContext) -> StepResult {
        let started = Instant::now();
        let (outcome, attempts) = self.run(input, &context).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => debug!(
                duration_ms = elapsed.as_millis() as u64,
                attempts = attempts,
                "Step completed"
            ),
            Err(error) => warn!(
                duration_ms = elapsed.as_millis() as u64,
                attempts = attempts,
                error_code = %error.code(),
                error = %error,
                "Step failed"
            ),
        }

        StepResult::from_outcome(outcome, attempts, elapsed)
    }

    async fn run(&self, input: Value, context: &StepContext) -> (OrchestrationResult<Value>, u32) {
        if let Some(schema) = &self.metadata.input_schema {
            if let Err(violation) = schema.validate(&input) {
                return (
                    Err(OrchestrationError::step_input_validation(
                        violation.path,
                        violation.errors,
                    )),
                    0,
                );
            }
        }

        let (outcome, attempts) = match &self.metadata.retry_policy {
            Some(policy) => {
                run_with_retry(policy, &self.metadata.id, |attempt| {
                    self.attempt(input.clone(), context.with_attempt(attempt))
                })
                .await
            }
            None => (self.attempt(input, context.clone()).await, 1),
        };

        let output = match outcome {
            Ok(output) => output,
            Err(error) => return (Err(error), attempts),
        };

        if let Some(schema) = &self.metadata.output_schema {
            if let Err(violation) = schema.validate(&output) {
                return (
                    Err(OrchestrationError::step_output_validation(
                        violation.path,
                        violation.errors,
                    )),
                    attempts,
                );
            }
        }

        (Ok(output), attempts)
    }

    async fn attempt(&self, input: Value, context: StepContext) -> OrchestrationResult<Value> {
        let guarded = AssertUnwindSafe(self.executor.execute(input, &context)).catch_unwind();
        let outcome = match self.metadata.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(OrchestrationError::step_timeout(self.id(), timeout)),
            },
            None => guarded.await,
        };

        outcome.unwrap_or_else(|_| {
            warn!(step_id = %self.id(), workflow_id = %context.workflow_id, "Step executor panicked");
            Err(OrchestrationError::workflow_execution(
                context.workflow_id.clone(),
                format!("step '{}' panicked", self.id()),
            ))
        })
    }
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("id", &self.metadata.id)
            .field("name", &self.metadata.name)
            .field("version", &self.metadata.version)
            .finish_non_exhaustive()
    }
}
