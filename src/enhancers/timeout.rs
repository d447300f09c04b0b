use crate::error::{OrchestrationError, OrchestrationResult};
use crate::steps::{StepContext, StepExecutor, WorkflowStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub timeout: Duration,
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

struct TimeoutExecutor {
    inner: Arc<dyn StepExecutor>,
    timeout: Duration,
    step_id: String,
}

#[async_trait]
impl StepExecutor for TimeoutExecutor {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        match tokio::time::timeout(self.timeout, self.inner.execute(input, context)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    step_id = %self.step_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Step timed out"
                );
                Err(OrchestrationError::step_timeout(&self.step_id, self.timeout))
            }
        }
    }
}

/// Fail with `STEP_TIMEOUT_ERROR` when the step does not finish within `config.timeout`.
///
/// Expiry drops the executor future, which stops it at its next suspension point.
/// Work the executor handed off elsewhere (spawned tasks, blocking threads, remote
/// calls already in flight) keeps running; executors that need hard cancellation must
/// check for it cooperatively.
pub fn with_timeout(step: &WorkflowStep, config: TimeoutConfig) -> WorkflowStep {
    step.with_executor(Arc::new(TimeoutExecutor {
        inner: step.executor(),
        timeout: config.timeout,
        step_id: step.id().to_string(),
    }))
}
