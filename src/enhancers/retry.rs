use crate::error::OrchestrationResult;
use crate::steps::policy::run_with_retry;
use crate::steps::{RetryPolicy, StepContext, StepExecutor, WorkflowStep};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Retry enhancer configuration
pub type RetryConfig = RetryPolicy;

struct RetryExecutor {
    inner: Arc<dyn StepExecutor>,
    policy: RetryPolicy,
    step_id: String,
}

#[async_trait]
impl StepExecutor for RetryExecutor {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        let inner = &self.inner;
        let (outcome, _attempts) = run_with_retry(&self.policy, &self.step_id, |attempt| {
            let attempt_context = context.with_attempt(attempt);
            let input = input.clone();
            async move { inner.execute(input, &attempt_context).await }
        })
        .await;
        outcome
    }
}

/// Re-invoke the step on failure, up to `config.max_attempts` invocations in total
pub fn with_retry(step: &WorkflowStep, config: RetryConfig) -> WorkflowStep {
    step.with_executor(Arc::new(RetryExecutor {
        inner: step.executor(),
        policy: config,
        step_id: step.id().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::steps::{step_fn, StepDefinition, StepFactory};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let step = StepFactory::new()
            .create_step(
                StepDefinition::new("always-fails"),
                step_fn(move |_, ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Err(OrchestrationError::generic(format!("attempt {}", ctx.attempt))) }
                }),
            )
            .unwrap();

        let retried = with_retry(&step, RetryConfig::fixed(4, Duration::from_millis(10)));
        let result = retried.execute(json!({}), "wf").await;

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(result.error.unwrap().to_string().contains("attempt 4"));
        assert!(retried.shares_metadata_with(&step));
    }
}
