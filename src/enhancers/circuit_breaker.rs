use crate::error::OrchestrationResult;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::steps::{StepContext, StepExecutor, WorkflowStep};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Scope used when callers do not partition breakers
pub const DEFAULT_SCOPE: &str = "default";

struct CircuitBreakerExecutor {
    inner: Arc<dyn StepExecutor>,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait]
impl StepExecutor for CircuitBreakerExecutor {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        self.breaker
            .call(|| self.inner.execute(input, context))
            .await
    }
}

/// Guard the step with the breaker registered for `(step id, scope)`.
///
/// Every step wrapped with the same id and scope shares one breaker. The breaker is
/// created with `config` on first use; later wrappers reuse it as is.
pub fn with_circuit_breaker(
    step: &WorkflowStep,
    config: CircuitBreakerConfig,
    scope: &str,
    breakers: &CircuitBreakerRegistry,
) -> WorkflowStep {
    let breaker = breakers.get_or_create(step.id(), scope, config);
    step.with_executor(Arc::new(CircuitBreakerExecutor {
        inner: step.executor(),
        breaker,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, OrchestrationError};
    use crate::resilience::CircuitState;
    use crate::steps::{step_fn, StepDefinition, StepFactory};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wrappers_with_same_scope_share_state() {
        let breakers = CircuitBreakerRegistry::new();
        let step = StepFactory::new()
            .create_step(
                StepDefinition {
                    id: Some("shared".to_string()),
                    ..StepDefinition::new("shared")
                },
                step_fn(|_, _| async { Err(OrchestrationError::generic("down")) }),
            )
            .unwrap();
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        };

        let first = with_circuit_breaker(&step, config, DEFAULT_SCOPE, &breakers);
        let second = with_circuit_breaker(&step, config, DEFAULT_SCOPE, &breakers);
        let isolated = with_circuit_breaker(&step, config, "tenant-b", &breakers);

        first.execute(json!({}), "wf").await;
        second.execute(json!({}), "wf").await;

        assert_eq!(breakers.state("shared", DEFAULT_SCOPE), Some(CircuitState::Open));
        assert_eq!(breakers.state("shared", "tenant-b"), Some(CircuitState::Closed));
        let rejected = first.execute(json!({}), "wf").await;
        assert_eq!(
            rejected.error.map(|e| e.code()),
            Some(ErrorCode::CircuitBreakerOpen)
        );
        assert!(!isolated.execute(json!({}), "wf").await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_executor_until_reset() {
        let breakers = CircuitBreakerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let step = StepFactory::new()
            .create_step(
                StepDefinition::new("guarded"),
                step_fn(move |_, _| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 3 {
                            Err(OrchestrationError::generic("down"))
                        } else {
                            Ok(json!("up"))
                        }
                    }
                }),
            )
            .unwrap();
        let guarded = with_circuit_breaker(
            &step,
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_millis(500),
            },
            DEFAULT_SCOPE,
            &breakers,
        );

        for _ in 0..3 {
            guarded.execute(json!({}), "wf").await;
        }
        for _ in 0..5 {
            let result = guarded.execute(json!({}), "wf").await;
            assert_eq!(result.error.map(|e| e.code()), Some(ErrorCode::CircuitBreakerOpen));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_millis(501)).await;
        let trial = guarded.execute(json!({}), "wf").await;

        assert!(trial.success);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(breakers.state(step.id(), DEFAULT_SCOPE), Some(CircuitState::Closed));
    }
}
