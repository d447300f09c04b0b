use crate::error::OrchestrationResult;
use crate::metrics::MetricsSink;
use crate::steps::{StepContext, StepExecutor, WorkflowStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// What the metrics enhancer records. Everything is collected by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub collect_duration: bool,
    pub collect_success: bool,
    pub collect_errors: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collect_duration: true,
            collect_success: true,
            collect_errors: true,
        }
    }
}

struct MetricsExecutor {
    inner: Arc<dyn StepExecutor>,
    config: MetricsConfig,
    sink: Arc<dyn MetricsSink>,
    step_id: String,
}

#[async_trait]
impl StepExecutor for MetricsExecutor {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        let started = Instant::now();
        let outcome = self.inner.execute(input, context).await;

        if self.config.collect_duration {
            self.sink.record_duration(&self.step_id, started.elapsed());
        }
        match &outcome {
            Ok(_) if self.config.collect_success => self.sink.record_success(&self.step_id),
            Err(error) if self.config.collect_errors => {
                self.sink.record_error(&self.step_id, error.code().as_str())
            }
            _ => {}
        }

        outcome
    }
}

/// Record timing and outcome into `sink` without altering the result
pub fn with_metrics(step: &WorkflowStep, config: MetricsConfig, sink: Arc<dyn MetricsSink>) -> WorkflowStep {
    step.with_executor(Arc::new(MetricsExecutor {
        inner: step.executor(),
        config,
        sink,
        step_id: step.id().to_string(),
    }))
}
