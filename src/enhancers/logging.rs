use crate::error::OrchestrationResult;
use crate::logging::{self, LogContext, LogLevel, LogSink};
use crate::steps::{StepContext, StepExecutor, WorkflowStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for start and success records; failures always log at `Error`
    pub level: LogLevel,
    /// Include the input payload in the start record
    pub log_input: bool,
    /// Include the output payload in the success record
    pub log_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_input: false,
            log_output: false,
        }
    }
}

struct LoggingExecutor {
    inner: Arc<dyn StepExecutor>,
    config: LoggingConfig,
    sink: Option<Arc<dyn LogSink>>,
    step_id: String,
}

impl LoggingExecutor {
    fn base_context(&self, context: &StepContext) -> LogContext {
        let mut log_context = LogContext::new();
        log_context.insert("step_id".to_string(), json!(self.step_id));
        log_context.insert("workflow_id".to_string(), json!(context.workflow_id));
        log_context.insert("execution_id".to_string(), json!(context.execution_id));
        log_context.insert("attempt".to_string(), json!(context.attempt));
        log_context
    }
}

#[async_trait]
impl StepExecutor for LoggingExecutor {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        let mut start_context = self.base_context(context);
        if self.config.log_input {
            start_context.insert("input".to_string(), input.clone());
        }
        debug!(step_id = %self.step_id, attempt = context.attempt, "Step starting");
        logging::emit(self.sink.as_ref(), self.config.level, "step started", start_context);

        let started = Instant::now();
        let outcome = self.inner.execute(input, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut end_context = self.base_context(context);
        end_context.insert("duration_ms".to_string(), json!(duration_ms));
        match &outcome {
            Ok(output) => {
                info!(step_id = %self.step_id, duration_ms = duration_ms, "Step succeeded");
                if self.config.log_output {
                    end_context.insert("output".to_string(), output.clone());
                }
                logging::emit(self.sink.as_ref(), self.config.level, "step succeeded", end_context);
            }
            Err(error) => {
                warn!(step_id = %self.step_id, duration_ms = duration_ms, error = %error, "Step failed");
                end_context.insert("error".to_string(), error.to_json());
                logging::emit(self.sink.as_ref(), LogLevel::Error, "step failed", end_context);
            }
        }

        outcome
    }
}

/// Log start and outcome of every invocation through `tracing` and the optional sink
pub fn with_logging(
    step: &WorkflowStep,
    config: LoggingConfig,
    sink: Option<Arc<dyn LogSink>>,
) -> WorkflowStep {
    step.with_executor(Arc::new(LoggingExecutor {
        inner: step.executor(),
        config,
        sink,
        step_id: step.id().to_string(),
    }))
}
