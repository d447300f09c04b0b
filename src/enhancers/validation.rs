use crate::error::{OrchestrationError, OrchestrationResult};
use crate::steps::{StepContext, StepExecutor, StepSchema, WorkflowStep};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Schemas checked around the wrapped executor; either may be omitted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationConfig {
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

struct ValidationExecutor {
    inner: Arc<dyn StepExecutor>,
    input_schema: Option<StepSchema>,
    output_schema: Option<StepSchema>,
}

#[async_trait]
impl StepExecutor for ValidationExecutor {
    async fn execute(&self, input: Value, context: &StepContext) -> OrchestrationResult<Value> {
        if let Some(schema) = &self.input_schema {
            schema.validate(&input).map_err(|violation| {
                OrchestrationError::step_input_validation(violation.path, violation.errors)
            })?;
        }

        let output = self.inner.execute(input, context).await?;

        if let Some(schema) = &self.output_schema {
            schema.validate(&output).map_err(|violation| {
                OrchestrationError::step_output_validation(violation.path, violation.errors)
            })?;
        }

        Ok(output)
    }
}

/// Validate input before and output after the wrapped executor.
///
/// Schemas are compiled here, so a malformed schema fails immediately with
/// `INVALID_STEP_DEFINITION` instead of at execution time.
pub fn with_validation(step: &WorkflowStep, config: ValidationConfig) -> OrchestrationResult<WorkflowStep> {
    let compile = |raw: Option<Value>, label: &str| {
        raw.map(|raw| {
            StepSchema::compile(raw).map_err(|reason| {
                OrchestrationError::invalid_step_definition(vec![format!(
                    "{label} is not a valid JSON Schema: {reason}"
                )])
            })
        })
        .transpose()
    };

    Ok(step.with_executor(Arc::new(ValidationExecutor {
        inner: step.executor(),
        input_schema: compile(config.input_schema, "input_schema")?,
        output_schema: compile(config.output_schema, "output_schema")?,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::steps::{step_fn, StepDefinition, StepFactory};
    use serde_json::json;

    fn echo() -> WorkflowStep {
        StepFactory::new()
            .create_step(StepDefinition::new("echo"), step_fn(|input, _| async move { Ok(input) }))
            .unwrap()
    }

    #[tokio::test]
    async fn test_input_violation_reports_path() {
        let step = with_validation(
            &echo(),
            ValidationConfig {
                input_schema: Some(json!({
                    "type": "object",
                    "properties": {"email": {"type": "string", "format": "email"}, "count": {"type": "integer"}}
                })),
                output_schema: None,
            },
        )
        .unwrap();

        let result = step.execute(json!({"count": "three"}), "wf").await;

        match result.error {
            Some(OrchestrationError::WorkflowValidation { code, path, .. }) => {
                assert_eq!(code, ErrorCode::StepInputValidationError);
                assert_eq!(path.as_deref(), Some("/count"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_violation() {
        let step = with_validation(
            &echo(),
            ValidationConfig {
                input_schema: None,
                output_schema: Some(json!({"type": "array"})),
            },
        )
        .unwrap();

        let result = step.execute(json!({"not": "an array"}), "wf").await;
        assert_eq!(
            result.error.map(|e| e.code()),
            Some(ErrorCode::StepOutputValidationError)
        );
    }

    #[test]
    fn test_malformed_schema_rejected_upfront() {
        let error = with_validation(
            &echo(),
            ValidationConfig {
                input_schema: Some(json!({"type": 5})),
                output_schema: None,
            },
        )
        .unwrap_err();
        assert_eq!(error.code(), ErrorCode::InvalidStepDefinition);
    }
}
