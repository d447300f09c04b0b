//! # Step Factory
//!
//! Validates [`StepDefinition`]s and turns them into [`WorkflowStep`]s. Construction is
//! pure: registering the step is a separate call on the registry.

use super::definition::{is_semver, StepDefinition, StepMetadata};
use super::execution::{StepExecutor, WorkflowStep};
use super::policy::RetryPolicy;
use super::schema::StepSchema;
use crate::config::StepSettings;
use crate::constants::defaults;
use crate::error::{OrchestrationError, OrchestrationResult};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Outcome of `StepFactory::validate_definition`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Creates validated, versioned steps
#[derive(Debug, Clone)]
pub struct StepFactory {
    default_category: String,
    default_version: String,
    default_timeout: Option<Duration>,
}

impl Default for StepFactory {
    fn default() -> Self {
        Self {
            default_category: defaults::STEP_CATEGORY.to_string(),
            default_version: defaults::STEP_VERSION.to_string(),
            default_timeout: None,
        }
    }
}

impl StepFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &StepSettings) -> Self {
        Self {
            default_category: settings.default_category.clone(),
            default_version: settings.default_version.clone(),
            default_timeout: settings.default_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Check required metadata, version format, policies and schema well-formedness
    /// without executing anything
    pub fn validate_definition(&self, definition: &StepDefinition) -> ValidationReport {
        let mut errors = Vec::new();

        if let Some(id) = &definition.id {
            if id.trim().is_empty() {
                errors.push("id must not be empty when provided".to_string());
            }
        }

        if definition.name.trim().is_empty() {
            errors.push("name is required".to_string());
        }

        match &definition.version {
            Some(version) if version.trim().is_empty() => {
                errors.push("version is required".to_string());
            }
            Some(version) if !is_semver(version) => {
                errors.push(format!("version '{version}' is not a semantic version"));
            }
            _ => {}
        }

        if let Some(category) = &definition.category {
            if category.trim().is_empty() {
                errors.push("category must not be empty when provided".to_string());
            }
        }

        if definition.tags.iter().any(|tag| tag.trim().is_empty()) {
            errors.push("tags must not contain empty values".to_string());
        }

        if definition.timeout == Some(Duration::ZERO) {
            errors.push("timeout must be greater than 0".to_string());
        }

        if let Some(policy) = &definition.retry_policy {
            if let Err(reason) = policy.validate() {
                errors.push(reason);
            }
        }

        for (label, schema) in [
            ("input_schema", &definition.input_schema),
            ("output_schema", &definition.output_schema),
        ] {
            if let Some(raw) = schema {
                if let Err(reason) = StepSchema::compile(raw.clone()) {
                    errors.push(format!("{label} is not a valid JSON Schema: {reason}"));
                }
            }
        }

        ValidationReport::from_errors(errors)
    }

    /// Validate the definition and build the step. Fails with `INVALID_STEP_DEFINITION`.
    pub fn create_step(
        &self,
        definition: StepDefinition,
        executor: Arc<dyn StepExecutor>,
    ) -> OrchestrationResult<WorkflowStep> {
        let report = self.validate_definition(&definition);
        if !report.valid {
            return Err(OrchestrationError::invalid_step_definition(report.errors));
        }

        let compile = |raw: Option<Value>| -> OrchestrationResult<Option<StepSchema>> {
            raw.map(|raw| {
                StepSchema::compile(raw)
                    .map_err(|reason| OrchestrationError::invalid_step_definition(vec![reason]))
            })
            .transpose()
        };

        let metadata = StepMetadata {
            id: definition
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: definition.name,
            version: definition
                .version
                .unwrap_or_else(|| self.default_version.clone()),
            category: definition
                .category
                .unwrap_or_else(|| self.default_category.clone()),
            tags: definition.tags.into_iter().collect(),
            description: definition.description,
            timeout: definition.timeout.or(self.default_timeout),
            retry_policy: definition.retry_policy,
            input_schema: compile(definition.input_schema)?,
            output_schema: compile(definition.output_schema)?,
        };

        debug!(
            step_id = %metadata.id,
            name = %metadata.name,
            version = %metadata.version,
            category = %metadata.category,
            "Step created"
        );

        Ok(WorkflowStep::new(metadata, executor))
    }

    /// Fluent construction starting from a step name
    pub fn builder(&self, name: impl Into<String>) -> StepBuilder<'_> {
        StepBuilder {
            factory: self,
            definition: StepDefinition::new(name),
        }
    }
}

/// Fluent [`StepDefinition`] construction bound to a factory
#[derive(Debug)]
pub struct StepBuilder<'a> {
    factory: &'a StepFactory,
    definition: StepDefinition,
}

impl StepBuilder<'_> {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.definition.id = Some(id.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.definition.version = Some(version.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.definition.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.definition.tags.push(tag.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.definition.retry_policy = Some(policy);
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.definition.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.definition.output_schema = Some(schema);
        self
    }

    pub fn definition(&self) -> &StepDefinition {
        &self.definition
    }

    pub fn build(self, executor: Arc<dyn StepExecutor>) -> OrchestrationResult<WorkflowStep> {
        self.factory.create_step(self.definition, executor)
    }
}
