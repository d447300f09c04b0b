//! # Orchestration Error Taxonomy
//!
//! Typed error hierarchy shared by every orchestration component. Each variant carries a
//! machine-readable [`ErrorCode`] from a closed set, a retryable flag and a free-form
//! context map. Errors are plain values: they are constructed where the failure happens
//! and moved up the call stack.
//!
//! ## Retry defaults
//!
//! | Code family                                   | Retryable |
//! |-----------------------------------------------|-----------|
//! | `ORCHESTRATION_ERROR`                         | no        |
//! | `PROVIDER_*`                                  | yes       |
//! | `WORKFLOW_EXECUTION_ERROR`                    | yes       |
//! | `*_VALIDATION_ERROR`                          | no        |
//! | `STEP_TIMEOUT_ERROR` / `OPERATION_TIMEOUT`    | no        |
//! | `CIRCUIT_BREAKER_OPEN`                        | yes       |
//! | `RATE_LIMIT_EXCEEDED`                         | yes       |
//! | registry misuse (`DUPLICATE_STEP`, ...)       | no        |

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Free-form structured context attached to every error
pub type ErrorContext = HashMap<String, Value>;

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Closed set of machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    OrchestrationError,
    ProviderError,
    ProviderNotFound,
    ProviderUnhealthy,
    WorkflowExecutionError,
    WorkflowValidationError,
    StepInputValidationError,
    StepOutputValidationError,
    StepTimeoutError,
    OperationTimeout,
    CircuitBreakerOpen,
    RateLimitExceeded,
    DuplicateStep,
    StepNotFound,
    InvalidStepRegistration,
    InvalidStepDefinition,
    ConfigurationError,
    ScheduleNotFound,
    InvalidSchedule,
    InvalidStateTransition,
    LockError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrchestrationError => "ORCHESTRATION_ERROR",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::ProviderUnhealthy => "PROVIDER_UNHEALTHY",
            Self::WorkflowExecutionError => "WORKFLOW_EXECUTION_ERROR",
            Self::WorkflowValidationError => "WORKFLOW_VALIDATION_ERROR",
            Self::StepInputValidationError => "STEP_INPUT_VALIDATION_ERROR",
            Self::StepOutputValidationError => "STEP_OUTPUT_VALIDATION_ERROR",
            Self::StepTimeoutError => "STEP_TIMEOUT_ERROR",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::DuplicateStep => "DUPLICATE_STEP",
            Self::StepNotFound => "STEP_NOT_FOUND",
            Self::InvalidStepRegistration => "INVALID_STEP_REGISTRATION",
            Self::InvalidStepDefinition => "INVALID_STEP_DEFINITION",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::ScheduleNotFound => "SCHEDULE_NOT_FOUND",
            Self::InvalidSchedule => "INVALID_SCHEDULE",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::LockError => "LOCK_ERROR",
        }
    }

    /// Whether errors carrying this code are retryable unless overridden at the throw site
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderError
                | Self::ProviderNotFound
                | Self::ProviderUnhealthy
                | Self::WorkflowExecutionError
                | Self::CircuitBreakerOpen
                | Self::RateLimitExceeded
                | Self::LockError
        )
    }

    /// Registry and definition misuse. These are programmer errors, never transient.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStep
                | Self::StepNotFound
                | Self::InvalidStepRegistration
                | Self::InvalidStepDefinition
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by orchestration components
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    /// Generic or registry-level failure
    #[error("[{code}] {message}")]
    Orchestration {
        code: ErrorCode,
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    /// External provider failure
    #[error("[{code}] provider '{provider}': {message}")]
    Provider {
        code: ErrorCode,
        provider: String,
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    /// Failure while running a workflow or one of its steps
    #[error("[WORKFLOW_EXECUTION_ERROR] workflow '{workflow_id}': {message}")]
    WorkflowExecution {
        workflow_id: String,
        execution_id: Option<String>,
        step_id: Option<String>,
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    /// Schema or shape violation
    #[error("[{code}] {message}")]
    WorkflowValidation {
        code: ErrorCode,
        message: String,
        path: Option<String>,
        errors: Vec<String>,
        context: ErrorContext,
    },

    /// Fast-fail while a breaker is open
    #[error("[CIRCUIT_BREAKER_OPEN] circuit breaker '{name}' is open")]
    CircuitBreaker {
        name: String,
        retry_after_ms: Option<u64>,
        context: ErrorContext,
    },

    /// Caller exceeded a rate limit
    #[error("[RATE_LIMIT_EXCEEDED] limit of {limit} per {window_ms}ms exceeded")]
    RateLimit {
        limit: u64,
        window_ms: u64,
        retry_after_ms: Option<u64>,
        context: ErrorContext,
    },

    /// Time budget exceeded
    #[error("[{code}] {operation} timed out after {timeout_ms}ms")]
    Timeout {
        code: ErrorCode,
        operation: String,
        timeout_ms: u64,
        context: ErrorContext,
    },

    /// Invalid or missing configuration
    #[error("[CONFIGURATION_ERROR] {message}")]
    Configuration {
        message: String,
        context: ErrorContext,
    },
}

impl OrchestrationError {
    /// Generic error with the given code and the code's default retryability
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Orchestration {
            code,
            message: message.into(),
            retryable: code.default_retryable(),
            context: ErrorContext::new(),
        }
    }

    /// Uncategorized failure, typically raised by an executor
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OrchestrationError, message)
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            code: ErrorCode::ProviderError,
            provider: provider.into(),
            message: message.into(),
            retryable: true,
            context: ErrorContext::new(),
        }
    }

    pub fn provider_not_found(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::Provider {
            code: ErrorCode::ProviderNotFound,
            message: format!("provider '{provider}' is not registered"),
            provider,
            retryable: true,
            context: ErrorContext::new(),
        }
    }

    pub fn provider_unhealthy(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            code: ErrorCode::ProviderUnhealthy,
            provider: provider.into(),
            message: message.into(),
            retryable: true,
            context: ErrorContext::new(),
        }
    }

    pub fn workflow_execution(workflow_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkflowExecution {
            workflow_id: workflow_id.into(),
            execution_id: None,
            step_id: None,
            message: message.into(),
            retryable: true,
            context: ErrorContext::new(),
        }
    }

    pub fn workflow_validation(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self::WorkflowValidation {
            code: ErrorCode::WorkflowValidationError,
            message: message.into(),
            path: None,
            errors,
            context: ErrorContext::new(),
        }
    }

    pub fn step_input_validation(path: impl Into<String>, errors: Vec<String>) -> Self {
        let path = path.into();
        Self::WorkflowValidation {
            code: ErrorCode::StepInputValidationError,
            message: format!("step input failed validation at '{path}'"),
            path: Some(path),
            errors,
            context: ErrorContext::new(),
        }
    }

    pub fn step_output_validation(path: impl Into<String>, errors: Vec<String>) -> Self {
        let path = path.into();
        Self::WorkflowValidation {
            code: ErrorCode::StepOutputValidationError,
            message: format!("step output failed validation at '{path}'"),
            path: Some(path),
            errors,
            context: ErrorContext::new(),
        }
    }

    pub fn step_timeout(step_id: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            code: ErrorCode::StepTimeoutError,
            operation: format!("step '{}'", step_id.into()),
            timeout_ms: timeout.as_millis() as u64,
            context: ErrorContext::new(),
        }
    }

    pub fn operation_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            code: ErrorCode::OperationTimeout,
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
            context: ErrorContext::new(),
        }
    }

    pub fn circuit_open(name: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::CircuitBreaker {
            name: name.into(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            context: ErrorContext::new(),
        }
    }

    pub fn rate_limited(limit: u64, window: Duration, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            limit,
            window_ms: window.as_millis() as u64,
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn duplicate_step(step_id: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateStep,
            format!("step '{step_id}' is already registered"),
        )
        .with_context("step_id", json!(step_id))
    }

    pub fn step_not_found(step_id: &str) -> Self {
        Self::new(ErrorCode::StepNotFound, format!("step '{step_id}' not found"))
            .with_context("step_id", json!(step_id))
    }

    pub fn invalid_step_registration(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidStepRegistration, reason)
    }

    pub fn invalid_step_definition(errors: Vec<String>) -> Self {
        Self::new(
            ErrorCode::InvalidStepDefinition,
            format!("invalid step definition: {}", errors.join("; ")),
        )
        .with_context("errors", json!(errors))
    }

    pub fn schedule_not_found(schedule_id: &str) -> Self {
        Self::new(
            ErrorCode::ScheduleNotFound,
            format!("schedule '{schedule_id}' not found"),
        )
        .with_context("schedule_id", json!(schedule_id))
    }

    pub fn invalid_schedule(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSchedule, reason)
    }

    pub fn invalid_transition(entity: &str, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("{entity} cannot transition from {from} to {to}"),
        )
    }

    pub fn lock(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::LockError, reason)
    }

    /// Machine-readable code
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Orchestration { code, .. }
            | Self::Provider { code, .. }
            | Self::WorkflowValidation { code, .. }
            | Self::Timeout { code, .. } => *code,
            Self::WorkflowExecution { .. } => ErrorCode::WorkflowExecutionError,
            Self::CircuitBreaker { .. } => ErrorCode::CircuitBreakerOpen,
            Self::RateLimit { .. } => ErrorCode::RateLimitExceeded,
            Self::Configuration { .. } => ErrorCode::ConfigurationError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Orchestration { retryable, .. }
            | Self::Provider { retryable, .. }
            | Self::WorkflowExecution { retryable, .. } => *retryable,
            Self::CircuitBreaker { .. } | Self::RateLimit { .. } => true,
            Self::WorkflowValidation { .. } | Self::Timeout { .. } | Self::Configuration { .. } => {
                false
            }
        }
    }

    /// Server- or breaker-requested wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreaker { retry_after_ms, .. } | Self::RateLimit { retry_after_ms, .. } => {
                retry_after_ms.map(Duration::from_millis)
            }
            _ => None,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Orchestration { context, .. }
            | Self::Provider { context, .. }
            | Self::WorkflowExecution { context, .. }
            | Self::WorkflowValidation { context, .. }
            | Self::CircuitBreaker { context, .. }
            | Self::RateLimit { context, .. }
            | Self::Timeout { context, .. }
            | Self::Configuration { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Orchestration { context, .. }
            | Self::Provider { context, .. }
            | Self::WorkflowExecution { context, .. }
            | Self::WorkflowValidation { context, .. }
            | Self::CircuitBreaker { context, .. }
            | Self::RateLimit { context, .. }
            | Self::Timeout { context, .. }
            | Self::Configuration { context, .. } => context,
        }
    }

    /// Attach a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_mut().insert(key.into(), value);
        self
    }

    /// Override the retryable flag where the variant allows it
    pub fn with_retryable(mut self, value: bool) -> Self {
        match &mut self {
            Self::Orchestration { retryable, .. }
            | Self::Provider { retryable, .. }
            | Self::WorkflowExecution { retryable, .. } => *retryable = value,
            _ => {}
        }
        self
    }

    /// Attach execution identifiers to a workflow execution error
    pub fn with_execution(mut self, execution: Option<String>, step: Option<String>) -> Self {
        if let Self::WorkflowExecution {
            execution_id,
            step_id,
            ..
        } = &mut self
        {
            *execution_id = execution;
            *step_id = step;
        }
        self
    }

    /// JSON payload used for event data and logs
    pub fn to_json(&self) -> Value {
        let mut payload = json!({
            "code": self.code().as_str(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
            "context": self.context(),
        });
        match self {
            Self::WorkflowExecution {
                workflow_id,
                execution_id,
                step_id,
                ..
            } => {
                payload["workflow_id"] = json!(workflow_id);
                payload["execution_id"] = json!(execution_id);
                payload["step_id"] = json!(step_id);
            }
            Self::WorkflowValidation { path, errors, .. } => {
                payload["path"] = json!(path);
                payload["errors"] = json!(errors);
            }
            Self::Timeout { timeout_ms, .. } => {
                payload["timeout_ms"] = json!(timeout_ms);
            }
            Self::RateLimit {
                limit,
                window_ms,
                retry_after_ms,
                ..
            } => {
                payload["limit"] = json!(limit);
                payload["window_ms"] = json!(window_ms);
                payload["retry_after_ms"] = json!(retry_after_ms);
            }
            _ => {}
        }
        payload
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(error: serde_json::Error) -> Self {
        OrchestrationError::workflow_validation(format!("JSON serialization error: {error}"), vec![])
    }
}

impl From<crate::config::ConfigurationError> for OrchestrationError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        OrchestrationError::configuration(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults_follow_taxonomy() {
        assert!(!OrchestrationError::generic("boom").is_retryable());
        assert!(OrchestrationError::provider("stripe", "502").is_retryable());
        assert!(OrchestrationError::workflow_execution("wf", "failed").is_retryable());
        assert!(!OrchestrationError::step_input_validation("/name", vec![]).is_retryable());
        assert!(!OrchestrationError::step_timeout("s", Duration::from_millis(10)).is_retryable());
        assert!(OrchestrationError::circuit_open("s", None).is_retryable());
        assert!(
            OrchestrationError::rate_limited(10, Duration::from_secs(1), None).is_retryable()
        );
        assert!(!OrchestrationError::duplicate_step("s").is_retryable());
    }

    #[test]
    fn test_codes_are_stable_strings() {
        assert_eq!(
            OrchestrationError::duplicate_step("a").code().as_str(),
            "DUPLICATE_STEP"
        );
        assert_eq!(
            OrchestrationError::step_timeout("a", Duration::from_millis(5)).code(),
            ErrorCode::StepTimeoutError
        );
        assert_eq!(
            OrchestrationError::operation_timeout("lock", Duration::from_millis(5)).code(),
            ErrorCode::OperationTimeout
        );
        let serialized = serde_json::to_string(&ErrorCode::CircuitBreakerOpen).unwrap();
        assert_eq!(serialized, "\"CIRCUIT_BREAKER_OPEN\"");
    }

    #[test]
    fn test_context_and_overrides() {
        let error = OrchestrationError::generic("flaky")
            .with_context("attempt", json!(2))
            .with_retryable(true);

        assert!(error.is_retryable());
        assert_eq!(error.context().get("attempt"), Some(&json!(2)));
        assert_eq!(error.to_json()["code"], "ORCHESTRATION_ERROR");
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let error = OrchestrationError::rate_limited(
            100,
            Duration::from_secs(60),
            Some(Duration::from_secs(5)),
        );
        assert_eq!(error.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(error.to_json()["limit"], 100);
    }

    #[test]
    fn test_workflow_execution_identifiers() {
        let error = OrchestrationError::workflow_execution("wf-1", "step failed")
            .with_execution(Some("exec-9".to_string()), Some("fetch".to_string()));
        let payload = error.to_json();
        assert_eq!(payload["workflow_id"], "wf-1");
        assert_eq!(payload["execution_id"], "exec-9");
        assert_eq!(payload["step_id"], "fetch");
    }
}
