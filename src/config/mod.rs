//! # Orchestration Configuration
//!
//! Typed configuration for every orchestration component. Each component also accepts its
//! own configuration struct directly; this module is the file/env-backed way to build them.
//!
//! ## Layering
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. `config/orchestration.toml`
//! 3. `config/orchestration.{environment}.toml`
//! 4. `ORCHESTRATION__SECTION__KEY` environment variables
//!
//! Durations are expressed in milliseconds (`*_ms`) in files and environment variables and
//! converted into `std::time::Duration` by the `to_*_config()` helpers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use orchestration_core::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load()?;
//! let bus_config = config.event_bus.to_bus_config();
//! println!("history enabled: {}", bus_config.enable_history);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::events::{DispatchMode, EventBusConfig};
use crate::resilience::CircuitBreakerConfig;
use crate::scheduler::{
    AlertConfig, ConditionalSchedulerConfig, DistributedSchedulerConfig, OverlapPolicy,
    ScheduleRetryPolicy, SchedulerConfig,
};
use crate::steps::{BackoffStrategy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

/// Root configuration structure mirroring `orchestration.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Logging and tracing subscriber settings
    pub logging: LoggingSettings,

    /// Event bus history and dispatch
    pub event_bus: EventBusSettings,

    /// Scheduler strategies, alerting and distributed coordination
    pub scheduler: SchedulerSettings,

    /// Default circuit breaker thresholds for step enhancers
    pub circuit_breaker: CircuitBreakerSettings,

    /// Default retry policy for step enhancers
    pub retry: RetrySettings,

    /// Step factory defaults
    pub steps: StepSettings,
}

impl OrchestrationConfig {
    /// Validate every section, failing on the first invalid value
    pub fn validate(&self) -> ConfigResult<()> {
        self.event_bus.validate()?;
        self.scheduler.validate()?;
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.steps.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Explicit filter directive; falls back to `RUST_LOG`, then the environment default
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventBusSettings {
    pub enable_history: bool,
    pub max_history_size: usize,
    pub dispatch_mode: DispatchMode,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        let defaults = EventBusConfig::default();
        Self {
            enable_history: defaults.enable_history,
            max_history_size: defaults.max_history_size,
            dispatch_mode: defaults.dispatch_mode,
        }
    }
}

impl EventBusSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.enable_history && self.max_history_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "event_bus.max_history_size",
                "0",
                "must be greater than 0 when history is enabled",
            ));
        }
        Ok(())
    }

    pub fn to_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            enable_history: self.enable_history,
            max_history_size: self.max_history_size,
            dispatch_mode: self.dispatch_mode,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// IANA timezone used for cron evaluation
    pub timezone: String,
    pub overlap_policy: OverlapPolicy,
    pub priority_max_concurrency: usize,
    pub retry_max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: BackoffStrategy,
    pub alert_threshold: u32,
    pub alert_window_ms: u64,
    pub alert_cooldown_ms: u64,
    pub condition_cache_enabled: bool,
    pub condition_cache_window_ms: u64,
    pub max_interval_jitter_ms: u64,
    pub lock_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub leave_timeout_ms: u64,
    pub lock_key_prefix: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            overlap_policy: OverlapPolicy::SkipIfRunning,
            priority_max_concurrency: 4,
            retry_max_retries: 0,
            retry_delay_ms: 1_000,
            retry_backoff: BackoffStrategy::Fixed,
            alert_threshold: 3,
            alert_window_ms: 15 * 60 * 1_000,
            alert_cooldown_ms: 5 * 60 * 1_000,
            condition_cache_enabled: false,
            condition_cache_window_ms: 60_000,
            max_interval_jitter_ms: 0,
            lock_ttl_ms: 90_000,
            heartbeat_interval_ms: 30_000,
            leave_timeout_ms: 5_000,
            lock_key_prefix: "orchestration:scheduler".to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        chrono_tz::Tz::from_str(&self.timezone).map_err(|e| {
            ConfigurationError::invalid_value("scheduler.timezone", self.timezone.clone(), e.to_string())
        })?;

        if self.priority_max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.priority_max_concurrency",
                "0",
                "must be greater than 0",
            ));
        }

        if self.alert_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.alert_threshold",
                "0",
                "must be greater than 0",
            ));
        }

        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.lock_ttl_ms {
            return Err(ConfigurationError::invalid_value(
                "scheduler.heartbeat_interval_ms",
                self.heartbeat_interval_ms.to_string(),
                format!("must be non-zero and shorter than lock_ttl_ms ({})", self.lock_ttl_ms),
            ));
        }

        Ok(())
    }

    fn tz(&self) -> chrono_tz::Tz {
        chrono_tz::Tz::from_str(&self.timezone).unwrap_or(chrono_tz::UTC)
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            timezone: self.tz(),
            overlap_policy: self.overlap_policy,
            default_retry: ScheduleRetryPolicy {
                max_retries: self.retry_max_retries,
                delay: Duration::from_millis(self.retry_delay_ms),
                backoff: self.retry_backoff,
            },
            priority_max_concurrency: self.priority_max_concurrency,
            max_interval_jitter: Duration::from_millis(self.max_interval_jitter_ms),
            alerting: self.to_alert_config(),
            conditional: self.to_conditional_config(),
        }
    }

    pub fn to_alert_config(&self) -> AlertConfig {
        AlertConfig {
            threshold: self.alert_threshold,
            window: Duration::from_millis(self.alert_window_ms),
            cooldown: Duration::from_millis(self.alert_cooldown_ms),
        }
    }

    pub fn to_conditional_config(&self) -> ConditionalSchedulerConfig {
        ConditionalSchedulerConfig {
            timezone: self.tz(),
            cache_enabled: self.condition_cache_enabled,
            cache_window: Duration::from_millis(self.condition_cache_window_ms),
        }
    }

    pub fn to_distributed_config(&self, node_id: impl Into<String>) -> DistributedSchedulerConfig {
        DistributedSchedulerConfig {
            node_id: node_id.into(),
            timezone: self.tz(),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            leave_timeout: Duration::from_millis(self.leave_timeout_ms),
            key_prefix: self.lock_key_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            reset_timeout_ms: defaults.reset_timeout.as_millis() as u64,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        self.to_resilience_config()
            .validate()
            .map_err(ConfigurationError::validation_error)
    }

    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable_only: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff: defaults.backoff,
            delay_ms: defaults.delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            retryable_only: defaults.retryable_only,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> ConfigResult<()> {
        self.to_retry_policy()
            .validate()
            .map_err(ConfigurationError::validation_error)
    }

    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            delay: Duration::from_millis(self.delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            retryable_only: self.retryable_only,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StepSettings {
    pub default_category: String,
    pub default_version: String,
    pub default_timeout_ms: Option<u64>,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            default_category: "general".to_string(),
            default_version: "1.0.0".to_string(),
            default_timeout_ms: None,
        }
    }
}

impl StepSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.default_category.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "steps.default_category",
                "",
                "must not be empty",
            ));
        }
        if !crate::steps::is_semver(&self.default_version) {
            return Err(ConfigurationError::invalid_value(
                "steps.default_version",
                self.default_version.clone(),
                "must be a semantic version (MAJOR.MINOR.PATCH)",
            ));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "steps.default_timeout_ms",
                "0",
                "must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestrationConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let settings = SchedulerSettings {
            timezone: "Mars/Olympus_Mons".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_ttl() {
        let settings = SchedulerSettings {
            lock_ttl_ms: 1_000,
            heartbeat_interval_ms: 1_000,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_history_size_required_when_enabled() {
        let settings = EventBusSettings {
            enable_history: true,
            max_history_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let disabled = EventBusSettings {
            enable_history: false,
            max_history_size: 0,
            ..Default::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_conversions_preserve_durations() {
        let settings = SchedulerSettings {
            timezone: "Europe/Berlin".to_string(),
            alert_window_ms: 2_500,
            ..Default::default()
        };
        let scheduler = settings.to_scheduler_config();
        assert_eq!(scheduler.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(scheduler.alerting.window, Duration::from_millis(2_500));

        let distributed = settings.to_distributed_config("node-a");
        assert_eq!(distributed.node_id, "node-a");
        assert_eq!(distributed.lock_ttl, Duration::from_millis(90_000));
    }
}
