//! Configuration Loader
//!
//! Environment-aware configuration loading built on the `config` crate. Files are optional;
//! a missing directory yields the built-in defaults plus any environment overrides.

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestrationConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

const BASE_FILE_NAME: &str = "orchestration";
const ENV_PREFIX: &str = "ORCHESTRATION";

/// Layered configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with environment auto-detection from `./config`
    pub fn load() -> ConfigResult<OrchestrationConfig> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<OrchestrationConfig> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with an explicit environment.
    /// Useful in tests that must not touch process-wide environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<OrchestrationConfig> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading orchestration configuration"
        );

        let config: OrchestrationConfig = Self::builder(&config_directory, environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;

        debug!(
            environment = environment,
            history_enabled = config.event_bus.enable_history,
            timezone = %config.scheduler.timezone,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document, without environment overrides
    pub fn from_toml_str(contents: &str) -> ConfigResult<OrchestrationConfig> {
        let config: OrchestrationConfig = Config::builder()
            .add_source(File::from_str(contents, config::FileFormat::Toml))
            .build()
            .map_err(|e| ConfigurationError::load_error("inline toml", e))?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `ORCHESTRATION_ENV`, then `APP_ENV`, defaulting to `development`
    pub fn detect_environment() -> String {
        env::var("ORCHESTRATION_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        PathBuf::from("config")
    }

    fn builder(
        directory: &Path,
        environment: &str,
    ) -> config::ConfigBuilder<config::builder::DefaultState> {
        let base = directory.join(BASE_FILE_NAME);
        let overlay = directory.join(format!("{BASE_FILE_NAME}.{environment}"));

        Config::builder()
            .add_source(File::from(base).required(false))
            .add_source(File::from(overlay).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DispatchMode;
    use crate::scheduler::OverlapPolicy;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConfigLoader::load_from_directory_with_env(
            Some(dir.path().join("does-not-exist")),
            "test",
        )
        .unwrap();

        assert!(config.event_bus.enable_history);
        assert_eq!(config.scheduler.timezone, "UTC");
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestration.toml"),
            r#"
[event_bus]
max_history_size = 50
dispatch_mode = "awaited"

[scheduler]
timezone = "America/New_York"
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("orchestration.staging.toml"),
            r#"
[event_bus]
max_history_size = 10

[scheduler]
overlap_policy = "queue"
"#,
        )
        .unwrap();

        let config =
            ConfigLoader::load_from_directory_with_env(Some(dir.path().to_path_buf()), "staging")
                .unwrap();

        assert_eq!(config.event_bus.max_history_size, 10);
        assert_eq!(config.event_bus.dispatch_mode, DispatchMode::Awaited);
        assert_eq!(config.scheduler.timezone, "America/New_York");
        assert_eq!(config.scheduler.overlap_policy, OverlapPolicy::Queue);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let result = ConfigLoader::from_toml_str(
            r#"
[circuit_breaker]
failure_threshold = 0
"#,
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_is_deserialize_error() {
        let result = ConfigLoader::from_toml_str(
            r#"
[retry]
max_attempts = "many"
"#,
        );
        assert!(result.is_err());
    }
}
