//! # Structured Logging Module
//!
//! Environment-aware structured logging for the orchestration runtime, plus the
//! [`LogSink`] seam that components accept for caller-supplied log destinations.
//!
//! Components never require a sink. When none is configured they emit through
//! `tracing` only, and the presence or absence of a sink never changes control flow.

use crate::config::LoggingSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber.
///
/// Filter precedence: `settings.level`, then `RUST_LOG`, then a default derived from the
/// detected environment. Safe to call repeatedly; only the first call installs anything,
/// and an already-installed global subscriber is left in place.
pub fn init_structured_logging(settings: &LoggingSettings) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = match &settings.level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment))),
        };

        let registry = tracing_subscriber::registry().with(filter);

        let result = if settings.json {
            registry
                .with(
                    tracing_fmt::layer()
                        .json()
                        .with_target(settings.with_target)
                        .with_thread_ids(settings.with_thread_ids)
                        .with_level(true),
                )
                .try_init()
        } else {
            registry
                .with(
                    tracing_fmt::layer()
                        .with_target(settings.with_target)
                        .with_thread_ids(settings.with_thread_ids)
                        .with_level(true)
                        .with_ansi(true),
                )
                .try_init()
        };

        if result.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            environment = %environment,
            json = settings.json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("ORCHESTRATION_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Structured context attached to a log record
pub type LogContext = HashMap<String, Value>;

/// Caller-supplied log destination
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, context: &LogContext);
}

/// Forwards records into the active `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str, context: &LogContext) {
        let context = Value::Object(context.clone().into_iter().collect());
        match level {
            LogLevel::Debug => tracing::debug!(context = %context, "{message}"),
            LogLevel::Info => tracing::info!(context = %context, "{message}"),
            LogLevel::Warn => tracing::warn!(context = %context, "{message}"),
            LogLevel::Error => tracing::error!(context = %context, "{message}"),
        }
    }
}

/// Emit to the optional sink, if any
pub(crate) fn emit(sink: Option<&Arc<dyn LogSink>>, level: LogLevel, message: &str, context: LogContext) {
    if let Some(sink) = sink {
        sink.log(level, message, &context);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Captures every record for assertions
    #[derive(Debug, Default)]
    pub struct CapturingSink {
        pub records: Mutex<Vec<(LogLevel, String, LogContext)>>,
    }

    impl LogSink for CapturingSink {
        fn log(&self, level: LogLevel, message: &str, context: &LogContext) {
            self.records
                .lock()
                .push((level, message.to_string(), context.clone()));
        }
    }
}
