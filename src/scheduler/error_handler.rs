//! Failure accounting and alerting for scheduled runs.
//!
//! Called after a run has exhausted its schedule-level retries. Failures are counted per
//! schedule; when the failures inside the sliding window reach the threshold and no alert
//! was raised for that schedule within the cooldown, an alert goes to the notifier. The
//! schedule itself keeps running either way.

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::utils::serde::duration_ms;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Failures inside `window` that raise an alert
    pub threshold: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// Minimum time between two alerts for the same schedule
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(15 * 60),
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleAlert {
    pub schedule_id: String,
    pub workflow_id: String,
    /// Failures inside the alert window when the alert was raised
    pub recent_failures: u32,
    pub total_failures: u64,
    pub last_error: Value,
    pub raised_at: DateTime<Utc>,
}

/// Destination for schedule alerts
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &ScheduleAlert) -> OrchestrationResult<()>;
}

/// Logs alerts at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertNotifier;

#[async_trait]
impl AlertNotifier for TracingAlertNotifier {
    async fn notify(&self, alert: &ScheduleAlert) -> OrchestrationResult<()> {
        error!(
            schedule_id = %alert.schedule_id,
            workflow_id = %alert.workflow_id,
            recent_failures = alert.recent_failures,
            total_failures = alert.total_failures,
            last_error = %alert.last_error,
            "🚨 Schedule failure threshold reached"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FailureRecord {
    recent: VecDeque<Instant>,
    total: u64,
    last_alert: Option<Instant>,
}

pub struct ScheduleErrorHandler {
    config: AlertConfig,
    notifier: Arc<dyn AlertNotifier>,
    records: Mutex<HashMap<String, FailureRecord>>,
}

impl std::fmt::Debug for ScheduleErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleErrorHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScheduleErrorHandler {
    pub fn new(config: AlertConfig, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self {
            config,
            notifier,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tracing(config: AlertConfig) -> Self {
        Self::new(config, Arc::new(TracingAlertNotifier))
    }

    /// Record a final failure and notify when it crosses the alert threshold.
    /// Returns the alert that was raised, if any.
    pub async fn handle_failure(
        &self,
        schedule_id: &str,
        workflow_id: &str,
        failure: &OrchestrationError,
    ) -> Option<ScheduleAlert> {
        let alert = self.record_failure(schedule_id, workflow_id, failure)?;
        if let Err(err) = self.notifier.notify(&alert).await {
            warn!(schedule_id = schedule_id, error = %err, "Alert notifier failed");
        }
        Some(alert)
    }

    fn record_failure(
        &self,
        schedule_id: &str,
        workflow_id: &str,
        failure: &OrchestrationError,
    ) -> Option<ScheduleAlert> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records.entry(schedule_id.to_string()).or_default();

        record.total += 1;
        record.recent.push_back(now);
        while record
            .recent
            .front()
            .is_some_and(|at| now.duration_since(*at) > self.config.window)
        {
            record.recent.pop_front();
        }

        let recent = record.recent.len() as u32;
        let cooled_down = record
            .last_alert
            .map_or(true, |at| now.duration_since(at) >= self.config.cooldown);
        if recent < self.config.threshold || !cooled_down {
            return None;
        }

        record.last_alert = Some(now);
        Some(ScheduleAlert {
            schedule_id: schedule_id.to_string(),
            workflow_id: workflow_id.to_string(),
            recent_failures: recent,
            total_failures: record.total,
            last_error: failure.to_json(),
            raised_at: Utc::now(),
        })
    }

    pub fn failure_count(&self, schedule_id: &str) -> u64 {
        self.records
            .lock()
            .get(schedule_id)
            .map_or(0, |record| record.total)
    }

    pub fn reset(&self, schedule_id: &str) {
        self.records.lock().remove(schedule_id);
    }
}
