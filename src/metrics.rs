//! # Step Metrics
//!
//! The sink the metrics enhancer records into, plus an in-memory implementation used in
//! tests and single-process deployments.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Destination for step execution metrics
pub trait MetricsSink: Send + Sync {
    fn record_duration(&self, step_id: &str, duration: Duration);
    fn record_success(&self, step_id: &str);
    fn record_error(&self, step_id: &str, error_code: &str);
}

/// Aggregated metrics for one step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepMetricsSnapshot {
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub total_duration_ms: f64,
    pub last_duration_ms: Option<f64>,
    pub max_duration_ms: f64,
    /// Error counts keyed by error code
    pub errors_by_code: Vec<(String, u64)>,
}

impl StepMetricsSnapshot {
    pub fn average_duration_ms(&self) -> Option<f64> {
        (self.executions > 0).then(|| self.total_duration_ms / self.executions as f64)
    }
}

#[derive(Debug, Default)]
struct StepCounters {
    executions: u64,
    successes: u64,
    errors: u64,
    total_duration_ms: f64,
    last_duration_ms: Option<f64>,
    max_duration_ms: f64,
    errors_by_code: Vec<(String, u64)>,
}

/// Concurrent in-memory metrics store
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    steps: Arc<DashMap<String, StepCounters>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, step_id: &str) -> Option<StepMetricsSnapshot> {
        self.steps.get(step_id).map(|counters| StepMetricsSnapshot {
            executions: counters.executions,
            successes: counters.successes,
            errors: counters.errors,
            total_duration_ms: counters.total_duration_ms,
            last_duration_ms: counters.last_duration_ms,
            max_duration_ms: counters.max_duration_ms,
            errors_by_code: counters.errors_by_code.clone(),
        })
    }

    pub fn step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.steps.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn reset(&self) {
        self.steps.clear();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_duration(&self, step_id: &str, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        let mut counters = self.steps.entry(step_id.to_string()).or_default();
        counters.executions += 1;
        counters.total_duration_ms += ms;
        counters.last_duration_ms = Some(ms);
        if ms > counters.max_duration_ms {
            counters.max_duration_ms = ms;
        }
    }

    fn record_success(&self, step_id: &str) {
        self.steps.entry(step_id.to_string()).or_default().successes += 1;
    }

    fn record_error(&self, step_id: &str, error_code: &str) {
        let mut counters = self.steps.entry(step_id.to_string()).or_default();
        counters.errors += 1;
        match counters
            .errors_by_code
            .iter_mut()
            .find(|(code, _)| code == error_code)
        {
            Some((_, count)) => *count += 1,
            None => counters.errors_by_code.push((error_code.to_string(), 1)),
        }
    }
}
