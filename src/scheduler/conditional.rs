//! Predicate-gated scheduling.
//!
//! A conditional job rides on a base cron or interval trigger. At each tick the named
//! predicate is evaluated against the tick time in the configured timezone; the callback
//! only runs when it returns true.

use super::cron::{CronExpression, CronScheduler};
use super::interval::{IntervalHandle, IntervalScheduler};
use super::types::{job_fn, BaseTrigger, JobCallback};
use crate::error::{OrchestrationError, OrchestrationResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Boolean gate evaluated at tick time
pub type Predicate = Arc<dyn Fn(DateTime<Tz>) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalSchedulerConfig {
    /// Timezone the predicate sees tick times in
    #[serde(with = "tz_name")]
    pub timezone: Tz,
    /// Reuse a predicate's result for every tick within the same cache window
    pub cache_enabled: bool,
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub cache_window: Duration,
}

impl Default for ConditionalSchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            cache_enabled: false,
            cache_window: Duration::from_secs(60),
        }
    }
}

/// A callback gated by a named condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalJob {
    pub id: String,
    pub condition: String,
    pub base: BaseTrigger,
}

enum ArmedTrigger {
    Cron(String),
    Interval(IntervalHandle),
}

struct ConditionalInner {
    config: ConditionalSchedulerConfig,
    conditions: RwLock<HashMap<String, Predicate>>,
    /// condition name -> (window index, cached result)
    cache: Mutex<HashMap<String, (i64, bool)>>,
    cron: CronScheduler,
    interval: IntervalScheduler,
    jobs: Mutex<HashMap<String, ArmedTrigger>>,
}

impl Drop for ConditionalInner {
    fn drop(&mut self) {
        self.cron.stop();
        self.interval.clear_all();
    }
}

#[derive(Clone)]
pub struct ConditionalScheduler {
    inner: Arc<ConditionalInner>,
}

impl fmt::Debug for ConditionalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalScheduler")
            .field("config", &self.inner.config)
            .field("conditions", &self.condition_names())
            .finish()
    }
}

impl ConditionalScheduler {
    pub fn new(config: ConditionalSchedulerConfig) -> Self {
        let cron = CronScheduler::new(config.timezone);
        cron.start();
        Self {
            inner: Arc::new(ConditionalInner {
                config,
                conditions: RwLock::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                cron,
                interval: IntervalScheduler::default(),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ConditionalSchedulerConfig {
        &self.inner.config
    }

    /// Register or replace a named predicate
    pub fn add_condition<F>(&self, name: &str, predicate: F)
    where
        F: Fn(DateTime<Tz>) -> bool + Send + Sync + 'static,
    {
        self.inner
            .conditions
            .write()
            .insert(name.to_string(), Arc::new(predicate));
        self.inner.cache.lock().remove(name);
        debug!(condition = name, "Condition registered");
    }

    pub fn remove_condition(&self, name: &str) -> bool {
        self.inner.cache.lock().remove(name);
        self.inner.conditions.write().remove(name).is_some()
    }

    pub fn has_condition(&self, name: &str) -> bool {
        self.inner.conditions.read().contains_key(name)
    }

    pub fn condition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.conditions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Evaluate `name` at `now`. A panicking predicate counts as false.
    pub fn evaluate(&self, name: &str, now: DateTime<Utc>) -> OrchestrationResult<bool> {
        let predicate = self
            .inner
            .conditions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_condition(name))?;

        let window = self.window_index(now);
        if let Some(window) = window {
            if let Some((cached_window, result)) = self.inner.cache.lock().get(name) {
                if *cached_window == window {
                    return Ok(*result);
                }
            }
        }

        let local = now.with_timezone(&self.inner.config.timezone);
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| predicate(local))) {
            Ok(result) => result,
            Err(_) => {
                warn!(condition = name, "Condition predicate panicked, treating as false");
                false
            }
        };

        if let Some(window) = window {
            self.inner
                .cache
                .lock()
                .insert(name.to_string(), (window, result));
        }
        Ok(result)
    }

    fn window_index(&self, now: DateTime<Utc>) -> Option<i64> {
        let config = &self.inner.config;
        let window_ms = config.cache_window.as_millis() as i64;
        (config.cache_enabled && window_ms > 0).then(|| now.timestamp_millis().div_euclid(window_ms))
    }

    /// Arm `job`; `callback` runs on ticks where the condition holds
    pub fn schedule(&self, job: ConditionalJob, callback: JobCallback) -> OrchestrationResult<()> {
        if !self.has_condition(&job.condition) {
            return Err(unknown_condition(&job.condition));
        }
        let mut jobs = self.inner.jobs.lock();
        if jobs.contains_key(&job.id) {
            return Err(OrchestrationError::invalid_schedule(format!(
                "conditional job '{}' is already scheduled",
                job.id
            )));
        }

        let gate = {
            let weak = Arc::downgrade(&self.inner);
            let condition = job.condition.clone();
            let job_id = job.id.clone();
            job_fn(move |fire_time| {
                let callback = Arc::clone(&callback);
                let pass = match weak.upgrade() {
                    Some(inner) => match (ConditionalScheduler { inner }).evaluate(&condition, fire_time) {
                        Ok(pass) => pass,
                        Err(err) => {
                            warn!(job_id = %job_id, error = %err, "Condition unavailable, skipping tick");
                            false
                        }
                    },
                    None => false,
                };
                async move {
                    if pass {
                        callback(fire_time).await;
                    }
                }
            })
        };

        let armed = match &job.base {
            BaseTrigger::Cron { expression } => {
                let expression = CronExpression::parse(expression)?;
                self.inner
                    .cron
                    .add_job_in(&job.id, expression, self.inner.config.timezone, gate)?;
                ArmedTrigger::Cron(job.id.clone())
            }
            BaseTrigger::Interval { every } => {
                ArmedTrigger::Interval(self.inner.interval.schedule(*every, gate)?)
            }
        };
        jobs.insert(job.id, armed);
        Ok(())
    }

    pub fn unschedule(&self, id: &str) -> bool {
        match self.inner.jobs.lock().remove(id) {
            Some(ArmedTrigger::Cron(job_id)) => self.inner.cron.remove_job(&job_id),
            Some(ArmedTrigger::Interval(handle)) => self.inner.interval.clear(handle),
            None => false,
        }
    }

    /// Disarm every conditional job; registered conditions are kept
    pub fn stop(&self) {
        let jobs: Vec<String> = self.inner.jobs.lock().keys().cloned().collect();
        for id in jobs {
            self.unschedule(&id);
        }
    }
}

fn unknown_condition(name: &str) -> OrchestrationError {
    OrchestrationError::invalid_schedule(format!("condition '{name}' is not registered"))
        .with_context("condition", serde_json::json!(name))
}

pub(crate) mod tz_name {
    use chrono_tz::Tz;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(value: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Tz::from_str(&name).map_err(D::Error::custom)
    }
}
