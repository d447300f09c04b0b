use crate::error::{OrchestrationError, OrchestrationResult};
use crate::steps::{BackoffStrategy, RetryPolicy};
use crate::utils::unwind::panic_message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Schedule lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Registered but not yet firing
    Pending,
    /// Trigger armed, ticks run the workflow
    Active,
    /// Trigger disarmed, can be resumed
    Paused,
    /// Terminal; the schedule has been removed
    Stopped,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn can_transition_to(&self, next: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Stopped)
                | (Active, Paused)
                | (Active, Stopped)
                | (Paused, Active)
                | (Paused, Stopped)
        )
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Priority levels, ordered so that `Critical` is the greatest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Highest first
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// What happens when a tick fires while the previous run of the same schedule is still going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the tick and emit `schedule.skipped`
    #[default]
    SkipIfRunning,
    /// Wait for the running invocation, then run; waiting ticks run in arrival order
    Queue,
    /// Run concurrently
    Allow,
}

/// Schedule-level retry, independent of any step-level retry inside the workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRetryPolicy {
    /// Retries after the first failed run; 0 disables retrying
    pub max_retries: u32,
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub delay: Duration,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl Default for ScheduleRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Fixed,
        }
    }
}

impl ScheduleRetryPolicy {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        match self.backoff {
            BackoffStrategy::Fixed => RetryPolicy::fixed(self.max_retries.saturating_add(1), self.delay),
            BackoffStrategy::Exponential => RetryPolicy::exponential(
                self.max_retries.saturating_add(1),
                self.delay,
                self.delay.max(crate::constants::defaults::RETRY_MAX_DELAY),
            ),
        }
    }
}

/// The recurring trigger that drives a conditional schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseTrigger {
    Cron {
        expression: String,
    },
    Interval {
        #[serde(with = "crate::utils::serde::duration_ms")]
        every: Duration,
    },
}

/// How a schedule fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// 5-field cron expression; `timezone` overrides the scheduler default
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    /// Fixed delay between ticks, plus up to `jitter` of random offset
    Interval {
        #[serde(with = "crate::utils::serde::duration_ms")]
        every: Duration,
        #[serde(default, with = "crate::utils::serde::option_duration_ms")]
        jitter: Option<Duration>,
    },
    /// Each tick enqueues a run on the bounded-concurrency priority queue
    Priority {
        priority: Priority,
        #[serde(with = "crate::utils::serde::duration_ms")]
        every: Duration,
    },
    /// Base trigger gated by a named predicate
    Conditional { condition: String, base: BaseTrigger },
    /// Cron trigger where only the lock holder across the fleet runs each tick
    Distributed {
        cron: String,
        #[serde(default, with = "crate::utils::serde::option_duration_ms")]
        lock_ttl: Option<Duration>,
    },
}

impl TriggerSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
            timezone: None,
        }
    }

    pub fn interval(every: Duration) -> Self {
        Self::Interval { every, jitter: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
            Self::Priority { .. } => "priority",
            Self::Conditional { .. } => "conditional",
            Self::Distributed { .. } => "distributed",
        }
    }
}

/// A recurring invocation of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub workflow_id: String,
    pub trigger: TriggerSpec,
    /// Payload handed to the workflow on every run
    #[serde(default)]
    pub input: Value,
    /// Disabled schedules are registered as `Pending` and armed by `resume`
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub retry: Option<ScheduleRetryPolicy>,
}

fn enabled_default() -> bool {
    true
}

impl ScheduleDefinition {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>, trigger: TriggerSpec) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            trigger,
            input: Value::Null,
            enabled: true,
            overlap_policy: None,
            retry: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = Some(policy);
        self
    }

    pub fn with_retry(mut self, retry: ScheduleRetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Shape checks that need no scheduler state
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestrationError::invalid_schedule("schedule id must not be empty"));
        }
        if self.workflow_id.trim().is_empty() {
            return Err(OrchestrationError::invalid_schedule(format!(
                "schedule '{}' has no target workflow",
                self.id
            )));
        }
        let zero_interval = match &self.trigger {
            TriggerSpec::Interval { every, .. } | TriggerSpec::Priority { every, .. } => every.is_zero(),
            TriggerSpec::Conditional {
                base: BaseTrigger::Interval { every },
                ..
            } => every.is_zero(),
            _ => false,
        };
        if zero_interval {
            return Err(OrchestrationError::invalid_schedule(format!(
                "schedule '{}' interval must be greater than zero",
                self.id
            )));
        }
        Ok(())
    }
}

/// Callback invoked on every tick with the tick's nominal fire time
pub type JobCallback = Arc<dyn Fn(DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapt an async closure into a [`JobCallback`]
pub fn job_fn<F, Fut>(f: F) -> JobCallback
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |fire_time| f(fire_time).boxed())
}

/// Invoke a job callback. A panic is logged and swallowed so the calling loop keeps
/// ticking.
pub(crate) async fn fire(callback: &JobCallback, job_id: &str, fire_time: DateTime<Utc>) {
    let outcome = AssertUnwindSafe(async { callback(fire_time).await })
        .catch_unwind()
        .await;
    if let Err(panic) = outcome {
        error!(
            job_id = job_id,
            fire_time = %fire_time,
            reason = %panic_message(panic.as_ref()),
            "Scheduled callback panicked"
        );
    }
}

/// The integration point with whatever engine hosts workflows
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, workflow_id: &str, input: Value) -> OrchestrationResult<Value>;
}

struct FnRunner<F>(F);

#[async_trait]
impl<F, Fut> WorkflowRunner for FnRunner<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = OrchestrationResult<Value>> + Send + 'static,
{
    async fn run(&self, workflow_id: &str, input: Value) -> OrchestrationResult<Value> {
        (self.0)(workflow_id.to_string(), input).await
    }
}

/// Adapt an async closure into a [`WorkflowRunner`]
pub fn runner_fn<F, Fut>(f: F) -> Arc<dyn WorkflowRunner>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OrchestrationResult<Value>> + Send + 'static,
{
    Arc::new(FnRunner(f))
}
