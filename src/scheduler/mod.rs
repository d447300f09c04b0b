//! # Scheduling
//!
//! Time-, priority- and condition-driven execution of workflows.
//!
//! The strategy schedulers ([`CronScheduler`], [`IntervalScheduler`], [`PriorityScheduler`],
//! [`ConditionalScheduler`], [`DistributedScheduler`]) each work on their own with plain
//! callbacks. [`Scheduler`] ties them together: it owns [`ScheduleDefinition`]s, runs them
//! through a [`WorkflowRunner`] with overlap and retry policies, feeds final failures to the
//! [`ScheduleErrorHandler`] and publishes `schedule.*` events.
//!
//! ```rust
//! use orchestration_core::scheduler::{runner_fn, ScheduleDefinition, Scheduler, TriggerSpec};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let runner = runner_fn(|workflow_id, _input| async move { Ok(json!({"ran": workflow_id})) });
//! let scheduler = Scheduler::builder(runner).build();
//!
//! scheduler
//!     .schedule(ScheduleDefinition::new(
//!         "nightly-report",
//!         "report-workflow",
//!         TriggerSpec::cron("0 2 * * *"),
//!     ))
//!     .await
//!     .unwrap();
//!
//! let outcome = scheduler.trigger_now("nightly-report").await.unwrap();
//! assert!(outcome.is_completed());
//! scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
//! # });
//! ```

mod conditional;
mod cron;
mod distributed;
mod error_handler;
mod interval;
mod manager;
mod priority;
mod types;

pub use conditional::{ConditionalJob, ConditionalScheduler, ConditionalSchedulerConfig, Predicate};
pub use cron::{CronExpression, CronScheduler};
pub use distributed::{
    DistributedJob, DistributedScheduler, DistributedSchedulerConfig, InMemoryLockProvider,
    LockProvider,
};
pub use error_handler::{
    AlertConfig, AlertNotifier, ScheduleAlert, ScheduleErrorHandler, TracingAlertNotifier,
};
pub use interval::{IntervalHandle, IntervalScheduler};
pub use manager::{
    RunOutcome, ScheduleInfo, ScheduleStats, Scheduler, SchedulerBuilder, SchedulerConfig,
    SkipReason,
};
pub use priority::{PriorityJob, PriorityScheduler};
pub use types::{
    job_fn, runner_fn, BaseTrigger, JobCallback, OverlapPolicy, Priority, ScheduleDefinition,
    ScheduleRetryPolicy, ScheduleStatus, TriggerSpec, WorkflowRunner,
};
