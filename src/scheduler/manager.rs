//! The scheduler facade: owns schedule lifecycles and drives every trigger kind.

use super::conditional::{ConditionalScheduler, ConditionalSchedulerConfig};
use super::cron::{CronExpression, CronScheduler};
use super::distributed::DistributedScheduler;
use super::error_handler::{AlertConfig, AlertNotifier, ScheduleErrorHandler, TracingAlertNotifier};
use super::interval::{IntervalHandle, IntervalScheduler};
use super::priority::{PriorityJob, PriorityScheduler};
use super::types::{
    job_fn, BaseTrigger, JobCallback, OverlapPolicy, Priority, ScheduleDefinition,
    ScheduleRetryPolicy, ScheduleStatus, TriggerSpec, WorkflowRunner,
};
use crate::constants::events;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::events::EventBus;
use crate::logging::{self, LogContext, LogLevel, LogSink};
use crate::steps::policy::run_with_retry;
use crate::utils::unwind::panic_message;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Scheduler-wide defaults; schedules may override overlap and retry individually
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Timezone for cron triggers that do not name one
    pub timezone: Tz,
    pub overlap_policy: OverlapPolicy,
    pub default_retry: ScheduleRetryPolicy,
    /// Priority-triggered runs executing at once
    pub priority_max_concurrency: usize,
    /// Jitter for interval triggers that do not set one
    pub max_interval_jitter: Duration,
    pub alerting: AlertConfig,
    pub conditional: ConditionalSchedulerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            overlap_policy: OverlapPolicy::default(),
            default_retry: ScheduleRetryPolicy::default(),
            priority_max_concurrency: 4,
            max_interval_jitter: Duration::ZERO,
            alerting: AlertConfig::default(),
            conditional: ConditionalSchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleStats {
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<Value>,
}

/// Point-in-time view of a schedule
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub definition: ScheduleDefinition,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub stats: ScheduleStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Overlap policy `SkipIfRunning` and a run was in progress
    AlreadyRunning,
    /// The schedule was paused or stopped when the tick arrived
    Inactive,
    /// The gating condition evaluated to false
    ConditionFalse,
    /// Another node holds the distributed lock for this tick
    LockHeld,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "already_running"),
            Self::Inactive => write!(f, "inactive"),
            Self::ConditionFalse => write!(f, "condition_false"),
            Self::LockHeld => write!(f, "lock_held"),
        }
    }
}

/// Result of one scheduled run
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { output: Value, attempts: u32 },
    Failed { error: OrchestrationError, attempts: u32 },
    Skipped { reason: SkipReason },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

enum ArmedTrigger {
    Cron,
    Interval(IntervalHandle),
}

#[derive(Clone)]
enum TickGate {
    Direct,
    Priority(Priority),
    Condition(String),
    Distributed(Option<Duration>),
}

struct ScheduleSlot {
    definition: ScheduleDefinition,
    created_at: DateTime<Utc>,
    status: Mutex<ScheduleStatus>,
    armed: Mutex<Option<ArmedTrigger>>,
    running: AtomicUsize,
    /// Serializes runs under `OverlapPolicy::Queue`; tokio's mutex is FIFO-fair
    queue: tokio::sync::Mutex<()>,
    stats: Mutex<ScheduleStats>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    runner: Arc<dyn WorkflowRunner>,
    event_bus: Option<EventBus>,
    log_sink: Option<Arc<dyn LogSink>>,
    schedules: RwLock<HashMap<String, Arc<ScheduleSlot>>>,
    cron: CronScheduler,
    interval: IntervalScheduler,
    priority: PriorityScheduler,
    conditional: ConditionalScheduler,
    distributed: Option<DistributedScheduler>,
    error_handler: ScheduleErrorHandler,
    in_flight: AtomicUsize,
    idle: Notify,
    shut_down: AtomicBool,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.cron.stop();
        self.interval.clear_all();
        self.priority.stop();
    }
}

/// Decrements the run counters however the run ends
struct RunGuard {
    slot: Arc<ScheduleSlot>,
    inner: Arc<SchedulerInner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.running.fetch_sub(1, Ordering::AcqRel);
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    runner: Arc<dyn WorkflowRunner>,
    event_bus: Option<EventBus>,
    log_sink: Option<Arc<dyn LogSink>>,
    distributed: Option<DistributedScheduler>,
    notifier: Option<Arc<dyn AlertNotifier>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish lifecycle events (`schedule.*`) on this bus
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Required for `TriggerSpec::Distributed` schedules
    pub fn distributed(mut self, distributed: DistributedScheduler) -> Self {
        self.distributed = Some(distributed);
        self
    }

    pub fn alert_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Scheduler {
        let config = self.config;
        let cron = CronScheduler::new(config.timezone);
        cron.start();
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingAlertNotifier));

        Scheduler {
            inner: Arc::new(SchedulerInner {
                runner: self.runner,
                event_bus: self.event_bus,
                log_sink: self.log_sink,
                schedules: RwLock::new(HashMap::new()),
                cron,
                interval: IntervalScheduler::new(config.max_interval_jitter),
                priority: PriorityScheduler::new(config.priority_max_concurrency),
                conditional: ConditionalScheduler::new(config.conditional.clone()),
                distributed: self.distributed,
                error_handler: ScheduleErrorHandler::new(config.alerting.clone(), notifier),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                shut_down: AtomicBool::new(false),
                config,
            }),
        }
    }
}

/// Owns schedules and turns their triggers into workflow runs.
///
/// Every tick schedules a run on the tokio runtime rather than running it inline. Each run
/// goes through the schedule's overlap policy, then its retry policy; a run that still
/// fails is reported to the error handler, which may raise an alert. Nothing a run does
/// can stop the schedule.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("schedules", &self.inner.schedules.read().len())
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler {
    pub fn builder(runner: Arc<dyn WorkflowRunner>) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            runner,
            event_bus: None,
            log_sink: None,
            distributed: None,
            notifier: None,
        }
    }

    pub fn new(config: SchedulerConfig, runner: Arc<dyn WorkflowRunner>) -> Self {
        Self::builder(runner).config(config).build()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Conditions used by `TriggerSpec::Conditional` schedules
    pub fn conditions(&self) -> &ConditionalScheduler {
        &self.inner.conditional
    }

    pub fn error_handler(&self) -> &ScheduleErrorHandler {
        &self.inner.error_handler
    }

    /// Priority-triggered runs waiting for a concurrency slot
    pub fn queued_runs(&self) -> usize {
        self.inner.priority.size()
    }

    /// Register a schedule. Enabled schedules are armed immediately.
    pub async fn schedule(&self, definition: ScheduleDefinition) -> OrchestrationResult<ScheduleInfo> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(OrchestrationError::invalid_schedule("scheduler has been shut down"));
        }
        definition.validate()?;
        self.validate_trigger(&definition.trigger)?;

        let slot = Arc::new(ScheduleSlot {
            created_at: Utc::now(),
            status: Mutex::new(ScheduleStatus::Pending),
            armed: Mutex::new(None),
            running: AtomicUsize::new(0),
            queue: tokio::sync::Mutex::new(()),
            stats: Mutex::new(ScheduleStats::default()),
            definition,
        });
        let id = slot.definition.id.clone();

        {
            let mut schedules = self.inner.schedules.write();
            if schedules.contains_key(&id) {
                return Err(OrchestrationError::invalid_schedule(format!(
                    "schedule '{id}' already exists"
                ))
                .with_context("schedule_id", json!(id)));
            }
            schedules.insert(id.clone(), Arc::clone(&slot));
        }

        if slot.definition.enabled {
            if let Err(err) = self.transition_and_arm(&slot, ScheduleStatus::Active) {
                self.inner.schedules.write().remove(&id);
                return Err(err);
            }
        }

        info!(
            schedule_id = %id,
            workflow_id = %slot.definition.workflow_id,
            trigger = slot.definition.trigger.kind(),
            "📅 Schedule registered"
        );
        let info = self.info(&slot);
        self.publish(
            events::SCHEDULE_REGISTERED,
            json!({
                "schedule_id": id,
                "workflow_id": slot.definition.workflow_id,
                "trigger": slot.definition.trigger.kind(),
                "status": info.status,
            }),
        )
        .await;
        Ok(info)
    }

    pub async fn pause(&self, schedule_id: &str) -> OrchestrationResult<ScheduleInfo> {
        let slot = self.require_slot(schedule_id)?;
        self.transition_and_arm(&slot, ScheduleStatus::Paused)?;
        debug!(schedule_id = schedule_id, "Schedule paused");
        self.publish(events::SCHEDULE_PAUSED, json!({"schedule_id": schedule_id}))
            .await;
        Ok(self.info(&slot))
    }

    /// Re-arm a paused schedule, or arm a disabled one for the first time
    pub async fn resume(&self, schedule_id: &str) -> OrchestrationResult<ScheduleInfo> {
        let slot = self.require_slot(schedule_id)?;
        self.transition_and_arm(&slot, ScheduleStatus::Active)?;
        debug!(schedule_id = schedule_id, "Schedule resumed");
        self.publish(events::SCHEDULE_RESUMED, json!({"schedule_id": schedule_id}))
            .await;
        Ok(self.info(&slot))
    }

    /// Stop and remove a schedule. Runs already in progress finish.
    pub async fn unschedule(&self, schedule_id: &str) -> OrchestrationResult<ScheduleInfo> {
        let slot = self
            .inner
            .schedules
            .write()
            .remove(schedule_id)
            .ok_or_else(|| OrchestrationError::schedule_not_found(schedule_id))?;
        self.transition_and_arm(&slot, ScheduleStatus::Stopped)?;
        info!(schedule_id = schedule_id, "Schedule stopped");
        self.publish(events::SCHEDULE_STOPPED, json!({"schedule_id": schedule_id}))
            .await;
        Ok(self.info(&slot))
    }

    pub fn get(&self, schedule_id: &str) -> Option<ScheduleInfo> {
        self.slot(schedule_id).map(|slot| self.info(&slot))
    }

    pub fn status(&self, schedule_id: &str) -> Option<ScheduleStatus> {
        self.slot(schedule_id).map(|slot| *slot.status.lock())
    }

    /// Every registered schedule, oldest first
    pub fn list(&self) -> Vec<ScheduleInfo> {
        let slots: Vec<Arc<ScheduleSlot>> = self.inner.schedules.read().values().cloned().collect();
        let mut infos: Vec<ScheduleInfo> = slots.iter().map(|slot| self.info(slot)).collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.definition.id.cmp(&b.definition.id))
        });
        infos
    }

    /// Run a schedule now, outside its trigger. Works for pending and paused schedules;
    /// the overlap and retry policies still apply.
    pub async fn trigger_now(&self, schedule_id: &str) -> OrchestrationResult<RunOutcome> {
        let slot = self.require_slot(schedule_id)?;
        Ok(self.run(slot, Utc::now(), true).await)
    }

    /// Disarm and stop every schedule, then wait up to `grace` for in-flight runs
    pub async fn shutdown(&self, grace: Duration) -> OrchestrationResult<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let slots: Vec<Arc<ScheduleSlot>> = self.inner.schedules.write().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            self.disarm(slot);
            *slot.status.lock() = ScheduleStatus::Stopped;
            self.publish(
                events::SCHEDULE_STOPPED,
                json!({"schedule_id": slot.definition.id, "reason": "shutdown"}),
            )
            .await;
        }
        self.inner.cron.stop();
        self.inner.interval.clear_all();
        self.inner.priority.stop();
        let dropped = self.inner.priority.clear();
        if dropped > 0 {
            warn!(dropped = dropped, "Dropped queued priority runs at shutdown");
        }

        let drained = tokio::time::timeout(grace, async {
            loop {
                let idle = self.inner.idle.notified();
                if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!(schedules = slots.len(), "Scheduler shut down");
                Ok(())
            }
            Err(_) => Err(OrchestrationError::operation_timeout("scheduler shutdown", grace)
                .with_context(
                    "in_flight",
                    json!(self.inner.in_flight.load(Ordering::Acquire)),
                )),
        }
    }

    fn slot(&self, schedule_id: &str) -> Option<Arc<ScheduleSlot>> {
        self.inner.schedules.read().get(schedule_id).cloned()
    }

    fn require_slot(&self, schedule_id: &str) -> OrchestrationResult<Arc<ScheduleSlot>> {
        self.slot(schedule_id)
            .ok_or_else(|| OrchestrationError::schedule_not_found(schedule_id))
    }

    fn info(&self, slot: &ScheduleSlot) -> ScheduleInfo {
        let status = *slot.status.lock();
        let cron_armed = matches!(*slot.armed.lock(), Some(ArmedTrigger::Cron));
        let next_run_at = (cron_armed && status == ScheduleStatus::Active)
            .then(|| self.inner.cron.next_run(&slot.definition.id))
            .flatten();
        ScheduleInfo {
            definition: slot.definition.clone(),
            status,
            created_at: slot.created_at,
            next_run_at,
            in_flight: slot.running.load(Ordering::Acquire),
            stats: slot.stats.lock().clone(),
        }
    }

    fn validate_trigger(&self, trigger: &TriggerSpec) -> OrchestrationResult<()> {
        match trigger {
            TriggerSpec::Cron { expression, timezone } => {
                CronExpression::parse(expression)?;
                parse_timezone(timezone.as_deref())?;
            }
            TriggerSpec::Interval { .. } | TriggerSpec::Priority { .. } => {}
            TriggerSpec::Conditional { condition, base } => {
                if !self.inner.conditional.has_condition(condition) {
                    return Err(OrchestrationError::invalid_schedule(format!(
                        "condition '{condition}' is not registered"
                    )));
                }
                if let BaseTrigger::Cron { expression } = base {
                    CronExpression::parse(expression)?;
                }
            }
            TriggerSpec::Distributed { cron, .. } => {
                if self.inner.distributed.is_none() {
                    return Err(OrchestrationError::invalid_schedule(
                        "distributed schedules need a DistributedScheduler",
                    ));
                }
                CronExpression::parse(cron)?;
            }
        }
        Ok(())
    }

    /// Move `slot` to `next`, arming or disarming its trigger to match
    fn transition_and_arm(&self, slot: &Arc<ScheduleSlot>, next: ScheduleStatus) -> OrchestrationResult<()> {
        let mut status = slot.status.lock();
        if !status.can_transition_to(next) {
            return Err(OrchestrationError::invalid_transition(
                &format!("schedule '{}'", slot.definition.id),
                *status,
                next,
            ));
        }
        if next == ScheduleStatus::Active {
            self.arm(slot)?;
        } else {
            self.disarm(slot);
        }
        *status = next;
        Ok(())
    }

    fn arm(&self, slot: &ScheduleSlot) -> OrchestrationResult<()> {
        let id = &slot.definition.id;
        let config = &self.inner.config;
        let armed = match &slot.definition.trigger {
            TriggerSpec::Cron { expression, timezone } => {
                let timezone = parse_timezone(timezone.as_deref())?.unwrap_or(config.timezone);
                self.inner.cron.add_job_in(
                    id,
                    CronExpression::parse(expression)?,
                    timezone,
                    self.tick_callback(id, TickGate::Direct),
                )?;
                ArmedTrigger::Cron
            }
            TriggerSpec::Interval { every, jitter } => {
                ArmedTrigger::Interval(self.inner.interval.schedule_with_jitter(
                    *every,
                    jitter.unwrap_or(config.max_interval_jitter),
                    self.tick_callback(id, TickGate::Direct),
                )?)
            }
            TriggerSpec::Priority { priority, every } => {
                self.ensure_priority_dispatcher();
                ArmedTrigger::Interval(
                    self.inner
                        .interval
                        .schedule(*every, self.tick_callback(id, TickGate::Priority(*priority)))?,
                )
            }
            TriggerSpec::Conditional { condition, base } => {
                let callback = self.tick_callback(id, TickGate::Condition(condition.clone()));
                match base {
                    BaseTrigger::Cron { expression } => {
                        self.inner.cron.add_job_in(
                            id,
                            CronExpression::parse(expression)?,
                            config.conditional.timezone,
                            callback,
                        )?;
                        ArmedTrigger::Cron
                    }
                    BaseTrigger::Interval { every } => {
                        ArmedTrigger::Interval(self.inner.interval.schedule(*every, callback)?)
                    }
                }
            }
            TriggerSpec::Distributed { cron, lock_ttl } => {
                let distributed = self.inner.distributed.as_ref().ok_or_else(|| {
                    OrchestrationError::invalid_schedule("distributed schedules need a DistributedScheduler")
                })?;
                self.inner.cron.add_job_in(
                    id,
                    CronExpression::parse(cron)?,
                    distributed.config().timezone,
                    self.tick_callback(id, TickGate::Distributed(*lock_ttl)),
                )?;
                ArmedTrigger::Cron
            }
        };
        *slot.armed.lock() = Some(armed);
        Ok(())
    }

    fn disarm(&self, slot: &ScheduleSlot) {
        let armed = slot.armed.lock().take();
        match armed {
            Some(ArmedTrigger::Cron) => {
                self.inner.cron.remove_job(&slot.definition.id);
            }
            Some(ArmedTrigger::Interval(handle)) => {
                self.inner.interval.clear(handle);
            }
            None => {}
        }
    }

    fn ensure_priority_dispatcher(&self) {
        if self.inner.priority.is_running() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.priority.start(move |job: PriorityJob| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let scheduler = Scheduler { inner };
                let Some(slot) = job.schedule_id.as_deref().and_then(|id| scheduler.slot(id)) else {
                    debug!(job_id = %job.id, "Schedule gone before priority run");
                    return;
                };
                scheduler.run(slot, job.enqueued_at, false).await;
            }
        });
    }

    /// Trigger callbacks hold the scheduler weakly so dropping it ends every loop
    fn tick_callback(&self, schedule_id: &str, gate: TickGate) -> JobCallback {
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let schedule_id = schedule_id.to_string();
        job_fn(move |fire_time| {
            if let Some(inner) = weak.upgrade() {
                Scheduler { inner }.on_tick(&schedule_id, fire_time, &gate);
            }
            async {}
        })
    }

    fn on_tick(&self, schedule_id: &str, fire_time: DateTime<Utc>, gate: &TickGate) {
        let Some(slot) = self.slot(schedule_id) else {
            return;
        };
        let scheduler = self.clone();

        match gate.clone() {
            TickGate::Direct => {
                tokio::spawn(async move {
                    scheduler.run(slot, fire_time, false).await;
                });
            }
            TickGate::Priority(priority) => {
                let job = PriorityJob::new(
                    format!("{schedule_id}:{}", fire_time.timestamp_millis()),
                    priority,
                    slot.definition.workflow_id.clone(),
                )
                .with_input(slot.definition.input.clone())
                .for_schedule(schedule_id);
                self.inner.priority.enqueue(job);
            }
            TickGate::Condition(condition) => {
                tokio::spawn(async move {
                    match scheduler.inner.conditional.evaluate(&condition, fire_time) {
                        Ok(true) => {
                            scheduler.run(slot, fire_time, false).await;
                        }
                        Ok(false) => scheduler.record_skip(&slot, SkipReason::ConditionFalse).await,
                        Err(err) => {
                            warn!(schedule_id = %slot.definition.id, error = %err, "Condition unavailable");
                            scheduler.record_skip(&slot, SkipReason::ConditionFalse).await;
                        }
                    }
                });
            }
            TickGate::Distributed(lock_ttl) => {
                tokio::spawn(async move {
                    let Some(distributed) = scheduler.inner.distributed.clone() else {
                        return;
                    };
                    let id = slot.definition.id.clone();
                    let runner = scheduler.clone();
                    let run_slot = Arc::clone(&slot);
                    let outcome = distributed
                        .execute_exclusive(&id, fire_time, lock_ttl, || async move {
                            runner.run(run_slot, fire_time, false).await;
                        })
                        .await;
                    match outcome {
                        Ok(true) => {}
                        Ok(false) => scheduler.record_skip(&slot, SkipReason::LockHeld).await,
                        Err(err) => {
                            warn!(schedule_id = %id, error = %err, "Distributed lock unavailable");
                            scheduler.record_skip(&slot, SkipReason::LockHeld).await;
                        }
                    }
                });
            }
        }
    }

    async fn run(&self, slot: Arc<ScheduleSlot>, fire_time: DateTime<Utc>, manual: bool) -> RunOutcome {
        if !manual && *slot.status.lock() != ScheduleStatus::Active {
            return RunOutcome::Skipped {
                reason: SkipReason::Inactive,
            };
        }

        let policy = slot
            .definition
            .overlap_policy
            .unwrap_or(self.inner.config.overlap_policy);
        let _queued = match policy {
            OverlapPolicy::SkipIfRunning => {
                if slot
                    .running
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    self.record_skip(&slot, SkipReason::AlreadyRunning).await;
                    return RunOutcome::Skipped {
                        reason: SkipReason::AlreadyRunning,
                    };
                }
                None
            }
            OverlapPolicy::Queue => {
                let guard = slot.queue.lock().await;
                slot.running.fetch_add(1, Ordering::AcqRel);
                Some(guard)
            }
            OverlapPolicy::Allow => {
                slot.running.fetch_add(1, Ordering::AcqRel);
                None
            }
        };
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = RunGuard {
            slot: Arc::clone(&slot),
            inner: Arc::clone(&self.inner),
        };

        let definition = &slot.definition;
        {
            let mut stats = slot.stats.lock();
            stats.run_count += 1;
            stats.last_run_at = Some(Utc::now());
        }
        self.publish(
            events::SCHEDULE_TRIGGERED,
            json!({
                "schedule_id": definition.id,
                "workflow_id": definition.workflow_id,
                "fire_time": fire_time,
                "manual": manual,
            }),
        )
        .await;

        let retry = definition
            .retry
            .as_ref()
            .unwrap_or(&self.inner.config.default_retry)
            .to_retry_policy();
        let runner = Arc::clone(&self.inner.runner);
        let (result, attempts) = run_with_retry(&retry, &definition.id, |attempt| {
            let runner = Arc::clone(&runner);
            let workflow_id = definition.workflow_id.clone();
            let input = definition.input.clone();
            async move {
                let result = AssertUnwindSafe(async { runner.run(&workflow_id, input).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(OrchestrationError::workflow_execution(
                            workflow_id.clone(),
                            format!("workflow runner {}", panic_message(panic.as_ref())),
                        ))
                    });
                result.map_err(|err| err.with_context("attempt", json!(attempt)))
            }
        })
        .await;

        match result {
            Ok(output) => {
                slot.stats.lock().success_count += 1;
                debug!(schedule_id = %definition.id, attempts = attempts, "Scheduled run completed");
                self.publish(
                    events::SCHEDULE_COMPLETED,
                    json!({
                        "schedule_id": definition.id,
                        "workflow_id": definition.workflow_id,
                        "attempts": attempts,
                        "output": output,
                    }),
                )
                .await;
                RunOutcome::Completed { output, attempts }
            }
            Err(error) => {
                let error_json = error.to_json();
                {
                    let mut stats = slot.stats.lock();
                    stats.failure_count += 1;
                    stats.last_error = Some(error_json.clone());
                }
                warn!(
                    schedule_id = %definition.id,
                    attempts = attempts,
                    error = %error,
                    "Scheduled run failed"
                );
                let mut context = LogContext::new();
                context.insert("schedule_id".to_string(), json!(definition.id));
                context.insert("attempts".to_string(), json!(attempts));
                context.insert("error".to_string(), error_json.clone());
                logging::emit(
                    self.inner.log_sink.as_ref(),
                    LogLevel::Error,
                    "scheduled run failed",
                    context,
                );

                self.publish(
                    events::SCHEDULE_FAILED,
                    json!({
                        "schedule_id": definition.id,
                        "workflow_id": definition.workflow_id,
                        "attempts": attempts,
                        "error": error_json,
                    }),
                )
                .await;

                if let Some(alert) = self
                    .inner
                    .error_handler
                    .handle_failure(&definition.id, &definition.workflow_id, &error)
                    .await
                {
                    let payload = serde_json::to_value(&alert).unwrap_or(Value::Null);
                    self.publish(events::SCHEDULE_ALERT, payload).await;
                }
                RunOutcome::Failed { error, attempts }
            }
        }
    }

    async fn record_skip(&self, slot: &ScheduleSlot, reason: SkipReason) {
        slot.stats.lock().skipped_count += 1;
        debug!(schedule_id = %slot.definition.id, reason = %reason, "Scheduled run skipped");
        self.publish(
            events::SCHEDULE_SKIPPED,
            json!({"schedule_id": slot.definition.id, "reason": reason}),
        )
        .await;
    }

    async fn publish(&self, topic: &str, data: Value) {
        if let Some(bus) = &self.inner.event_bus {
            if let Err(err) = bus.emit_from("scheduler", topic, data).await {
                warn!(topic = topic, error = %err, "Failed to publish scheduler event");
            }
        }
    }
}

fn parse_timezone(name: Option<&str>) -> OrchestrationResult<Option<Tz>> {
    name.map(|name| {
        Tz::from_str(name).map_err(|_| {
            OrchestrationError::invalid_schedule(format!("unknown timezone '{name}'"))
        })
    })
    .transpose()
}
