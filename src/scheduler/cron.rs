//! Cron expressions and the cron ticking loop.
//!
//! Expressions have five fields at minute resolution:
//!
//! ```text
//! ┌─ minute        0-59
//! │ ┌─ hour        0-23
//! │ │ ┌─ day       1-31
//! │ │ │ ┌─ month   1-12 or JAN-DEC
//! │ │ │ │ ┌─ weekday 0-7 or SUN-SAT (0 and 7 are Sunday)
//! * * * * *
//! ```
//!
//! Each field accepts `*`, lists (`1,15`), ranges (`9-17`) and steps (`*/5`, `10-40/10`).
//! The macros `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight` and
//! `@hourly` are recognized. When both day fields are restricted a day matches if either
//! does, as in classic cron.

use super::types::{fire, JobCallback};
use crate::error::{OrchestrationError, OrchestrationResult};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Years searched ahead before giving up on an expression that never matches (e.g. `0 0 31 2 *`)
const SEARCH_HORIZON_YEARS: i32 = 5;

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_offset: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_offset: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day of month",
    min: 1,
    max: 31,
    names: &[],
    name_offset: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    name_offset: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day of week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
    name_offset: 0,
};

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_any: bool,
    day_of_week_any: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> OrchestrationResult<Self> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let field = |text: &str, spec: &FieldSpec| {
            parse_field(text, spec).map_err(|reason| invalid(expression, reason))
        };

        let mut days_of_week = field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes: field(fields[0], &MINUTE)?,
            hours: field(fields[1], &HOUR)?,
            days_of_month: field(fields[2], &DAY_OF_MONTH)?,
            months: field(fields[3], &MONTH)?,
            days_of_week,
            day_of_month_any: fields[2].starts_with('*'),
            day_of_week_any: fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a local wall-clock minute matches
    pub fn matches_local(&self, local: &NaiveDateTime) -> bool {
        bit(self.minutes, local.minute())
            && bit(self.hours, local.hour())
            && bit(self.months, local.month())
            && self.day_matches(&local.date())
    }

    pub fn matches<T: TimeZone>(&self, instant: &DateTime<T>) -> bool {
        self.matches_local(&instant.naive_local())
    }

    fn day_matches(&self, date: &NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.day_of_month_any || self.day_of_week_any {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First matching minute strictly after `after`, evaluated in `timezone`.
    ///
    /// Local times skipped by a DST transition never fire; a repeated local time fires once,
    /// at its earlier occurrence.
    pub fn next_after(&self, after: DateTime<Utc>, timezone: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(timezone).naive_local();
        let mut candidate = local.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);
        let horizon = candidate.year() + SEARCH_HORIZON_YEARS;

        while candidate.year() <= horizon {
            if !bit(self.months, candidate.month()) {
                candidate = first_of_next_month(&candidate)?;
                continue;
            }
            if !self.day_matches(&candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = candidate.date().and_hms_opt(candidate.hour(), 0, 0)?
                    + chrono::Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate += chrono::Duration::minutes(1);
                continue;
            }

            if let Some(resolved) = timezone.from_local_datetime(&candidate).earliest() {
                let utc = resolved.with_timezone(&Utc);
                if utc > after {
                    return Some(utc);
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

impl FromStr for CronExpression {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(current: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if current.month() == 12 {
        (current.year() + 1, 1)
    } else {
        (current.year(), current.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(text: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut mask = 0u64;
    for item in text.split(',') {
        if item.is_empty() {
            return Err(format!("empty list entry in {} field", spec.name));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            match step {
                Some(_) => (value, spec.max),
                None => (value, value),
            }
        };

        if start > end {
            return Err(format!("range {start}-{end} is reversed in {} field", spec.name));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(value) => value,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|index| index as u32 + spec.name_offset)
            .ok_or_else(|| format!("invalid value '{text}' in {} field", spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{value} is outside {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn invalid(expression: &str, reason: impl fmt::Display) -> OrchestrationError {
    OrchestrationError::invalid_schedule(format!("invalid cron expression '{expression}': {reason}"))
}

struct CronJob {
    expression: Arc<CronExpression>,
    timezone: Tz,
    callback: JobCallback,
    task: Option<JoinHandle<()>>,
}

struct CronInner {
    timezone: Tz,
    running: AtomicBool,
    jobs: Mutex<HashMap<String, CronJob>>,
}

/// Fires registered callbacks at each matching minute.
///
/// Every job gets its own tokio task that sleeps until the next match. Callbacks are awaited
/// before the following tick is computed, so long-running work should be spawned by the
/// callback itself.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<CronInner>,
}

impl fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronScheduler")
            .field("timezone", &self.inner.timezone)
            .field("running", &self.is_running())
            .field("jobs", &self.len())
            .finish()
    }
}

impl CronScheduler {
    pub fn new(timezone: Tz) -> Self {
        Self {
            inner: Arc::new(CronInner {
                timezone,
                running: AtomicBool::new(false),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.timezone
    }

    /// Register a job evaluated in the scheduler's timezone
    pub fn add_job(&self, id: &str, expression: &str, callback: JobCallback) -> OrchestrationResult<()> {
        let expression = CronExpression::parse(expression)?;
        self.add_job_in(id, expression, self.inner.timezone, callback)
    }

    /// Register a job evaluated in an explicit timezone
    pub fn add_job_in(
        &self,
        id: &str,
        expression: CronExpression,
        timezone: Tz,
        callback: JobCallback,
    ) -> OrchestrationResult<()> {
        let mut jobs = self.inner.jobs.lock();
        if jobs.contains_key(id) {
            return Err(OrchestrationError::invalid_schedule(format!(
                "cron job '{id}' is already registered"
            )));
        }

        let expression = Arc::new(expression);
        let task = self.is_running().then(|| {
            spawn_job_loop(
                id.to_string(),
                Arc::clone(&expression),
                timezone,
                Arc::clone(&callback),
            )
        });
        debug!(job_id = id, expression = %expression, timezone = %timezone, "Cron job added");
        jobs.insert(
            id.to_string(),
            CronJob {
                expression,
                timezone,
                callback,
                task,
            },
        );
        Ok(())
    }

    pub fn remove_job(&self, id: &str) -> bool {
        match self.inner.jobs.lock().remove(id) {
            Some(job) => {
                if let Some(task) = job.task {
                    task.abort();
                }
                debug!(job_id = id, "Cron job removed");
                true
            }
            None => false,
        }
    }

    /// Arm every registered job. Jobs added later start immediately.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut jobs = self.inner.jobs.lock();
        for (id, job) in jobs.iter_mut() {
            if job.task.is_none() {
                job.task = Some(spawn_job_loop(
                    id.clone(),
                    Arc::clone(&job.expression),
                    job.timezone,
                    Arc::clone(&job.callback),
                ));
            }
        }
        info!(jobs = jobs.len(), "⏰ Cron scheduler started");
    }

    /// Disarm every job. Registrations are kept; `start` re-arms them.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut jobs = self.inner.jobs.lock();
        for job in jobs.values_mut() {
            if let Some(task) = job.task.take() {
                task.abort();
            }
        }
        info!("Cron scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Next fire time of a job, computed from now
    pub fn next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        let jobs = self.inner.jobs.lock();
        let job = jobs.get(id)?;
        job.expression.next_after(Utc::now(), &job.timezone)
    }
}

fn spawn_job_loop(
    id: String,
    expression: Arc<CronExpression>,
    timezone: Tz,
    callback: JobCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let clock = TickClock::new();
        let mut reference = clock.now();
        loop {
            let Some(next) = expression.next_after(reference, &timezone) else {
                warn!(job_id = %id, expression = %expression, "Cron expression has no upcoming match");
                break;
            };
            let wait = (next - clock.now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            fire(&callback, &id, next).await;
            reference = next.max(clock.now());
        }
    })
}

/// Wall-clock time derived from the runtime's monotonic clock, anchored once per loop.
///
/// Keeps tick arithmetic consistent with `tokio::time::sleep`, including under a paused
/// test clock.
pub(crate) struct TickClock {
    wall: DateTime<Utc>,
    instant: tokio::time::Instant,
}

impl TickClock {
    pub(crate) fn new() -> Self {
        Self {
            wall: Utc::now(),
            instant: tokio::time::Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.instant.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}
