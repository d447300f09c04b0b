//! Fixed-delay repetition with optional jitter.

use super::cron::TickClock;
use super::types::{fire, JobCallback};
use crate::error::{OrchestrationError, OrchestrationResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifies one repeating callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalHandle(u64);

impl fmt::Display for IntervalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval-{}", self.0)
    }
}

/// Runs callbacks repeatedly, waiting `every` plus a random jitter between runs.
///
/// The delay counts from the end of the previous callback, so a callback never overlaps
/// itself. Jitter is drawn uniformly from `0..=max_jitter` before every wait.
#[derive(Clone)]
pub struct IntervalScheduler {
    default_jitter: Duration,
    next_handle: Arc<AtomicU64>,
    tasks: Arc<Mutex<HashMap<IntervalHandle, JoinHandle<()>>>>,
}

impl fmt::Debug for IntervalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field("default_jitter", &self.default_jitter)
            .field("active", &self.active_count())
            .finish()
    }
}

impl Default for IntervalScheduler {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl IntervalScheduler {
    /// `default_jitter` applies to `schedule`; `schedule_with_jitter` overrides it
    pub fn new(default_jitter: Duration) -> Self {
        Self {
            default_jitter,
            next_handle: Arc::new(AtomicU64::new(1)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn schedule(&self, every: Duration, callback: JobCallback) -> OrchestrationResult<IntervalHandle> {
        self.schedule_with_jitter(every, self.default_jitter, callback)
    }

    pub fn schedule_with_jitter(
        &self,
        every: Duration,
        max_jitter: Duration,
        callback: JobCallback,
    ) -> OrchestrationResult<IntervalHandle> {
        if every.is_zero() {
            return Err(OrchestrationError::invalid_schedule(
                "interval must be greater than zero",
            ));
        }

        let handle = IntervalHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(async move {
            let clock = TickClock::new();
            let job_id = handle.to_string();
            loop {
                tokio::time::sleep(every + jitter(max_jitter)).await;
                fire(&callback, &job_id, clock.now()).await;
            }
        });

        self.tasks.lock().insert(handle, task);
        debug!(handle = %handle, every_ms = every.as_millis() as u64, "Interval scheduled");
        Ok(handle)
    }

    /// Stop one callback. Returns false for unknown handles.
    pub fn clear(&self, handle: IntervalHandle) -> bool {
        match self.tasks.lock().remove(&handle) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every callback, returning how many were running
    pub fn clear_all(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let count = tasks.len();
        for (_, task) in tasks.drain() {
            task.abort();
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(fastrand::u64(0..=max_ms))
}
