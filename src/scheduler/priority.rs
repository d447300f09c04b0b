//! Priority queue with a bounded-concurrency dispatcher.

use super::types::Priority;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A unit of work waiting in the priority queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityJob {
    pub id: String,
    pub priority: Priority,
    /// Schedule that produced the job, when it came from a trigger
    pub schedule_id: Option<String>,
    pub workflow_id: String,
    pub input: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl PriorityJob {
    pub fn new(id: impl Into<String>, priority: Priority, workflow_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority,
            schedule_id: None,
            workflow_id: workflow_id.into(),
            input: Value::Null,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn for_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }
}

type JobHandler = Arc<dyn Fn(PriorityJob) -> BoxFuture<'static, ()> + Send + Sync>;

struct PriorityInner {
    /// One FIFO per level, indexed by `Priority::index`
    queues: Mutex<[VecDeque<PriorityJob>; 4]>,
    available: Notify,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    dispatched: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Strict priority ordering (Critical > High > Normal > Low), FIFO within a level.
///
/// `enqueue`/`dequeue` work standalone. `start` spawns a dispatcher that hands jobs to a
/// handler with at most `max_concurrency` handlers in flight.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<PriorityInner>,
}

impl fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("queued", &self.size())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PriorityScheduler {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner: Arc::new(PriorityInner {
                queues: Mutex::new(Default::default()),
                available: Notify::new(),
                permits: Arc::new(Semaphore::new(max_concurrency)),
                max_concurrency,
                dispatched: AtomicU64::new(0),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    pub fn enqueue(&self, job: PriorityJob) {
        debug!(job_id = %job.id, priority = %job.priority, "Job enqueued");
        self.inner.queues.lock()[job.priority.index()].push_back(job);
        self.inner.available.notify_one();
    }

    /// Highest-priority job, oldest first within its level
    pub fn dequeue(&self) -> Option<PriorityJob> {
        let mut queues = self.inner.queues.lock();
        queues.iter_mut().find_map(|queue| queue.pop_front())
    }

    pub fn peek_priority(&self) -> Option<Priority> {
        let queues = self.inner.queues.lock();
        Priority::ALL
            .into_iter()
            .find(|priority| !queues[priority.index()].is_empty())
    }

    pub fn size(&self) -> usize {
        self.inner.queues.lock().iter().map(VecDeque::len).sum()
    }

    pub fn size_of(&self, priority: Priority) -> usize {
        self.inner.queues.lock()[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop every queued job, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut queues = self.inner.queues.lock();
        let count = queues.iter().map(VecDeque::len).sum();
        queues.iter_mut().for_each(VecDeque::clear);
        count
    }

    /// Jobs handed to a handler since creation
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Handlers currently holding a concurrency slot
    pub fn in_flight(&self) -> usize {
        self.inner.max_concurrency - self.inner.permits.available_permits()
    }

    pub fn is_running(&self) -> bool {
        self.inner.dispatcher.lock().is_some()
    }

    /// Spawn the dispatcher. A second call while running is a no-op.
    pub fn start<F, Fut>(&self, handler: F)
    where
        F: Fn(PriorityJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }

        let handler: JobHandler = Arc::new(move |job| handler(job).boxed());
        let scheduler = self.clone();
        *dispatcher = Some(tokio::spawn(async move {
            scheduler.dispatch_loop(handler).await;
        }));
        info!(
            max_concurrency = self.inner.max_concurrency,
            "🚦 Priority dispatcher started"
        );
    }

    /// Stop taking jobs off the queue. Running handlers finish; queued jobs stay queued.
    pub fn stop(&self) {
        if let Some(task) = self.inner.dispatcher.lock().take() {
            task.abort();
            info!("Priority dispatcher stopped");
        }
    }

    async fn dispatch_loop(&self, handler: JobHandler) {
        loop {
            let Ok(permit) = Arc::clone(&self.inner.permits).acquire_owned().await else {
                break;
            };

            let job = loop {
                let notified = self.inner.available.notified();
                if let Some(job) = self.dequeue() {
                    break job;
                }
                notified.await;
            };

            self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler(job).await;
                drop(permit);
            });
        }
    }
}
