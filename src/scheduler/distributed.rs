//! Lock-coordinated scheduling across a fleet of nodes.
//!
//! Every node registers the same cron jobs. At each tick all nodes race for a lock keyed by
//! job id and tick minute; only the holder runs the job. Locks are never released after a
//! run: they expire through their TTL, so a node whose clock lags cannot re-acquire a tick
//! that another node already ran. While a run is in progress the holder extends the lock
//! with heartbeats.
//!
//! Membership uses the same provider: `join` takes a per-node lock and keeps it alive,
//! `leave` releases it. A crashed node's membership and job locks lapse through TTL expiry.

use super::conditional::tz_name;
use super::cron::{CronExpression, CronScheduler};
use super::types::{job_fn, JobCallback};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::utils::unwind::panic_message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// External lock service. `owner` identifies the node so that only the holder can extend
/// or release a lock.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take `key` for `ttl` if it is free or expired. Returns whether the lock was taken.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> OrchestrationResult<bool>;

    /// Release `key` if `owner` holds it
    async fn release(&self, key: &str, owner: &str) -> OrchestrationResult<bool>;

    /// Extend `key` by `ttl` if `owner` still holds it
    async fn heartbeat(&self, key: &str, owner: &str, ttl: Duration) -> OrchestrationResult<bool>;
}

/// Process-local lock provider with TTL semantics.
///
/// Clones share state, so several `DistributedScheduler`s built from clones behave like
/// nodes sharing one lock service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    locks: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of an unexpired lock
    pub fn holder(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock();
        locks
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(owner, _)| owner.clone())
    }

    pub fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .locks
            .lock()
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> OrchestrationResult<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some((holder, expires_at)) if *expires_at > now && holder != owner => Ok(false),
            _ => {
                locks.insert(key.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> OrchestrationResult<bool> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some((holder, _)) if holder == owner => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, key: &str, owner: &str, ttl: Duration) -> OrchestrationResult<bool> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        match locks.get_mut(key) {
            Some((holder, expires_at)) if holder == owner && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedSchedulerConfig {
    /// Unique per process; used as the lock owner
    pub node_id: String,
    #[serde(with = "tz_name")]
    pub timezone: Tz,
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub lock_ttl: Duration,
    /// Must be shorter than `lock_ttl`
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub heartbeat_interval: Duration,
    /// Upper bound on each release call made by `leave`
    #[serde(with = "crate::utils::serde::duration_ms")]
    pub leave_timeout: Duration,
    pub key_prefix: String,
}

impl DistributedSchedulerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timezone: chrono_tz::UTC,
            lock_ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            leave_timeout: Duration::from_secs(5),
            key_prefix: "orchestration:scheduler".to_string(),
        }
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(OrchestrationError::configuration("distributed node_id must not be empty"));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lock_ttl {
            return Err(OrchestrationError::configuration(format!(
                "heartbeat_interval ({}ms) must be non-zero and shorter than lock_ttl ({}ms)",
                self.heartbeat_interval.as_millis(),
                self.lock_ttl.as_millis()
            )));
        }
        Ok(())
    }
}

/// A cron job that runs on one node per tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedJob {
    pub id: String,
    pub cron: String,
    /// Overrides the configured lock TTL for this job
    pub lock_ttl: Option<Duration>,
}

struct DistributedInner {
    config: DistributedSchedulerConfig,
    provider: Arc<dyn LockProvider>,
    cron: CronScheduler,
    joined: AtomicBool,
    /// Locks this node holds for runs in progress
    held: Mutex<HashSet<String>>,
    membership: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DistributedInner {
    fn drop(&mut self) {
        self.cron.stop();
        if let Some(task) = self.membership.lock().take() {
            task.abort();
        }
    }
}

/// A tick lock held for a run in progress. Dropping it stops the heartbeat and forgets
/// the key, so a panicking or cancelled run leaves the lock to expire via its TTL.
struct HeldTick<'a> {
    held: &'a Mutex<HashSet<String>>,
    key: String,
    heartbeat: JoinHandle<()>,
}

impl Drop for HeldTick<'_> {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.held.lock().remove(&self.key);
    }
}

#[derive(Clone)]
pub struct DistributedScheduler {
    inner: Arc<DistributedInner>,
}

impl fmt::Debug for DistributedScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedScheduler")
            .field("node_id", &self.inner.config.node_id)
            .field("joined", &self.is_joined())
            .finish()
    }
}

impl DistributedScheduler {
    pub fn new(
        config: DistributedSchedulerConfig,
        provider: Arc<dyn LockProvider>,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DistributedInner {
                cron: CronScheduler::new(config.timezone),
                config,
                provider,
                joined: AtomicBool::new(false),
                held: Mutex::new(HashSet::new()),
                membership: Mutex::new(None),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &DistributedSchedulerConfig {
        &self.inner.config
    }

    pub fn is_joined(&self) -> bool {
        self.inner.joined.load(Ordering::Acquire)
    }

    fn membership_key(&self) -> String {
        format!("{}:nodes:{}", self.inner.config.key_prefix, self.inner.config.node_id)
    }

    /// Lock key for one tick of one job
    pub fn tick_key(&self, job_id: &str, fire_time: DateTime<Utc>) -> String {
        format!(
            "{}:{}:{}",
            self.inner.config.key_prefix,
            job_id,
            fire_time.timestamp().div_euclid(60)
        )
    }

    /// Register this node and arm its jobs
    pub async fn join(&self) -> OrchestrationResult<()> {
        if self.is_joined() {
            return Ok(());
        }
        let config = &self.inner.config;
        let key = self.membership_key();
        if !self
            .inner
            .provider
            .acquire(&key, &config.node_id, config.lock_ttl)
            .await?
        {
            return Err(OrchestrationError::lock(format!(
                "node id '{}' is already active in the cluster",
                config.node_id
            )));
        }

        let provider = Arc::clone(&self.inner.provider);
        let (node_id, ttl, interval) = (config.node_id.clone(), config.lock_ttl, config.heartbeat_interval);
        let heartbeat_key = key.clone();
        *self.inner.membership.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match provider.heartbeat(&heartbeat_key, &node_id, ttl).await {
                    Ok(true) => {}
                    Ok(false) => warn!(node_id = %node_id, "Membership lock lost"),
                    Err(err) => warn!(node_id = %node_id, error = %err, "Membership heartbeat failed"),
                }
            }
        }));

        self.inner.joined.store(true, Ordering::Release);
        self.inner.cron.start();
        info!(node_id = %config.node_id, "🌐 Joined distributed scheduler");
        Ok(())
    }

    /// Deregister this node. Release failures and slow lock services are tolerated: each
    /// release is bounded by `leave_timeout` and anything left behind expires via its TTL.
    pub async fn leave(&self) -> OrchestrationResult<()> {
        if !self.inner.joined.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cron.stop();
        if let Some(task) = self.inner.membership.lock().take() {
            task.abort();
        }

        let mut keys: Vec<String> = self.inner.held.lock().drain().collect();
        keys.push(self.membership_key());

        let config = &self.inner.config;
        for key in keys {
            match tokio::time::timeout(
                config.leave_timeout,
                self.inner.provider.release(&key, &config.node_id),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(key = %key, error = %err, "Lock release failed, leaving it to expire"),
                Err(_) => warn!(key = %key, "Lock release timed out, leaving it to expire"),
            }
        }

        info!(node_id = %config.node_id, "Left distributed scheduler");
        Ok(())
    }

    /// Run `work` if this node wins the lock for `(job_id, fire_time)`.
    ///
    /// Returns `Ok(false)` without running when the node has not joined or another node
    /// holds the tick. A panic in `work` is logged and the tick still counts as run here.
    pub async fn execute_exclusive<F, Fut>(
        &self,
        job_id: &str,
        fire_time: DateTime<Utc>,
        lock_ttl: Option<Duration>,
        work: F,
    ) -> OrchestrationResult<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.is_joined() {
            debug!(job_id = job_id, "Not joined, skipping distributed tick");
            return Ok(false);
        }

        let config = &self.inner.config;
        let ttl = lock_ttl.unwrap_or(config.lock_ttl);
        let key = self.tick_key(job_id, fire_time);
        if !self.inner.provider.acquire(&key, &config.node_id, ttl).await? {
            debug!(job_id = job_id, key = %key, "Tick held by another node");
            return Ok(false);
        }
        self.inner.held.lock().insert(key.clone());

        let heartbeat = {
            let provider = Arc::clone(&self.inner.provider);
            let (key, node_id) = (key.clone(), config.node_id.clone());
            let interval = config.heartbeat_interval.min(ttl / 2).max(Duration::from_millis(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match provider.heartbeat(&key, &node_id, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(key = %key, "Lost job lock during run");
                            break;
                        }
                        Err(err) => warn!(key = %key, error = %err, "Job lock heartbeat failed"),
                    }
                }
            })
        };

        let _tick = HeldTick {
            held: &self.inner.held,
            key: key.clone(),
            heartbeat,
        };

        if let Err(panic) = AssertUnwindSafe(async { work().await }).catch_unwind().await {
            error!(
                job_id = job_id,
                key = %key,
                reason = %panic_message(panic.as_ref()),
                "Distributed run panicked"
            );
        }
        Ok(true)
    }

    /// Register a cron job that runs on one node per tick
    pub fn schedule(&self, job: DistributedJob, callback: JobCallback) -> OrchestrationResult<()> {
        let expression = CronExpression::parse(&job.cron)?;
        let weak = Arc::downgrade(&self.inner);
        let job_id = job.id.clone();
        let lock_ttl = job.lock_ttl;
        self.inner.cron.add_job_in(
            &job.id,
            expression,
            self.inner.config.timezone,
            job_fn(move |fire_time| {
                let scheduler = weak.upgrade().map(|inner| DistributedScheduler { inner });
                let job_id = job_id.clone();
                let callback = Arc::clone(&callback);
                async move {
                    let Some(scheduler) = scheduler else {
                        return;
                    };
                    let outcome = scheduler
                        .execute_exclusive(&job_id, fire_time, lock_ttl, || callback(fire_time))
                        .await;
                    if let Err(err) = outcome {
                        warn!(job_id = %job_id, error = %err, "Distributed tick failed");
                    }
                }
            }),
        )
    }

    pub fn unschedule(&self, job_id: &str) -> bool {
        self.inner.cron.remove_job(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn node(name: &str, provider: &InMemoryLockProvider) -> DistributedScheduler {
        let config = DistributedSchedulerConfig {
            lock_ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            ..DistributedSchedulerConfig::new(name)
        };
        DistributedScheduler::new(config, Arc::new(provider.clone())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_ttl_and_ownership() {
        let provider = InMemoryLockProvider::new();
        assert!(provider.acquire("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!provider.acquire("k", "b", Duration::from_secs(10)).await.unwrap());
        assert!(!provider.release("k", "b").await.unwrap());
        assert!(provider.heartbeat("k", "a", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(provider.holder("k"), None);
        assert!(provider.acquire("k", "b", Duration::from_secs(10)).await.unwrap());
        assert!(!provider.heartbeat("k", "a", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_node_runs_each_tick() {
        let provider = InMemoryLockProvider::new();
        let a = node("node-a", &provider);
        let b = node("node-b", &provider);
        a.join().await.unwrap();
        b.join().await.unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        for scheduler in [&a, &b, &a] {
            let runs = runs.clone();
            scheduler
                .execute_exclusive("report", tick, None, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The next minute is a different tick
        let next = tick + chrono::Duration::minutes(1);
        let ran = b
            .execute_exclusive("report", next, None, || async {})
            .await
            .unwrap();
        assert!(ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_lock_during_long_run() {
        let provider = InMemoryLockProvider::new();
        let a = node("node-a", &provider);
        a.join().await.unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let key = a.tick_key("long", tick);

        let observer = provider.clone();
        let watched = key.clone();
        let ran = a
            .execute_exclusive("long", tick, Some(Duration::from_secs(10)), || async move {
                tokio::time::sleep(Duration::from_secs(25)).await;
                assert_eq!(observer.holder(&watched).as_deref(), Some("node-a"));
            })
            .await
            .unwrap();
        assert!(ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_releases_membership_and_stops_runs() {
        let provider = InMemoryLockProvider::new();
        let a = node("node-a", &provider);
        a.join().await.unwrap();
        assert!(provider.holder("orchestration:scheduler:nodes:node-a").is_some());

        // A node id already held elsewhere cannot join
        let clash = DistributedScheduler::new(
            DistributedSchedulerConfig::new("node-a"),
            Arc::new(RejectingProvider),
        )
        .unwrap();
        assert!(clash.join().await.is_err());

        a.leave().await.unwrap();
        assert!(!a.is_joined());
        assert!(provider.holder("orchestration:scheduler:nodes:node-a").is_none());

        let tick = Utc::now();
        assert!(!a.execute_exclusive("job", tick, None, || async {}).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cron_jobs_fire_once_across_nodes() {
        let provider = InMemoryLockProvider::new();
        let fired: Arc<Mutex<Vec<DateTime<Utc>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut nodes = Vec::new();
        for name in ["n1", "n2", "n3"] {
            let scheduler = node(name, &provider);
            let fired = fired.clone();
            scheduler
                .schedule(
                    DistributedJob {
                        id: "sync".to_string(),
                        cron: "* * * * *".to_string(),
                        lock_ttl: None,
                    },
                    job_fn(move |fire_time| {
                        let fired = fired.clone();
                        async move {
                            fired.lock().push(fire_time);
                        }
                    }),
                )
                .unwrap();
            scheduler.join().await.unwrap();
            nodes.push(scheduler);
        }

        tokio::time::sleep(Duration::from_secs(61)).await;
        let fired = fired.lock().clone();
        assert!(!fired.is_empty());
        let unique: HashSet<_> = fired.iter().collect();
        assert_eq!(unique.len(), fired.len(), "a tick ran on more than one node");

        for scheduler in &nodes {
            scheduler.leave().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_lets_lock_expire() {
        let provider = InMemoryLockProvider::new();
        let a = node("node-a", &provider);
        a.join().await.unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let key = a.tick_key("fragile", tick);

        let ran = a
            .execute_exclusive("fragile", tick, Some(Duration::from_secs(2)), || async {
                panic!("report generator crashed");
            })
            .await
            .unwrap();
        assert!(ran);
        assert!(a.inner.held.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.holder(&key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_stops_heartbeat() {
        let provider = InMemoryLockProvider::new();
        let a = node("node-a", &provider);
        a.join().await.unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let key = a.tick_key("long", tick);

        let task = {
            let a = a.clone();
            tokio::spawn(async move {
                a.execute_exclusive("long", tick, Some(Duration::from_secs(2)), || {
                    tokio::time::sleep(Duration::from_secs(3600))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(provider.holder(&key).as_deref(), Some("node-a"));

        task.abort();
        let _ = task.await;
        assert!(a.inner.held.lock().is_empty());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.holder(&key), None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = DistributedSchedulerConfig::new("n");
        assert!(config.validate().is_ok());
        config.heartbeat_interval = config.lock_ttl;
        assert!(config.validate().is_err());
    }

    struct RejectingProvider;

    #[async_trait]
    impl LockProvider for RejectingProvider {
        async fn acquire(&self, _: &str, _: &str, _: Duration) -> OrchestrationResult<bool> {
            Ok(false)
        }
        async fn release(&self, _: &str, _: &str) -> OrchestrationResult<bool> {
            Ok(false)
        }
        async fn heartbeat(&self, _: &str, _: &str, _: Duration) -> OrchestrationResult<bool> {
            Ok(false)
        }
    }
}
