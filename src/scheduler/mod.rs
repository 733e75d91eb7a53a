//! Recurring dispatch of ingestion cycles.
//!
//! A dispatch loop wakes every `tick_interval_ms`, pops the feeds that are
//! due and hands each one to a worker. Two limits apply:
//!
//! - at most `max_workers` cycles run at once
//! - at most one cycle per feed runs at once (a per-feed gate)
//!
//! A due feed that hits either limit stays due and is retried on the next
//! tick. A finished feed is next due `interval` after it finished, so a slow
//! cycle never causes a burst of catch-up runs.

mod gate;
mod registry;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SchedulerConfig;
use crate::pipeline::{CycleReport, CycleStatus, Ingestor, SkipReason};
use crate::storage::DatabaseError;

use gate::FeedGates;
use registry::{DueJob, Registry};

/// Identifies the job of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(i64);

impl JobId {
    pub fn feed_id(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(CycleReport),
    /// Another cycle for the feed holds its gate.
    AlreadyRunning,
}

struct Shared {
    ingestor: Arc<Ingestor>,
    registry: Mutex<Registry>,
    gates: FeedGates,
    workers: Arc<Semaphore>,
    max_workers: u32,
    accepting: AtomicBool,
    tick_interval: Duration,
    min_interval: Duration,
    default_interval: Duration,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Scheduler {
    pub fn new(ingestor: Arc<Ingestor>, config: &SchedulerConfig) -> Self {
        let max_workers = u32::try_from(config.max_workers.clamp(1, Semaphore::MAX_PERMITS))
            .unwrap_or(u32::MAX);
        let min_interval = minutes(config.min_interval_minutes.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                ingestor,
                registry: Mutex::new(Registry::default()),
                gates: FeedGates::default(),
                workers: Arc::new(Semaphore::new(max_workers as usize)),
                max_workers,
                accepting: AtomicBool::new(true),
                tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
                default_interval: minutes(config.default_interval_minutes).max(min_interval),
                min_interval,
            }),
            shutdown,
            dispatch: Mutex::new(None),
        }
    }

    /// Register the recurring job for `feed_id`, replacing any existing one.
    ///
    /// The interval is raised to `min_interval_minutes` if needed. The first
    /// run is due immediately.
    pub fn add_feed_job(&self, feed_id: i64, interval_minutes: u64) -> JobId {
        let interval = minutes(interval_minutes).max(self.shared.min_interval);
        lock(&self.shared.registry).insert(feed_id, interval, Instant::now());
        tracing::debug!(
            feed_id,
            interval_secs = interval.as_secs(),
            "Registered feed job"
        );
        JobId(feed_id)
    }

    pub fn remove_feed_job(&self, job: &JobId) -> bool {
        lock(&self.shared.registry).remove(job.0)
    }

    /// Make a registered job due now.
    pub fn trigger(&self, job: &JobId) -> bool {
        lock(&self.shared.registry).reset(job.0, Instant::now())
    }

    pub fn job_count(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    /// Due time recorded for the job.
    pub fn next_run(&self, job: &JobId) -> Option<Instant> {
        lock(&self.shared.registry).next_due(job.0)
    }

    /// Register a job for every feed storage considers fetchable.
    ///
    /// Feeds that already have a job keep it. Returns the number of new jobs.
    pub async fn sync_jobs(&self, max_feeds: usize) -> Result<usize, DatabaseError> {
        let ingestor = &self.shared.ingestor;
        let feeds = ingestor
            .store()
            .get_feeds_to_fetch(max_feeds, ingestor.max_consecutive_errors())
            .await?;

        let mut added = 0;
        for feed in feeds {
            if lock(&self.shared.registry).contains(feed.id) {
                continue;
            }
            let interval = match feed.fetch_interval_minutes {
                0 => self.shared.default_interval.as_secs() / 60,
                m => u64::from(m),
            };
            self.add_feed_job(feed.id, interval);
            added += 1;
        }
        tracing::info!(added, total = self.job_count(), "Synchronized feed jobs");
        Ok(added)
    }

    /// Spawn the dispatch loop.
    pub fn start(&self) {
        let mut dispatch = lock(&self.dispatch);
        if dispatch.is_some() {
            tracing::warn!("Scheduler already started");
            return;
        }

        self.shared.accepting.store(true, Ordering::Release);
        self.shutdown.send_replace(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let shared = Arc::clone(&self.shared);

        *dispatch = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                workers = shared.max_workers,
                tick_ms = shared.tick_interval.as_millis() as u64,
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Scheduler shutdown requested");
                        break;
                    }
                    _ = ticker.tick() => {
                        shared.tick();
                    }
                }
            }
        }));
    }

    /// Stop dispatching.
    ///
    /// With `wait`, returns once the dispatch loop has exited and every
    /// in-flight cycle has finished. Without it, returns immediately and
    /// running cycles finish on their own.
    pub async fn stop(&self, wait: bool) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
        let handle = lock(&self.dispatch).take();

        if !wait {
            return;
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        // Every running cycle holds a worker permit
        if let Ok(all) = self.shared.workers.acquire_many(self.shared.max_workers).await {
            drop(all);
        }
        tracing::info!("Scheduler stopped");
    }

    /// One dispatch pass. Returns the number of cycles started.
    pub fn tick(&self) -> usize {
        self.shared.tick()
    }

    /// Run one cycle for `feed_id` right away, through the feed's gate.
    ///
    /// A registered job is pushed back to one interval from now.
    pub async fn run_now(&self, feed_id: i64, force: bool) -> RunOutcome {
        let Some(_gate) = self.shared.gates.try_acquire(feed_id) else {
            tracing::debug!(feed_id, "Feed cycle already running");
            return RunOutcome::AlreadyRunning;
        };

        let report = self.shared.ingestor.run_cycle(feed_id, force).await;

        let mut registry = lock(&self.shared.registry);
        if let Some(interval) = registry.interval(feed_id) {
            registry.reset(feed_id, Instant::now() + interval);
        }
        RunOutcome::Completed(report)
    }
}

impl Shared {
    fn tick(self: &Arc<Self>) -> usize {
        if !self.accepting.load(Ordering::Acquire) {
            return 0;
        }

        let due = lock(&self.registry).take_due(Instant::now());
        let mut deferred = Vec::new();
        let mut started = 0;

        for job in due {
            let Some(gate) = self.gates.try_acquire(job.feed_id) else {
                tracing::debug!(feed_id = job.feed_id, "Feed busy, retrying next tick");
                deferred.push(job);
                continue;
            };
            let Ok(worker) = Arc::clone(&self.workers).try_acquire_owned() else {
                tracing::debug!(feed_id = job.feed_id, "No free worker, retrying next tick");
                deferred.push(job);
                continue;
            };

            started += 1;
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.run_job(job, gate, worker).await });
        }

        if !deferred.is_empty() {
            let mut registry = lock(&self.registry);
            for job in deferred {
                registry.schedule(job.feed_id, job.generation, job.due);
            }
        }
        started
    }

    async fn run_job(
        self: Arc<Self>,
        job: DueJob,
        gate: OwnedSemaphorePermit,
        worker: OwnedSemaphorePermit,
    ) {
        let cycle = self.ingestor.run_cycle(job.feed_id, false);
        self.run_guarded(job, gate, worker, cycle).await;
    }

    /// Drive `cycle` to completion, contain a panic, then release the permits
    /// and reschedule.
    async fn run_guarded<F>(
        &self,
        job: DueJob,
        gate: OwnedSemaphorePermit,
        worker: OwnedSemaphorePermit,
        cycle: F,
    ) where
        F: Future<Output = CycleReport>,
    {
        // The cycle future, and any unit of work it holds, is dropped here
        let outcome = AssertUnwindSafe(cycle).catch_unwind().await;

        let vanished = match outcome {
            Ok(report) => report.status == CycleStatus::Skipped(SkipReason::NotFound),
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(
                    feed_id = job.feed_id,
                    panic = %message,
                    "Feed cycle panicked"
                );
                self.ingestor.record_panic(job.feed_id, &message).await;
                false
            }
        };
        drop(gate);

        {
            let mut registry = lock(&self.registry);
            if vanished {
                registry.remove_generation(job.feed_id, job.generation);
            } else {
                registry.schedule(job.feed_id, job.generation, Instant::now() + job.interval);
            }
        }
        drop(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{Database, NewFeed};
    use pretty_assertions::assert_eq;

    async fn panicking_cycle(shared: &Shared, feed_id: i64) {
        let job = lock(&shared.registry)
            .take_due(Instant::now() + Duration::from_secs(24 * 60 * 60))
            .pop()
            .unwrap();
        let gate = shared.gates.try_acquire(feed_id).unwrap();
        let worker = Arc::clone(&shared.workers).try_acquire_owned().unwrap();
        let cycle = futures::future::lazy(|_| -> CycleReport { panic!("decoder exploded") });
        shared.run_guarded(job, gate, worker, cycle).await;
    }

    #[tokio::test]
    async fn test_panicking_cycle_counts_as_feed_error() {
        let mut config = Config::default();
        config.feed.max_consecutive_errors = 2;
        let db = Database::open(":memory:").await.unwrap();
        let feed = db
            .insert_feed(&NewFeed::new("https://example.com/rss"))
            .await
            .unwrap();
        let ingestor = Ingestor::new(db.clone(), &config).unwrap();
        let scheduler = Scheduler::new(Arc::new(ingestor), &config.scheduler);
        let job = scheduler.add_feed_job(feed.id, 60);

        panicking_cycle(&scheduler.shared, feed.id).await;

        let stored = db.get_feed(feed.id).await.unwrap();
        assert_eq!(stored.fetch_error_count, 1);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("Cycle panicked: decoder exploded")
        );
        assert!(stored.last_error_at.is_some());

        // Gate released and job pushed one interval out
        assert!(scheduler.shared.gates.try_acquire(feed.id).is_some());
        assert!(scheduler.next_run(&job).unwrap() > Instant::now());

        panicking_cycle(&scheduler.shared, feed.id).await;
        assert!(db.get_feed(feed.id).await.unwrap().is_quarantined(2));
        assert!(db.get_feeds_to_fetch(10, 2).await.unwrap().is_empty());
    }
}
