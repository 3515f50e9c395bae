//! Bounded worker pool
//!
//! A fixed number of worker tasks drain a shared bounded queue. Each job runs
//! under a deadline and a panic boundary, so a misbehaving job costs one
//! logged failure and never a worker.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::job::{BoxedJob, JobContext};
use super::recovery::catch_panic;
use crate::{Error, Result};

/// Per-job execution deadline
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

type SharedReceiver = Arc<Mutex<mpsc::Receiver<BoxedJob>>>;

/// Snapshot of pool state for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub running: bool,
    pub worker_count: usize,
    pub queue_length: usize,
    pub queue_capacity: usize,
}

/// Job outcome counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
}

impl PoolMetrics {
    /// Read all counters
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Result<()>) {
        let counter = match outcome {
            Ok(()) => &self.succeeded,
            Err(Error::JobTimeout(_)) => &self.timed_out,
            Err(Error::PanicRecovered { .. }) => &self.panicked,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Admission counters shared by submitters and workers
///
/// A job handed to an idle worker does not occupy a queue slot, so the
/// backlog is `queued - idle` and admission stops at `queue_capacity`.
#[derive(Debug)]
struct Slots {
    /// Jobs sent to the channel and not yet taken by a worker
    queued: AtomicUsize,
    /// Workers not currently executing a job
    idle: AtomicUsize,
}

impl Slots {
    fn new(idle: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            idle: AtomicUsize::new(idle),
        }
    }

    /// Jobs waiting with no worker to take them
    fn backlog(&self) -> usize {
        self.queued
            .load(Ordering::SeqCst)
            .saturating_sub(self.idle.load(Ordering::SeqCst))
    }

    /// Claim room for one job; false when the backlog is at capacity
    fn reserve(&self, capacity: usize) -> bool {
        let mut queued = self.queued.load(Ordering::SeqCst);
        loop {
            if queued >= capacity + self.idle.load(Ordering::SeqCst) {
                return false;
            }
            match self
                .queued
                .compare_exchange_weak(queued, queued + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => queued = actual,
            }
        }
    }

    fn unreserve(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// A worker took a job off the channel
    fn taken(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// A worker finished its job
    fn released(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handles owned while the pool is running
struct Running {
    sender: mpsc::Sender<BoxedJob>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    slots: Arc<Slots>,
}

/// Fixed-size pool of job workers
pub struct WorkerPool {
    worker_count: usize,
    queue_capacity: usize,
    job_timeout: Duration,
    state: RwLock<Option<Running>>,
    metrics: Arc<PoolMetrics>,
}

impl WorkerPool {
    /// Create a stopped pool
    ///
    /// Zero counts are raised to one.
    #[must_use]
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            queue_capacity: queue_capacity.max(1),
            job_timeout: JOB_TIMEOUT,
            state: RwLock::new(None),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Spawn the workers
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the pool was already started
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.is_some() {
            return Err(Error::AlreadyRunning);
        }

        tracing::info!(workers = self.worker_count, queue = self.queue_capacity, "starting worker pool");

        // Room for a full backlog plus one job in hand-off per worker
        let (sender, receiver) = mpsc::channel(self.queue_capacity + self.worker_count);
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));
        let cancel = CancellationToken::new();
        let slots = Arc::new(Slots::new(self.worker_count));

        let workers = (0..self.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    receiver: Arc::clone(&receiver),
                    cancel: cancel.clone(),
                    slots: Arc::clone(&slots),
                    job_timeout: self.job_timeout,
                    metrics: Arc::clone(&self.metrics),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        *state = Some(Running {
            sender,
            cancel,
            workers,
            slots,
        });
        Ok(())
    }

    /// Stop the workers and wait for them to exit
    ///
    /// Jobs already executing run to completion or to their deadline; jobs
    /// still queued are discarded. Stopping a stopped pool is a no-op.
    pub async fn stop(&self) {
        let running = self.state.write().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Running {
            sender,
            cancel,
            workers,
            slots,
        }) = running
        else {
            return;
        };

        tracing::info!("stopping worker pool");
        cancel.cancel();
        drop(sender);

        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task failed to join");
            }
        }

        let discarded = slots.queued.load(Ordering::SeqCst);

        if discarded > 0 {
            tracing::warn!(discarded, "discarded queued jobs at shutdown");
        }
        tracing::info!("worker pool stopped");
    }

    /// Enqueue a job without waiting
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` if the pool is stopped, `QueueFull` if idle
    /// workers are spoken for and the queue is at capacity
    pub fn submit(&self, job: BoxedJob) -> Result<()> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(running) = state.as_ref() else {
            return Err(Error::NotRunning);
        };

        let id = job.id().to_string();
        if !running.slots.reserve(self.queue_capacity) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %id, "job queue full");
            return Err(Error::QueueFull);
        }

        match running.sender.try_send(job) {
            Ok(()) => {
                self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %id, "job submitted");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                running.slots.unreserve();
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job_id = %id, "job queue full");
                Err(Error::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                running.slots.unreserve();
                Err(Error::NotRunning)
            }
        }
    }

    /// Whether the pool accepts jobs
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Current pool status
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let queue_length = state
            .as_ref()
            .map_or(0, |r| r.slots.backlog());

        PoolStatus {
            running: state.is_some(),
            worker_count: self.worker_count,
            queue_length,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Job outcome counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

struct Worker {
    id: usize,
    receiver: SharedReceiver,
    cancel: CancellationToken,
    slots: Arc<Slots>,
    job_timeout: Duration,
    metrics: Arc<PoolMetrics>,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "worker started");

        loop {
            let job = {
                let mut receiver = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    guard = self.receiver.lock() => guard,
                };
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    job = receiver.recv() => job,
                }
            };

            let Some(job) = job else { break };
            self.slots.taken();
            self.execute(job).await;
            self.slots.released();
        }

        tracing::debug!(worker = self.id, "worker stopped");
    }

    async fn execute(&self, job: BoxedJob) {
        let started = Instant::now();
        let ctx = JobContext::new(self.id, started + self.job_timeout, self.cancel.child_token());
        let queued_ms = duration_ms(started.saturating_duration_since(job.created_at()));

        tracing::debug!(worker = self.id, job_id = %job.id(), priority = %job.priority(), queued_ms, "executing job");

        let outcome = catch_panic(job.id(), async {
            tokio::time::timeout(self.job_timeout, job.execute(&ctx))
                .await
                .map_err(|_| Error::JobTimeout(self.job_timeout))?
        })
        .await;

        let elapsed_ms = duration_ms(started.elapsed());
        self.metrics.record(&outcome);

        match &outcome {
            Ok(()) => {
                tracing::debug!(worker = self.id, job_id = %job.id(), elapsed_ms, "job succeeded");
            }
            Err(e @ Error::PanicRecovered { backtrace, .. }) => {
                tracing::error!(
                    worker = self.id,
                    job_id = %job.id(),
                    elapsed_ms,
                    error = %e,
                    %backtrace,
                    "job panicked"
                );
            }
            Err(e) => {
                tracing::error!(worker = self.id, job_id = %job.id(), elapsed_ms, error = %e, "job failed");
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
