//! Batch accumulator for non-urgent jobs
//!
//! Jobs at or below [`Priority::NORMAL`] are held back and released to the
//! worker pool together, either when the batch fills or when its oldest job
//! has waited `batch_timeout`. More urgent jobs go straight to the pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::job::BoxedJob;
use super::pool::WorkerPool;
use super::recovery::spawn_guarded;
use crate::{Error, Result};

struct PendingJob {
    job: BoxedJob,
    added_at: Instant,
}

#[derive(Default)]
struct BatchState {
    pending: Vec<PendingJob>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a late timer cannot flush a newer batch
    generation: u64,
}

struct Inner {
    pool: Arc<WorkerPool>,
    batch_size: usize,
    batch_timeout: Duration,
    state: Mutex<BatchState>,
    /// Serializes hand-off to the pool so batches reach it in order
    dispatch: Mutex<()>,
}

/// Groups low-urgency jobs and releases them to a [`WorkerPool`]
pub struct BatchAccumulator {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BatchAccumulator {
    /// Create an accumulator feeding `pool`
    ///
    /// A `batch_size` of one or less disables batching.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                batch_size,
                batch_timeout,
                state: Mutex::new(BatchState::default()),
                dispatch: Mutex::new(()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    fn batching_enabled(&self) -> bool {
        self.inner.batch_size > 1
    }

    /// Start the staleness sweep
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the sweep is already active
    pub fn start(&self) -> Result<()> {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let handle = spawn_guarded("batch-sweeper", sweep(Arc::clone(&self.inner), cancel.clone()));
        *sweeper = Some((cancel, handle));
        Ok(())
    }

    /// Stop the sweep, flushing every pending job first
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((cancel, handle)) = sweeper {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "batch sweeper failed to join");
            }
        }

        // Covers jobs added while no sweeper was running
        self.inner.flush();
    }

    /// Route a job: urgent jobs go to the pool, others join the batch
    ///
    /// # Errors
    ///
    /// Returns the pool's submission error for jobs that bypass batching
    pub fn add(&self, job: BoxedJob) -> Result<()> {
        if !self.batching_enabled() || job.priority().bypasses_batching() {
            return self.inner.pool.submit(job);
        }

        let full = {
            let mut state = self.inner.lock_state();
            state.pending.push(PendingJob {
                job,
                added_at: Instant::now(),
            });

            if state.pending.len() >= self.inner.batch_size {
                true
            } else {
                if state.timer.is_none() {
                    state.timer = Some(arm_timer(Arc::clone(&self.inner), state.generation));
                }
                false
            }
        };

        if full {
            self.inner.flush();
        }
        Ok(())
    }

    /// Release every pending job to the pool now
    ///
    /// Returns the number of jobs handed to the pool.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Jobs waiting in the current batch
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self) -> usize {
        self.flush_if(|_| true)
    }

    /// Take the batch when `should_flush` approves it, then submit it in order
    fn flush_if(&self, should_flush: impl FnOnce(&BatchState) -> bool) -> usize {
        let _dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());

        let batch = {
            let mut state = self.lock_state();
            if state.pending.is_empty() || !should_flush(&state) {
                return 0;
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.generation += 1;
            std::mem::take(&mut state.pending)
        };

        let total = batch.len();
        let mut submitted = 0;
        for PendingJob { job, .. } in batch {
            let id = job.id().to_string();
            match self.pool.submit(job) {
                Ok(()) => submitted += 1,
                Err(e) => tracing::error!(job_id = %id, error = %e, "failed to submit batched job"),
            }
        }

        tracing::debug!(total, submitted, "flushed batch");
        submitted
    }
}

/// Flush the batch of `generation` once `batch_timeout` elapses
fn arm_timer(inner: Arc<Inner>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(inner.batch_timeout).await;
        let flushed = inner.flush_if(|state| state.generation == generation);
        if flushed > 0 {
            tracing::debug!(flushed, "batch timer fired");
        }
    })
}

/// Periodically flush batches whose oldest job has gone stale
async fn sweep(inner: Arc<Inner>, cancel: CancellationToken) {
    let period = (inner.batch_timeout / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let timeout = inner.batch_timeout;
                inner.flush_if(|state| {
                    state
                        .pending
                        .first()
                        .is_some_and(|oldest| oldest.added_at.elapsed() > timeout)
                });
            }
        }
    }

    let flushed = inner.flush();
    tracing::debug!(flushed, "batch sweeper stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::engine::job::{Job, JobContext, Priority};

    struct NoopJob {
        id: String,
        priority: Priority,
        created_at: Instant,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for NoopJob {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        fn created_at(&self) -> Instant {
            self.created_at
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(id: &str, priority: Priority, runs: &Arc<AtomicUsize>) -> BoxedJob {
        Box::new(NoopJob {
            id: id.to_string(),
            priority,
            created_at: Instant::now(),
            runs: Arc::clone(runs),
        })
    }

    fn started_pool() -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(2, 16));
        pool.start().unwrap();
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_jobs_bypass_the_batch() {
        let pool = started_pool();
        let batcher = BatchAccumulator::new(Arc::clone(&pool), 3, Duration::from_secs(1));
        let runs = Arc::new(AtomicUsize::new(0));

        batcher.add(job("urgent", Priority::HIGH, &runs)).unwrap();
        assert_eq!(batcher.pending(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately() {
        let pool = started_pool();
        let batcher = BatchAccumulator::new(Arc::clone(&pool), 3, Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));

        batcher.add(job("a", Priority::NORMAL, &runs)).unwrap();
        batcher.add(job("b", Priority::LOW, &runs)).unwrap();
        assert_eq!(batcher.pending(), 2);

        batcher.add(job("c", Priority::BATCH, &runs)).unwrap();
        assert_eq!(batcher.pending(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_partial_batch() {
        let pool = started_pool();
        let batcher = BatchAccumulator::new(Arc::clone(&pool), 5, Duration::from_secs(2));
        let runs = Arc::new(AtomicUsize::new(0));

        batcher.add(job("lonely", Priority::NORMAL, &runs)).unwrap();

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(batcher.pending(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(batcher.pending(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_pending_jobs() {
        let pool = started_pool();
        let batcher = BatchAccumulator::new(Arc::clone(&pool), 10, Duration::from_secs(60));
        batcher.start().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        batcher.add(job("x", Priority::LOW, &runs)).unwrap();
        batcher.add(job("y", Priority::LOW, &runs)).unwrap();
        batcher.stop().await;

        assert_eq!(batcher.pending(), 0);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn disabled_batching_submits_directly() {
        let pool = started_pool();
        let batcher = BatchAccumulator::new(Arc::clone(&pool), 1, Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));

        batcher.add(job("solo", Priority::LOW, &runs)).unwrap();
        assert_eq!(batcher.pending(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let pool = started_pool();
        let batcher = BatchAccumulator::new(pool, 3, Duration::from_secs(1));
        batcher.start().unwrap();
        assert!(matches!(batcher.start(), Err(Error::AlreadyRunning)));
        batcher.stop().await;
    }
}
