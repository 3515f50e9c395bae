//! Dispatcher - composes the job engine around a chat client and a speaker
//!
//! Inbound queries land in a bounded buffer, pass rate-limit admission, and
//! are executed by the worker pool either directly (urgent) or in batches.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ChatClient, MessageJob, QueryMessage, SpeakerDevice, TtsJob};
use crate::config::ConcurrencyConfig;
use crate::engine::{
    BatchAccumulator, BoxedJob, LimiterStatus, MessageBuffer, MetricsSnapshot, PoolStatus,
    Priority, RateLimiter, WorkerPool, spawn_guarded,
};
use crate::{Error, Result};

/// Serializable dispatcher snapshot for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub message_buffer: usize,
    pub message_buffer_capacity: usize,
    pub pending_batch: usize,
    pub pool: PoolStatus,
    pub rate_limiter: LimiterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

struct Lifecycle {
    cancel: CancellationToken,
    processor: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

struct Shared {
    config: ConcurrencyConfig,
    pool: Arc<WorkerPool>,
    buffer: MessageBuffer<QueryMessage>,
    limiter: RateLimiter,
    batcher: BatchAccumulator,
    chat: Arc<dyn ChatClient>,
    speaker: Arc<dyn SpeakerDevice>,
    /// Cancelled when the dispatcher stops; replaced on start
    cancel: Mutex<CancellationToken>,
}

/// Concurrent query handler for one speaker
pub struct Dispatcher {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Dispatcher {
    /// Build a stopped dispatcher
    #[must_use]
    pub fn new(
        config: ConcurrencyConfig,
        chat: Arc<dyn ChatClient>,
        speaker: Arc<dyn SpeakerDevice>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(config.worker_count, config.queue_size));
        let batcher = BatchAccumulator::new(Arc::clone(&pool), config.batch_size, config.batch_timeout);

        tracing::info!(
            workers = config.worker_count,
            queue = config.queue_size,
            buffer = config.message_buffer_size,
            rate = config.rate_limit,
            batch_size = config.batch_size,
            "dispatcher created"
        );

        let cancelled = CancellationToken::new();
        cancelled.cancel();

        Self {
            shared: Arc::new(Shared {
                buffer: MessageBuffer::new(config.message_buffer_size),
                limiter: RateLimiter::new(config.rate_limit),
                pool,
                batcher,
                chat,
                speaker,
                cancel: Mutex::new(cancelled),
                config,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Start the pool, limiter, batch sweep and message processor
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` on double start
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.is_some() {
            return Err(Error::AlreadyRunning);
        }

        tracing::info!("starting dispatcher");
        self.shared.pool.start()?;
        self.shared.limiter.start();
        if let Err(e) = self.shared.batcher.start() {
            tracing::warn!(error = %e, "batch sweeper already running");
        }

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock().unwrap_or_else(|e| e.into_inner()) = cancel.clone();

        let processor = spawn_guarded(
            "message-processor",
            process_messages(Arc::clone(&self.shared), cancel.clone()),
        );

        *lifecycle = Some(Lifecycle {
            cancel,
            processor,
            started_at: Utc::now(),
        });
        Ok(())
    }

    /// Stop everything, flushing batched jobs into the pool before it stops
    pub async fn stop(&self) {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Lifecycle {
            cancel, processor, ..
        }) = lifecycle
        else {
            return;
        };

        tracing::info!("stopping dispatcher");
        cancel.cancel();
        if let Err(e) = processor.await {
            tracing::error!(error = %e, "message processor failed to join");
        }

        self.shared.batcher.stop().await;
        self.shared.limiter.stop();
        self.shared.pool.stop().await;
        tracing::info!("dispatcher stopped");
    }

    /// Whether the dispatcher is accepting work
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Queue a query for the message processor, waiting while the buffer is full
    pub async fn put_message(&self, message: QueryMessage) {
        self.shared.buffer.put(message).await;
    }

    /// Admit and dispatch a query
    ///
    /// # Errors
    ///
    /// Returns `NotRunning`, `AdmissionCancelled`, or the pool's submission error
    pub async fn submit_message(&self, message: QueryMessage, priority: Priority) -> Result<()> {
        self.shared.submit_message(message, priority).await
    }

    /// Admit and dispatch a playback request
    ///
    /// # Errors
    ///
    /// Returns `NotRunning`, `AdmissionCancelled`, or the pool's submission error
    pub async fn submit_tts(&self, text: impl Into<String>, priority: Priority) -> Result<()> {
        let shared = &self.shared;
        let job = TtsJob::new(text, priority, Arc::clone(&shared.speaker));
        shared.admit_and_dispatch(Box::new(job)).await
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> DispatcherStatus {
        let started_at = self
            .lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.started_at);
        let shared = &self.shared;

        DispatcherStatus {
            running: started_at.is_some(),
            started_at,
            message_buffer: shared.buffer.len(),
            message_buffer_capacity: shared.buffer.capacity(),
            pending_batch: shared.batcher.pending(),
            pool: shared.pool.status(),
            rate_limiter: shared.limiter.status(),
            metrics: shared
                .config
                .enable_metrics
                .then(|| shared.pool.metrics()),
        }
    }
}

impl Shared {
    fn message_job(&self, message: QueryMessage, priority: Priority) -> BoxedJob {
        Box::new(MessageJob::new(
            message,
            priority,
            Arc::clone(&self.chat),
            Arc::clone(&self.speaker),
        ))
    }

    async fn submit_message(&self, message: QueryMessage, priority: Priority) -> Result<()> {
        self.admit_and_dispatch(self.message_job(message, priority)).await
    }

    /// Wait for a rate-limit token while running
    async fn admit(&self) -> Result<()> {
        let cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if cancel.is_cancelled() {
            return Err(Error::NotRunning);
        }

        self.limiter.wait(&cancel).await
    }

    async fn admit_and_dispatch(&self, job: BoxedJob) -> Result<()> {
        self.admit().await?;
        self.batcher.add(job)
    }
}

/// Drain the buffer into the engine until cancelled
async fn process_messages(shared: Arc<Shared>, cancel: CancellationToken) {
    tracing::debug!("message processor started");

    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = shared.buffer.get() => message,
        };

        tracing::info!(query = %message.text, "received query");

        if let Err(e) = shared.admit().await {
            // Stopped while waiting for admission; keep the query for the next start
            match shared.buffer.requeue(message) {
                Ok(()) => tracing::debug!(reason = %e, "query returned to buffer"),
                Err(message) => {
                    tracing::warn!(query = %message.text, reason = %e, "buffer full, query dropped");
                }
            }
            continue;
        }

        if let Err(e) = shared.batcher.add(shared.message_job(message, Priority::NORMAL)) {
            tracing::error!(error = %e, "failed to submit query");
        }
    }

    tracing::debug!("message processor stopped");
}
