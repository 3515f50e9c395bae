//! Device query poller
//!
//! Periodically reads the device's recent queries and forwards the ones newer
//! than the last seen timestamp into the dispatcher's buffer. A poll is skipped
//! while the device is playing so its own speech is never picked up.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Dispatcher, QueryMessage, QuerySource};
use crate::config::PollerConfig;
use crate::engine::spawn_guarded;
use crate::{Error, Result};

/// Deadline for each device call
const DEVICE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializable poller snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PollerStats {
    pub running: bool,
    pub interval_ms: u64,
    pub last_seen: DateTime<Utc>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub polls: u64,
    pub skipped_while_playing: u64,
    pub queries_forwarded: u64,
}

struct Shared {
    config: PollerConfig,
    source: Arc<dyn QuerySource>,
    dispatcher: Arc<Dispatcher>,
    last_seen: Mutex<DateTime<Utc>>,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
    polls: AtomicU64,
    skipped: AtomicU64,
    forwarded: AtomicU64,
}

/// Feeds device queries into a [`Dispatcher`]
pub struct MessagePoller {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MessagePoller {
    /// Build a stopped poller that ignores queries heard before now
    #[must_use]
    pub fn new(
        config: PollerConfig,
        source: Arc<dyn QuerySource>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                dispatcher,
                last_seen: Mutex::new(Utc::now()),
                last_poll_at: Mutex::new(None),
                polls: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Start polling on the configured interval
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` on double start
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let handle = spawn_guarded(
            "message-poller",
            poll_loop(Arc::clone(&self.shared), cancel.clone()),
        );
        *lifecycle = Some((cancel, handle));

        tracing::info!(
            source = self.shared.source.name(),
            interval_ms = duration_ms(self.shared.config.interval),
            "message poller started"
        );
        Ok(())
    }

    /// Stop polling and wait for the loop to exit; no-op when stopped
    pub async fn stop(&self) {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some((cancel, handle)) = lifecycle else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "message poller failed to join");
        }
        tracing::info!("message poller stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Timestamp of the newest query already handled
    #[must_use]
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.shared.lock_last_seen()
    }

    /// Move the dedupe mark, e.g. to replay or skip history
    pub fn set_last_seen(&self, at: DateTime<Utc>) {
        *self.shared.lock_last_seen() = at;
    }

    /// Run a single poll outside the loop
    ///
    /// # Errors
    ///
    /// Returns the device error if the history fetch fails
    pub async fn poll_once(&self) -> Result<usize> {
        self.shared.poll(&CancellationToken::new()).await
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PollerStats {
        let shared = &self.shared;
        PollerStats {
            running: self.is_running(),
            interval_ms: duration_ms(shared.config.interval),
            last_seen: *shared.lock_last_seen(),
            last_poll_at: *shared
                .last_poll_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            polls: shared.polls.load(Ordering::Relaxed),
            skipped_while_playing: shared.skipped.load(Ordering::Relaxed),
            queries_forwarded: shared.forwarded.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn lock_last_seen(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn poll(&self, cancel: &CancellationToken) -> Result<usize> {
        *self.last_poll_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.polls.fetch_add(1, Ordering::Relaxed);

        match device_call(self.source.is_playing()).await {
            Ok(true) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("device playing, skipping poll");
                return Ok(0);
            }
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "playback state unknown, polling anyway"),
        }

        let queries = device_call(self.source.recent_queries(self.config.fetch_limit)).await?;
        let fresh = self.newer_than_last_seen(queries);
        if fresh.is_empty() {
            return Ok(0);
        }
        tracing::debug!(count = fresh.len(), "new queries from device");

        let mut forwarded = 0;
        for query in fresh {
            let heard_at = query.received_at;
            if !query.text.trim().is_empty() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = self.dispatcher.put_message(query) => {}
                }
                forwarded += 1;
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            }

            let mut last_seen = self.lock_last_seen();
            if heard_at > *last_seen {
                *last_seen = heard_at;
            }
        }
        Ok(forwarded)
    }

    /// Queries strictly newer than the mark, oldest first
    fn newer_than_last_seen(&self, queries: Vec<QueryMessage>) -> Vec<QueryMessage> {
        let mark = *self.lock_last_seen();
        let mut fresh: Vec<_> = queries
            .into_iter()
            .filter(|q| q.received_at > mark)
            .collect();
        fresh.sort_by_key(|q| q.received_at);
        fresh
    }
}

async fn poll_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick is immediate; the first poll happens one interval after start
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = shared.poll(&cancel) => result,
        };
        match result {
            Ok(_) => {}
            Err(Error::Cancelled) => break,
            Err(e) => tracing::warn!(error = %e, "poll failed"),
        }
    }

    tracing::debug!("poll loop exited");
}

async fn device_call<T>(call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(DEVICE_CALL_TIMEOUT, call)
        .await
        .map_err(|_| {
            Error::Device(format!(
                "device call timed out after {}s",
                DEVICE_CALL_TIMEOUT.as_secs()
            ))
        })?
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
