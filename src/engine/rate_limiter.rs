//! Token-bucket admission control
//!
//! Backed by a `governor` direct limiter with a burst equal to the rate, which
//! behaves as a bucket of `rate` tokens refilled one token every `1/rate`
//! seconds. Stopping the limiter halts refill: `allow` answers false and
//! pending `wait` calls only complete through their own cancellation.

use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter state for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub running: bool,
    pub rate_per_second: u32,
}

struct Bucket {
    limiter: Arc<DirectLimiter>,
    /// Fires when the refill source is halted
    halted: CancellationToken,
}

/// Token-bucket rate limiter
pub struct RateLimiter {
    rate: NonZeroU32,
    bucket: RwLock<Option<Bucket>>,
}

impl RateLimiter {
    /// Create a stopped limiter admitting `rate` operations per second
    ///
    /// A rate of zero is raised to one.
    #[must_use]
    pub fn new(rate: u32) -> Self {
        Self {
            rate: NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN),
            bucket: RwLock::new(None),
        }
    }

    /// Fill the bucket and begin refilling; no-op if already running
    pub fn start(&self) {
        let mut bucket = self.bucket.write().unwrap_or_else(|e| e.into_inner());
        if bucket.is_some() {
            return;
        }

        *bucket = Some(Bucket {
            limiter: Arc::new(governor::RateLimiter::direct(Quota::per_second(self.rate))),
            halted: CancellationToken::new(),
        });
        tracing::debug!(rate = self.rate.get(), "rate limiter started");
    }

    /// Halt refill; no-op if already stopped
    pub fn stop(&self) {
        let bucket = self.bucket.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(bucket) = bucket {
            bucket.halted.cancel();
            tracing::debug!("rate limiter stopped");
        }
    }

    /// Take a token if one is available
    #[must_use]
    pub fn allow(&self) -> bool {
        self.bucket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|b| b.limiter.check().is_ok())
    }

    /// Wait for a token
    ///
    /// # Errors
    ///
    /// Returns `AdmissionCancelled` if `cancel` fires first
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let current = self
            .bucket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|b| (Arc::clone(&b.limiter), b.halted.clone()));

        let Some((limiter, halted)) = current else {
            cancel.cancelled().await;
            return Err(Error::AdmissionCancelled);
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::AdmissionCancelled),
            () = halted.cancelled() => {
                cancel.cancelled().await;
                Err(Error::AdmissionCancelled)
            }
            () = limiter.until_ready() => Ok(()),
        }
    }

    /// Configured admissions per second
    #[must_use]
    pub const fn rate(&self) -> u32 {
        self.rate.get()
    }

    /// Current limiter state
    #[must_use]
    pub fn status(&self) -> LimiterStatus {
        LimiterStatus {
            running: self.bucket.read().unwrap_or_else(|e| e.into_inner()).is_some(),
            rate_per_second: self.rate.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn closed_before_start() {
        let limiter = RateLimiter::new(5);
        assert!(!limiter.allow());
        assert!(!limiter.status().running);
    }

    #[test]
    fn zero_rate_is_raised() {
        assert_eq!(RateLimiter::new(0).rate(), 1);
    }

    #[test]
    fn bucket_starts_full() {
        let limiter = RateLimiter::new(3);
        limiter.start();

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn restart_is_noop_while_running() {
        let limiter = RateLimiter::new(2);
        limiter.start();
        assert!(limiter.allow());
        assert!(limiter.allow());

        // A second start must not refill the bucket
        limiter.start();
        assert!(!limiter.allow());
    }

    #[test]
    fn stop_closes_the_gate() {
        let limiter = RateLimiter::new(10);
        limiter.start();
        limiter.stop();

        assert!(!limiter.allow());
        assert!(!limiter.status().running);
    }

    #[tokio::test]
    async fn wait_takes_available_token() {
        let limiter = RateLimiter::new(2);
        limiter.start();
        let cancel = CancellationToken::new();

        tokio_test::assert_ok!(limiter.wait(&cancel).await);
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let limiter = RateLimiter::new(1);
        limiter.start();
        assert!(limiter.allow());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(limiter.wait(&cancel).await, Err(Error::AdmissionCancelled)));
    }

    #[tokio::test]
    async fn pending_wait_outlives_stop_until_cancelled() {
        let limiter = Arc::new(RateLimiter::new(1));
        limiter.start();
        assert!(limiter.allow());

        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.stop();

        // Refill would have produced a token by now if it were still running
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!waiter.is_finished());

        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::AdmissionCancelled)));
    }
}
