//! Speaker decorator adding retries and a circuit breaker

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::SpeakerDevice;
use crate::Result;
use crate::engine::{CircuitBreaker, CircuitState, RecoveryManager};

/// Wraps a device so every `say` is retried with backoff, and a device that
/// keeps failing is short-circuited until it cools down
pub struct GuardedSpeaker {
    inner: Arc<dyn SpeakerDevice>,
    recovery: RecoveryManager,
    breaker: CircuitBreaker,
    shutdown: CancellationToken,
}

impl GuardedSpeaker {
    /// Guard `inner`; `shutdown` interrupts pending retries
    #[must_use]
    pub fn new(
        inner: Arc<dyn SpeakerDevice>,
        recovery: RecoveryManager,
        breaker: CircuitBreaker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner,
            recovery,
            breaker,
            shutdown,
        }
    }

    /// Breaker state for the wrapped device
    #[must_use]
    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

#[async_trait]
impl SpeakerDevice for GuardedSpeaker {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn say(&self, text: &str) -> Result<()> {
        self.breaker
            .execute(|| {
                self.recovery
                    .with_recover(&self.shutdown, "speaker.say", || self.inner.say(text))
            })
            .await
    }
}
