//! Circuit breaker guarding repeatedly failing operations

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::{Error, Result};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the cool-down elapses
    Open,
    /// A single trial call decides whether to close again
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_time: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    ///
    /// A `max_failures` of zero is raised to one.
    #[must_use]
    pub fn new(max_failures: u32, reset_time: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            reset_time,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Create a breaker from configuration
    #[must_use]
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.max_failures, config.reset_time)
    }

    /// Run `op` unless the breaker is open
    ///
    /// # Errors
    ///
    /// Returns `BreakerOpen` without running `op` while open, otherwise the
    /// operation's own result
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_trial = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Decide whether a call may run; returns true for a half-open trial
    fn admit(&self) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.reset_time);
                if cooled {
                    tracing::info!("circuit breaker half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(Error::BreakerOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Error::BreakerOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;

        if inner.failures >= self.max_failures && inner.state != CircuitState::Open {
            tracing::warn!(failures = inner.failures, "circuit breaker opened");
            inner.state = CircuitState::Open;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Counts a half-open trial dropped before completion as a failure
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_failure();
        }
    }
}
