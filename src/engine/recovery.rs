//! Retry with exponential backoff and panic containment

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RecoveryConfig;
use crate::{Error, Result};

thread_local! {
    /// Stack of the most recent panic on this thread, taken at the panic site
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static TRACE_HOOK: Once = Once::new();

/// Chain a panic hook that records the panicking stack before unwinding
fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture();
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Take the trace recorded by the hook, or capture one here if none exists
fn take_panic_trace() -> Backtrace {
    PANIC_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(Backtrace::force_capture)
}

/// Run `fut`, converting a panic into [`Error::PanicRecovered`]
///
/// # Errors
///
/// Returns the future's own error, or `PanicRecovered` if it panicked
pub async fn catch_panic<T, F>(context: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    install_trace_hook();

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Error::PanicRecovered {
            context: context.to_string(),
            message: panic_message(payload.as_ref()),
            backtrace: take_panic_trace().to_string(),
        }),
    }
}

/// Spawn a background task whose panic is logged instead of lost
pub fn spawn_guarded<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    install_trace_hook();

    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            tracing::error!(
                task = name,
                panic = %panic_message(payload.as_ref()),
                backtrace = %take_panic_trace(),
                "background task panicked"
            );
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Retries fallible operations with exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RecoveryManager {
    config: RecoveryConfig,
}

impl RecoveryManager {
    /// Create a recovery manager
    #[must_use]
    pub const fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Delay before retry number `attempt + 1`
    ///
    /// `min(initial_delay * backoff_factor^attempt, max_delay)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.backoff_factor.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= max {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds, retries run out, or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns the last error if cancelled after a failed attempt, `Cancelled`
    /// if cancelled during a backoff sleep, or `RetriesExhausted` otherwise
    pub async fn with_recover<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            let result = if self.config.enable_panic_recovery {
                catch_panic(name, op()).await
            } else {
                op().await
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            if let Error::PanicRecovered { backtrace, .. } = &err {
                tracing::error!(operation = name, error = %err, %backtrace, "panic during attempt");
            }

            if attempt >= self.config.max_retries {
                return Err(Error::RetriesExhausted {
                    name: name.to_string(),
                    attempts: max_attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for_attempt(attempt);
            tracing::warn!(
                operation = name,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "attempt failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            enable_panic_recovery: true,
        }
    }

    #[test]
    fn backoff_grows_then_caps() {
        let rm = RecoveryManager::new(fast_config());

        assert_eq!(rm.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(rm.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(rm.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(rm.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(rm.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let rm = RecoveryManager::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = Arc::clone(&calls);
        let result = rm
            .with_recover(&cancel, "flaky", move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Device("offline".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_and_reports_attempts() {
        let rm = RecoveryManager::new(fast_config());
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let result: Result<()> = rm
            .with_recover(&cancel, "reconnect", || async {
                Err(Error::Device("unreachable".to_string()))
            })
            .await;

        match result {
            Err(Error::RetriesExhausted {
                name,
                attempts,
                last,
            }) => {
                assert_eq!(name, "reconnect");
                assert_eq!(attempts, 4);
                assert!(matches!(*last, Error::Device(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // 100 + 200 + 400 of backoff between four attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(710), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_retried() {
        let rm = RecoveryManager::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = Arc::clone(&calls);
        let result = rm
            .with_recover(&cancel, "explosive", move || {
                let c = Arc::clone(&c);
                async move {
                    assert!(c.fetch_add(1, Ordering::SeqCst) != 0, "first attempt blows up");
                    Ok("recovered")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let rm = RecoveryManager::new(RecoveryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..fast_config()
        });
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: Result<()> = rm
            .with_recover(&cancel, "slow", || async {
                Err(Error::Device("down".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn catch_panic_captures_message() {
        let result: Result<()> = catch_panic("job-7", async { panic!("speaker exploded") }).await;

        match result {
            Err(Error::PanicRecovered {
                context, message, ..
            }) => {
                assert_eq!(context, "job-7");
                assert_eq!(message, "speaker exploded");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[inline(never)]
    fn overheat_speaker_driver() -> Result<()> {
        panic!("driver overheated")
    }

    #[tokio::test]
    async fn catch_panic_backtrace_points_at_panic_site() {
        let result = catch_panic("job-8", async { overheat_speaker_driver() }).await;

        let Err(Error::PanicRecovered { backtrace, .. }) = result else {
            panic!("expected a recovered panic");
        };
        assert!(backtrace.contains("overheat_speaker_driver"), "backtrace: {backtrace}");
    }

    #[tokio::test]
    async fn panic_trace_is_consumed_once() {
        let _ = catch_panic::<(), _>("job-9", async { panic!("first") }).await;
        assert!(PANIC_TRACE.with(|slot| slot.borrow().is_none()));
    }

    #[tokio::test]
    async fn guarded_task_panic_does_not_propagate() {
        let handle = spawn_guarded("boom", async { panic!("background failure") });
        assert!(handle.await.is_ok());
    }
}
