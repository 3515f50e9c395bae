//! Job abstraction executed by the worker pool

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Job urgency; higher values are more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Priority(pub i32);

impl Priority {
    /// Emergency actions such as stopping playback
    pub const URGENT: Self = Self(100);
    /// Direct user commands
    pub const HIGH: Self = Self(80);
    /// Regular query handling
    pub const NORMAL: Self = Self(50);
    /// Housekeeping such as health checks
    pub const LOW: Self = Self(30);
    /// Bulk background work
    pub const BATCH: Self = Self(10);

    /// Whether jobs of this priority skip the batch accumulator
    #[must_use]
    pub const fn bypasses_batching(self) -> bool {
        self.0 > Self::NORMAL.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution context handed to a running job
///
/// Carries the job's deadline and a token that fires when the owning pool
/// shuts down. Long-running jobs should select on [`JobContext::cancelled`].
#[derive(Debug, Clone)]
pub struct JobContext {
    worker_id: usize,
    deadline: Instant,
    cancel: CancellationToken,
}

impl JobContext {
    /// Create a context for a job running on `worker_id`
    #[must_use]
    pub const fn new(worker_id: usize, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            worker_id,
            deadline,
            cancel,
        }
    }

    /// Worker executing the job
    #[must_use]
    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Instant after which the worker abandons the job
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the pool has asked jobs to wind down
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the pool shuts down
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// A unit of asynchronous work
#[async_trait]
pub trait Job: Send + Sync {
    /// Identifier used for tracing; not required to be unique
    fn id(&self) -> &str;

    /// Urgency of the job
    fn priority(&self) -> Priority;

    /// When the job was created
    fn created_at(&self) -> Instant;

    /// Run the job
    ///
    /// # Errors
    ///
    /// Returns error if the underlying operation fails; the worker logs it
    async fn execute(&self, ctx: &JobContext) -> Result<()>;
}

/// Owned, type-erased job
pub type BoxedJob = Box<dyn Job>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_above_normal_bypasses_batching() {
        assert!(Priority::URGENT.bypasses_batching());
        assert!(Priority::HIGH.bypasses_batching());
        assert!(Priority(51).bypasses_batching());
        assert!(!Priority::NORMAL.bypasses_batching());
        assert!(!Priority::LOW.bypasses_batching());
        assert!(!Priority::BATCH.bypasses_batching());
    }

    #[test]
    fn priorities_order_by_urgency() {
        assert!(Priority::URGENT > Priority::HIGH);
        assert!(Priority::LOW < Priority::NORMAL);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[tokio::test]
    async fn context_reflects_cancellation() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(3, Instant::now(), token.child_token());

        assert_eq!(ctx.worker_id(), 3);
        assert!(!ctx.is_cancelled());

        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
