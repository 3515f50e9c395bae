//! Concurrent job engine
//!
//! Admission, buffering, batching and execution of speaker jobs:
//!
//! ```text
//! message ──▶ MessageBuffer ──▶ RateLimiter ──▶ BatchAccumulator ──▶ WorkerPool
//!                                                  (normal/low)         ▲
//!                                   high/urgent ────────────────────────┘
//! ```
//!
//! [`RecoveryManager`] and [`CircuitBreaker`] wrap any fallible call made by a
//! job, such as device playback.

mod batch;
mod breaker;
mod buffer;
mod job;
mod pool;
mod rate_limiter;
mod recovery;

pub use batch::BatchAccumulator;
pub use breaker::{CircuitBreaker, CircuitState};
pub use buffer::MessageBuffer;
pub use job::{BoxedJob, Job, JobContext, Priority};
pub use pool::{JOB_TIMEOUT, MetricsSnapshot, PoolMetrics, PoolStatus, WorkerPool};
pub use rate_limiter::{LimiterStatus, RateLimiter};
pub use recovery::{RecoveryManager, catch_panic, spawn_guarded};
