//! Speaker Bridge - concurrent job engine between a smart speaker and a chat assistant
//!
//! This library provides:
//! - A bounded worker pool with per-job deadlines and panic containment
//! - Token-bucket admission control
//! - A bounded message buffer and a batch accumulator for non-urgent jobs
//! - Retry with backoff and a circuit breaker for device calls
//! - A poller feeding new device queries into the dispatcher
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Speaker device                       │
//! │        queries in  │  speech out                     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Dispatcher                          │
//! │   Buffer  │  Rate limiter  │  Batcher  │  Workers    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │         Chat client  │  Guarded speaker              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod speaker;

pub use config::Config;
pub use engine::{
    BatchAccumulator, BoxedJob, CircuitBreaker, CircuitState, Job, JobContext, MessageBuffer,
    Priority, RateLimiter, RecoveryManager, WorkerPool,
};
pub use error::{Error, Result};
pub use speaker::{
    ChatClient, Dispatcher, DispatcherStatus, GuardedSpeaker, MessagePoller, PollerStats,
    QueryMessage, QuerySource, SpeakerDevice,
};
