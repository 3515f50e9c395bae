//! Error types for the speaker bridge

use std::time::Duration;

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the speaker bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on a stopped or not-yet-started component
    #[error("not running")]
    NotRunning,

    /// Component started twice without an intervening stop
    #[error("already running")]
    AlreadyRunning,

    /// The job queue had no free slot at submission time
    #[error("job queue is full")]
    QueueFull,

    /// Cancelled while waiting for a rate limiter token
    #[error("admission cancelled while waiting for a token")]
    AdmissionCancelled,

    /// Job reported a failure from its underlying operation
    #[error("job execution failed: {0}")]
    JobExecution(String),

    /// Job exceeded its execution deadline
    #[error("job timed out after {0:?}")]
    JobTimeout(Duration),

    /// A panic was caught at a containment boundary
    #[error("panic recovered in {context}: {message}")]
    PanicRecovered {
        /// Where the panic was caught (job id or operation name)
        context: String,
        /// Panic payload rendered as text
        message: String,
        /// Backtrace captured at the recovery boundary
        backtrace: String,
    },

    /// Circuit breaker rejected the call without invoking the operation
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// Recovery manager gave up on an operation
    #[error("{name} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Operation name
        name: String,
        /// Total attempts made
        attempts: u32,
        /// Error from the final attempt
        last: Box<Error>,
    },

    /// Operation cancelled by its caller
    #[error("cancelled")]
    Cancelled,

    /// Chat completion error
    #[error("chat error: {0}")]
    Chat(String),

    /// Speaker device error
    #[error("device error: {0}")]
    Device(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
