//! Speaker-side collaborators and jobs
//!
//! The chat provider and the device SDK are reached only through the
//! [`ChatClient`], [`SpeakerDevice`] and [`QuerySource`] traits.

mod console;
mod dispatcher;
mod guarded;
mod jobs;
mod poller;

pub use console::{ConsoleHistory, ConsoleSpeaker, EchoChat};
pub use dispatcher::{Dispatcher, DispatcherStatus};
pub use guarded::GuardedSpeaker;
pub use jobs::{MessageJob, TtsJob, fallback_reply};
pub use poller::{MessagePoller, PollerStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A spoken query captured by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    /// Recognized speech
    pub text: String,
    /// When the device heard it
    pub received_at: DateTime<Utc>,
}

impl QueryMessage {
    /// Create a query received now
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    /// Create a query with the device's own timestamp
    #[must_use]
    pub fn at(text: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            received_at,
        }
    }
}

/// Chat-completion provider
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Produce an answer to a user query
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails
    async fn reply(&self, query: &str) -> Result<String>;
}

/// Text-to-speech capable device
#[async_trait]
pub trait SpeakerDevice: Send + Sync {
    /// Device name for logging
    fn name(&self) -> &'static str;

    /// Speak `text` aloud
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects or drops the request
    async fn say(&self, text: &str) -> Result<()>;
}

/// Device conversation history, read by [`MessagePoller`]
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Device name for logging
    fn name(&self) -> &'static str;

    /// Whether the device is currently playing audio
    ///
    /// # Errors
    ///
    /// Returns error if the device status can't be read
    async fn is_playing(&self) -> Result<bool>;

    /// Up to `limit` of the most recent queries heard by the device
    ///
    /// # Errors
    ///
    /// Returns error if the conversation history can't be fetched
    async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryMessage>>;
}
