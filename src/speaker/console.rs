//! Console collaborators for running without a device or chat provider

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatClient, QueryMessage, QuerySource, SpeakerDevice};
use crate::Result;

/// Entries kept by [`ConsoleHistory`]
const HISTORY_LIMIT: usize = 100;

/// Chat client that repeats the query back
#[derive(Debug, Clone, Default)]
pub struct EchoChat;

#[async_trait]
impl ChatClient for EchoChat {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn reply(&self, query: &str) -> Result<String> {
        Ok(format!("You said: {query}"))
    }
}

/// Speaker that prints to stdout
#[derive(Debug, Clone, Default)]
pub struct ConsoleSpeaker;

#[async_trait]
impl SpeakerDevice for ConsoleSpeaker {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn say(&self, text: &str) -> Result<()> {
        println!("🔊 {text}");
        Ok(())
    }
}

/// Conversation history filled from console input
#[derive(Debug, Default)]
pub struct ConsoleHistory {
    queries: Mutex<VecDeque<QueryMessage>>,
}

impl ConsoleHistory {
    /// Record a typed query as heard now
    pub fn record(&self, text: impl Into<String>) {
        let mut queries = self.queries.lock().unwrap_or_else(|e| e.into_inner());
        if queries.len() == HISTORY_LIMIT {
            queries.pop_front();
        }
        queries.push_back(QueryMessage::new(text));
    }
}

#[async_trait]
impl QuerySource for ConsoleHistory {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn is_playing(&self) -> Result<bool> {
        Ok(false)
    }

    async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryMessage>> {
        let queries = self.queries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = queries.len().saturating_sub(limit);
        Ok(queries.iter().skip(skip).cloned().collect())
    }
}
