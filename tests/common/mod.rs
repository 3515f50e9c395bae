//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use speaker_bridge::{BoxedJob, ChatClient, Error, Job, JobContext, Priority, Result, SpeakerDevice};

/// Tracks how many jobs run at once and in which order they started
#[derive(Default)]
pub struct JobTally {
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub completed: AtomicUsize,
    pub started: Mutex<Vec<String>>,
}

impl JobTally {
    pub fn started_ids(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Job that sleeps for a fixed time while reporting to a [`JobTally`]
pub struct SleepJob {
    id: String,
    priority: Priority,
    created_at: Instant,
    duration: Duration,
    tally: Arc<JobTally>,
}

#[async_trait]
impl Job for SleepJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    async fn execute(&self, _ctx: &JobContext) -> Result<()> {
        self.tally.started.lock().unwrap().push(self.id.clone());
        let now = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.duration).await;

        self.tally.active.fetch_sub(1, Ordering::SeqCst);
        self.tally.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Create a boxed [`SleepJob`]
pub fn sleep_job(id: &str, priority: Priority, duration: Duration, tally: &Arc<JobTally>) -> BoxedJob {
    Box::new(SleepJob {
        id: id.to_string(),
        priority,
        created_at: Instant::now(),
        duration,
        tally: Arc::clone(tally),
    })
}

/// Chat client answering with a fixed prefix, or failing on demand
pub struct ScriptedChat {
    pub fail_with: Option<String>,
}

#[async_trait]
impl ChatClient for ScriptedChat {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn reply(&self, query: &str) -> Result<String> {
        match &self.fail_with {
            Some(reason) => Err(Error::Chat(reason.clone())),
            None => Ok(format!("answer to {query}")),
        }
    }
}

/// Speaker recording everything it is asked to say
#[derive(Default)]
pub struct RecordingSpeaker {
    spoken: Mutex<Vec<String>>,
}

impl RecordingSpeaker {
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeakerDevice for RecordingSpeaker {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn say(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
