//! Message-processing and TTS playback jobs

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{ChatClient, QueryMessage, SpeakerDevice};
use crate::engine::{Job, JobContext, Priority};
use crate::{Error, Result};

/// Characters of the payload kept in job ids
const ID_PREVIEW_CHARS: usize = 10;

fn job_id(kind: &str, text: &str) -> String {
    let preview: String = text.chars().take(ID_PREVIEW_CHARS).collect();
    format!("{kind}-{}-{preview}", Uuid::new_v4().simple())
}

/// Sentence spoken when the chat provider fails
#[must_use]
pub fn fallback_reply(err: &Error) -> &'static str {
    let text = err.to_string().to_lowercase();

    if matches!(err, Error::Config(_)) || text.contains("unsupported protocol scheme") {
        "The assistant is not fully configured yet. Please finish setup in the admin panel."
    } else if text.contains("401") || text.contains("403") || text.contains("unauthorized") {
        "The assistant could not authenticate. Please check the API key."
    } else if matches!(err, Error::JobTimeout(_)) || text.contains("timeout") || text.contains("timed out") || text.contains("connection") {
        "The assistant service is not responding. Please check the network connection."
    } else {
        "Sorry, I can't answer that right now. Please try again later."
    }
}

/// Answers a query through the chat client and speaks the reply
pub struct MessageJob {
    id: String,
    message: QueryMessage,
    priority: Priority,
    created_at: Instant,
    chat: Arc<dyn ChatClient>,
    speaker: Arc<dyn SpeakerDevice>,
}

impl MessageJob {
    /// Create a job for `message`
    #[must_use]
    pub fn new(
        message: QueryMessage,
        priority: Priority,
        chat: Arc<dyn ChatClient>,
        speaker: Arc<dyn SpeakerDevice>,
    ) -> Self {
        Self {
            id: job_id("msg", &message.text),
            message,
            priority,
            created_at: Instant::now(),
            chat,
            speaker,
        }
    }

    /// The query being answered
    #[must_use]
    pub const fn message(&self) -> &QueryMessage {
        &self.message
    }

    async fn run(&self) -> Result<()> {
        tracing::debug!(job_id = %self.id, chat = self.chat.name(), query = %self.message.text, "answering query");

        let reply = match self.chat.reply(&self.message.text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(job_id = %self.id, error = %e, "chat reply failed");
                let fallback = fallback_reply(&e);
                self.speaker.say(fallback).await?;
                return Err(e);
            }
        };

        self.speaker.say(&reply).await
    }
}

#[async_trait]
impl Job for MessageJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        tokio::select! {
            () = ctx.cancelled() => Err(Error::Cancelled),
            result = self.run() => result,
        }
    }
}

/// Speaks a fixed text on the device
pub struct TtsJob {
    id: String,
    text: String,
    priority: Priority,
    created_at: Instant,
    speaker: Arc<dyn SpeakerDevice>,
}

impl TtsJob {
    /// Create a playback job for `text`
    #[must_use]
    pub fn new(text: impl Into<String>, priority: Priority, speaker: Arc<dyn SpeakerDevice>) -> Self {
        let text = text.into();
        Self {
            id: job_id("tts", &text),
            text,
            priority,
            created_at: Instant::now(),
            speaker,
        }
    }

    /// Text to be spoken
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[async_trait]
impl Job for TtsJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    async fn execute(&self, ctx: &JobContext) -> Result<()> {
        tracing::debug!(job_id = %self.id, device = self.speaker.name(), "playing tts");
        tokio::select! {
            () = ctx.cancelled() => Err(Error::Cancelled),
            result = self.speaker.say(&self.text) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    struct ScriptedChat {
        answer: std::result::Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl ChatClient for ScriptedChat {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn reply(&self, _query: &str) -> Result<String> {
            self.answer
                .map(ToString::to_string)
                .map_err(|e| Error::Chat(e.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingSpeaker {
        spoken: Mutex<Vec<String>>,
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

    fn ctx() -> JobContext {
        JobContext::new(0, Instant::now() + Duration::from_secs(30), CancellationToken::new())
    }

    #[test]
    fn job_ids_carry_kind_and_preview() {
        let id = job_id("msg", "what is the weather like");
        assert!(id.starts_with("msg-"));
        assert!(id.ends_with("-what is th"));
    }

    #[test]
    fn job_id_preview_respects_char_boundaries() {
        let id = job_id("tts", "今天天气怎么样呢朋友们好");
        assert!(id.ends_with("-今天天气怎么样呢朋友"));
    }

    #[test]
    fn fallback_matches_failure_kind() {
        assert!(fallback_reply(&Error::Chat("HTTP 401 Unauthorized".into())).contains("authenticate"));
        assert!(fallback_reply(&Error::Chat("connection refused".into())).contains("not responding"));
        assert!(fallback_reply(&Error::Config("no api key".into())).contains("configured"));
        assert!(fallback_reply(&Error::Chat("model overloaded".into())).starts_with("Sorry"));
    }

    #[tokio::test]
    async fn message_job_speaks_reply() {
        let speaker = Arc::new(RecordingSpeaker::default());
        let job = MessageJob::new(
            QueryMessage::new("hello"),
            Priority::NORMAL,
            Arc::new(ScriptedChat { answer: Ok("hi there") }),
            speaker.clone(),
        );

        job.execute(&ctx()).await.unwrap();
        assert_eq!(*speaker.spoken.lock().unwrap(), vec!["hi there"]);
    }

    #[tokio::test]
    async fn message_job_speaks_fallback_on_chat_failure() {
        let speaker = Arc::new(RecordingSpeaker::default());
        let job = MessageJob::new(
            QueryMessage::new("hello"),
            Priority::NORMAL,
            Arc::new(ScriptedChat { answer: Err("403 forbidden") }),
            speaker.clone(),
        );

        let result = job.execute(&ctx()).await;
        assert!(matches!(result, Err(Error::Chat(_))));

        let spoken = speaker.spoken.lock().unwrap();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].contains("authenticate"));
    }

    #[tokio::test]
    async fn tts_job_stops_when_cancelled() {
        struct StuckSpeaker;

        #[async_trait]
        impl SpeakerDevice for StuckSpeaker {
            fn name(&self) -> &'static str {
                "stuck"
            }

            async fn say(&self, _text: &str) -> Result<()> {
                std::future::pending().await
            }
        }

        let token = CancellationToken::new();
        let ctx = JobContext::new(0, Instant::now(), token.clone());
        let job = TtsJob::new("never heard", Priority::HIGH, Arc::new(StuckSpeaker));
        assert_eq!(job.text(), "never heard");

        token.cancel();
        assert!(matches!(job.execute(&ctx).await, Err(Error::Cancelled)));
    }
}
