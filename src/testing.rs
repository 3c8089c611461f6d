//! In-memory fakes shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::platform::MessageSender;
use crate::scheduler::tasks::RunRecorder;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub chat_id: String,
    pub kind: String,
    pub content: String,
    pub source: String,
}

/// Records every send; can be told to fail or to stall.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMessage>>,
    counter: AtomicUsize,
    failing: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_next_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, chat_id: &str, kind: &str, content: &str, source: &str) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("send message error: code=230002, msg=bot not in chat");
        }
        self.sent.lock().unwrap().push(SentMessage {
            chat_id: chat_id.to_string(),
            kind: kind.to_string(),
            content: content.to_string(),
            source: source.to_string(),
        });
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("om_sent_{}", n))
    }
}

#[derive(Default)]
pub struct RecordingRecorder {
    runs: Mutex<Vec<i64>>,
}

impl RecordingRecorder {
    pub fn runs(&self) -> Vec<i64> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunRecorder for RecordingRecorder {
    async fn record_last_run(&self, task_id: i64) -> Result<()> {
        self.runs.lock().unwrap().push(task_id);
        Ok(())
    }
}
