//! Operator notification seam.
//!
//! The production transport (Telegram bot) is external; the runtime only
//! ever fires short best-effort texts: shelf-drop alerts and end-of-patrol
//! summaries. Failures to deliver must never affect task execution.

use async_trait::async_trait;
use std::sync::Mutex;

/// Fire-and-forget operator notifications. No back-pressure, no result.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

/// Writes notifications to the log. Default when no transport is wired.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        tracing::info!(notification = %text, "operator notification");
    }
}

/// Collects notifications in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) {
        self.messages
            .lock()
            .expect("notifier lock poisoned")
            .push(text.to_string());
    }
}
