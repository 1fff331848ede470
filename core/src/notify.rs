use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::parser::{ParsedEvent, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyState {
    Doing,
    Done,
    Error,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub text: String,
    pub state: NotifyState,
    pub progress: Option<u8>,
    pub detail: Option<String>,
    pub elapsed: Option<Duration>,
}

impl Notification {
    pub fn new(title: impl Into<String>, text: impl Into<String>, state: NotifyState) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            state,
            progress: None,
            detail: None,
            elapsed: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state != NotifyState::Doing
    }
}

/// Fire-and-forget sink for user-facing progress and results.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: Notification);

    /// Raw classified tool output, for sinks that echo it.
    fn tool_output(&self, _stream: StreamKind, _event: &ParsedEvent) {}
}

impl NotificationSink for mpsc::UnboundedSender<Notification> {
    fn publish(&self, notification: Notification) {
        let _ = self.send(notification);
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    published: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn terminal(&self) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(Notification::is_terminal)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, notification: Notification) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.publish(Notification::new("Build", "Compiling", NotifyState::Doing).with_progress(10));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.progress, Some(10));
        assert!(!received.is_terminal());
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_elapsed(Duration::from_secs(125)), "2m 5s");
    }
}
