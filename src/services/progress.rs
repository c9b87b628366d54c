//! Progress broadcasting for analysis tasks.
//!
//! Decouples the orchestrator from whatever surface is watching (CLI,
//! desktop shell, tests). Emission is fire-and-forget: a task never fails
//! because nobody is listening.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::AnalysisEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Per-task broadcast channels.
#[derive(Default)]
pub struct ProgressHub {
    channels: Mutex<HashMap<String, broadcast::Sender<AnalysisEvent>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a task's event stream, creating the channel if needed.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<AnalysisEvent> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit an event. Lagging or absent receivers are ignored.
    pub fn emit(&self, task_id: &str, event: AnalysisEvent) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let _ = sender.send(event);
    }

    /// Drop a finished task's channel.
    pub fn close(&self, task_id: &str) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;

    #[tokio::test]
    async fn test_subscribe_then_emit() {
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe("t1");
        hub.emit(
            "t1",
            AnalysisEvent::TaskStatus {
                task_id: "t1".into(),
                status: TaskStatus::Running,
            },
        );
        let event = rx.recv().await.unwrap();
        matches!(event, AnalysisEvent::TaskStatus { .. });
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_is_silent() {
        let hub = ProgressHub::new();
        hub.emit(
            "t2",
            AnalysisEvent::TaskStatus {
                task_id: "t2".into(),
                status: TaskStatus::Completed,
            },
        );
        // No panic, no error.
    }
}
