//! Analysis tasks and the progress events they broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::models::novel::AnalysisStatus;

/// Task lifecycle: pending → running → (paused ⇄ running)* → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
    #[default]
    #[serde(other)]
    Pending,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            "cancelled" => TaskStatus::Cancelled,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }
}

/// One analysis run over a chapter range of one novel.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: String,
    pub novel_id: String,
    pub status: TaskStatus,
    pub chapter_start: u32,
    pub chapter_end: u32,
    /// Last chapter the loop entered; the resume point after a restart.
    pub current_chapter: Option<u32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-chapter extraction counters included in progress events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub characters: usize,
    pub relationships: usize,
    pub locations: usize,
    pub events: usize,
}

/// Accumulated token usage and cost for a running task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub cost_cny: f64,
}

/// Cost estimate for a planned analysis range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub is_cloud: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub cost_cny: f64,
}

/// Progress stream message, tagged the way consumers expect on the wire.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisEvent {
    Progress {
        task_id: String,
        chapter: u32,
        total: u32,
        stats: ProgressStats,
        cost: Option<CostSnapshot>,
    },
    ChapterDone {
        task_id: String,
        chapter: u32,
        status: AnalysisStatus,
        error: Option<String>,
    },
    TaskStatus {
        task_id: String,
        status: TaskStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let ev = AnalysisEvent::ChapterDone {
            task_id: "t1".into(),
            chapter: 40,
            status: AnalysisStatus::Failed,
            error: Some("LLM timeout".into()),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "chapter_done");
        assert_eq!(json["chapter"], 40);
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
