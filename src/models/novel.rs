//! Novels and chapters as stored in the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of the whole-book pre-scan for a novel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrescanStatus {
    Running,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Pending,
}

impl PrescanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PrescanStatus::Pending => "pending",
            PrescanStatus::Running => "running",
            PrescanStatus::Completed => "completed",
            PrescanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => PrescanStatus::Running,
            "completed" => PrescanStatus::Completed,
            "failed" => PrescanStatus::Failed,
            _ => PrescanStatus::Pending,
        }
    }
}

/// Per-chapter analysis state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Analyzing,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Pending,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "analyzing" => AnalysisStatus::Analyzing,
            "completed" => AnalysisStatus::Completed,
            "failed" => AnalysisStatus::Failed,
            _ => AnalysisStatus::Pending,
        }
    }
}

/// A novel; owns all derived state (facts, world structure, dictionary, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Novel {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub total_chapters: u32,
    pub total_words: u64,
    pub content_hash: String,
    pub prescan_status: PrescanStatus,
    pub is_sample: bool,
    pub created_at: DateTime<Utc>,
}

/// A chapter with full text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub novel_id: String,
    pub chapter_num: u32,
    pub volume_num: Option<u32>,
    pub title: String,
    pub content: String,
    pub word_count: u32,
    pub analysis_status: AnalysisStatus,
    pub is_excluded: bool,
}

/// Chapter listing row without the full text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterMeta {
    pub chapter_num: u32,
    pub volume_num: Option<u32>,
    pub title: String,
    pub word_count: u32,
    pub analysis_status: AnalysisStatus,
    pub is_excluded: bool,
}

/// Input for importing one pre-segmented chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterImport {
    pub chapter_num: u32,
    #[serde(default)]
    pub volume_num: Option<u32>,
    #[serde(default)]
    pub title: String,
    pub content: String,
}
