//! Analysis-task rows: the durable side of the task lifecycle.
//!
//! The status column is the pause/cancel signal: the orchestrator re-reads
//! it at the top of every chapter iteration, so a PATCH from the outside
//! takes effect at the next chapter boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{AnalysisTask, TaskStatus};
use crate::FabulaError;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_task(&self, task: &AnalysisTask) -> Result<(), FabulaError>;
    async fn get_task(&self, id: &str) -> Result<Option<AnalysisTask>, FabulaError>;
    async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), FabulaError>;
    async fn set_current_chapter(&self, id: &str, chapter: u32) -> Result<(), FabulaError>;
    /// A non-terminal task for this novel, if one exists.
    async fn active_task_for_novel(
        &self,
        novel_id: &str,
    ) -> Result<Option<AnalysisTask>, FabulaError>;
    /// Tasks left in `running` by a previous process; recovery targets.
    async fn running_tasks(&self) -> Result<Vec<AnalysisTask>, FabulaError>;
}

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AnalysisTask, FabulaError> {
    let parse_time = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(AnalysisTask {
        id: row.try_get("id")?,
        novel_id: row.try_get("novel_id")?,
        status: TaskStatus::parse(&row.try_get::<String, _>("status")?),
        chapter_start: row.try_get::<i64, _>("chapter_start")? as u32,
        chapter_end: row.try_get::<i64, _>("chapter_end")? as u32,
        current_chapter: row
            .try_get::<Option<i64>, _>("current_chapter")?
            .map(|v| v as u32),
        error: row.try_get("error")?,
        created_at: parse_time(row.try_get::<String, _>("created_at")?),
        updated_at: parse_time(row.try_get::<String, _>("updated_at")?),
    })
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create_task(&self, task: &AnalysisTask) -> Result<(), FabulaError> {
        sqlx::query(
            "INSERT INTO analysis_tasks (id, novel_id, status, chapter_start, chapter_end, current_chapter, error, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.novel_id)
        .bind(task.status.as_str())
        .bind(task.chapter_start as i64)
        .bind(task.chapter_end as i64)
        .bind(task.current_chapter.map(|c| c as i64))
        .bind(&task.error)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<AnalysisTask>, FabulaError> {
        let row = sqlx::query("SELECT * FROM analysis_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn set_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), FabulaError> {
        sqlx::query("UPDATE analysis_tasks SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_current_chapter(&self, id: &str, chapter: u32) -> Result<(), FabulaError> {
        sqlx::query("UPDATE analysis_tasks SET current_chapter = ?, updated_at = ? WHERE id = ?")
            .bind(chapter as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_task_for_novel(
        &self,
        novel_id: &str,
    ) -> Result<Option<AnalysisTask>, FabulaError> {
        let row = sqlx::query(
            "SELECT * FROM analysis_tasks
             WHERE novel_id = ? AND status IN ('pending', 'running', 'paused')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(novel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn running_tasks(&self) -> Result<Vec<AnalysisTask>, FabulaError> {
        let rows = sqlx::query("SELECT * FROM analysis_tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }
}
