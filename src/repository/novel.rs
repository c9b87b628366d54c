//! Novel and chapter persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{AnalysisStatus, Chapter, ChapterMeta, Novel, PrescanStatus};
use crate::FabulaError;

/// Repository for novels and their chapters.
///
/// Chapter text itself is written once at import and treated as read-only
/// by the analysis core; only status flags are mutated afterwards.
#[async_trait]
pub trait NovelRepository: Send + Sync {
    async fn create_novel(&self, novel: &Novel) -> Result<(), FabulaError>;
    async fn get_novel(&self, id: &str) -> Result<Option<Novel>, FabulaError>;
    async fn list_novels(&self) -> Result<Vec<Novel>, FabulaError>;
    /// Deletes the novel and, via foreign keys, every derived row.
    async fn delete_novel(&self, id: &str) -> Result<bool, FabulaError>;
    async fn set_prescan_status(&self, id: &str, status: PrescanStatus) -> Result<(), FabulaError>;

    async fn insert_chapter(&self, chapter: &Chapter) -> Result<(), FabulaError>;
    async fn get_chapter(
        &self,
        novel_id: &str,
        chapter_num: u32,
    ) -> Result<Option<Chapter>, FabulaError>;
    async fn list_chapter_meta(&self, novel_id: &str) -> Result<Vec<ChapterMeta>, FabulaError>;
    async fn set_chapter_status(
        &self,
        novel_id: &str,
        chapter_num: u32,
        status: AnalysisStatus,
    ) -> Result<(), FabulaError>;
    async fn set_chapter_excluded(
        &self,
        novel_id: &str,
        chapter_num: u32,
        excluded: bool,
    ) -> Result<(), FabulaError>;
}

pub struct SqliteNovelRepository {
    pool: SqlitePool,
}

impl SqliteNovelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn novel_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Novel, FabulaError> {
    Ok(Novel {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        total_chapters: row.try_get::<i64, _>("total_chapters")? as u32,
        total_words: row.try_get::<i64, _>("total_words")? as u64,
        content_hash: row.try_get("content_hash")?,
        prescan_status: PrescanStatus::parse(&row.try_get::<String, _>("prescan_status")?),
        is_sample: row.try_get::<i64, _>("is_sample")? != 0,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
    })
}

fn chapter_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Chapter, FabulaError> {
    Ok(Chapter {
        novel_id: row.try_get("novel_id")?,
        chapter_num: row.try_get::<i64, _>("chapter_num")? as u32,
        volume_num: row
            .try_get::<Option<i64>, _>("volume_num")?
            .map(|v| v as u32),
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        word_count: row.try_get::<i64, _>("word_count")? as u32,
        analysis_status: AnalysisStatus::parse(&row.try_get::<String, _>("analysis_status")?),
        is_excluded: row.try_get::<i64, _>("is_excluded")? != 0,
    })
}

#[async_trait]
impl NovelRepository for SqliteNovelRepository {
    async fn create_novel(&self, novel: &Novel) -> Result<(), FabulaError> {
        sqlx::query(
            "INSERT INTO novels (id, title, author, total_chapters, total_words, content_hash, prescan_status, is_sample, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&novel.id)
        .bind(&novel.title)
        .bind(&novel.author)
        .bind(novel.total_chapters as i64)
        .bind(novel.total_words as i64)
        .bind(&novel.content_hash)
        .bind(novel.prescan_status.as_str())
        .bind(novel.is_sample as i64)
        .bind(novel.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_novel(&self, id: &str) -> Result<Option<Novel>, FabulaError> {
        let row = sqlx::query("SELECT * FROM novels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| novel_from_row(&r)).transpose()
    }

    async fn list_novels(&self) -> Result<Vec<Novel>, FabulaError> {
        let rows = sqlx::query("SELECT * FROM novels ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(novel_from_row).collect()
    }

    async fn delete_novel(&self, id: &str) -> Result<bool, FabulaError> {
        let result = sqlx::query("DELETE FROM novels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_prescan_status(&self, id: &str, status: PrescanStatus) -> Result<(), FabulaError> {
        sqlx::query("UPDATE novels SET prescan_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_chapter(&self, chapter: &Chapter) -> Result<(), FabulaError> {
        sqlx::query(
            "INSERT OR REPLACE INTO chapters (novel_id, chapter_num, volume_num, title, content, word_count, analysis_status, is_excluded)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chapter.novel_id)
        .bind(chapter.chapter_num as i64)
        .bind(chapter.volume_num.map(|v| v as i64))
        .bind(&chapter.title)
        .bind(&chapter.content)
        .bind(chapter.word_count as i64)
        .bind(chapter.analysis_status.as_str())
        .bind(chapter.is_excluded as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chapter(
        &self,
        novel_id: &str,
        chapter_num: u32,
    ) -> Result<Option<Chapter>, FabulaError> {
        let row = sqlx::query("SELECT * FROM chapters WHERE novel_id = ? AND chapter_num = ?")
            .bind(novel_id)
            .bind(chapter_num as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| chapter_from_row(&r)).transpose()
    }

    async fn list_chapter_meta(&self, novel_id: &str) -> Result<Vec<ChapterMeta>, FabulaError> {
        let rows = sqlx::query(
            "SELECT chapter_num, volume_num, title, word_count, analysis_status, is_excluded
             FROM chapters WHERE novel_id = ? ORDER BY chapter_num",
        )
        .bind(novel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ChapterMeta {
                    chapter_num: row.try_get::<i64, _>("chapter_num")? as u32,
                    volume_num: row
                        .try_get::<Option<i64>, _>("volume_num")?
                        .map(|v| v as u32),
                    title: row.try_get("title")?,
                    word_count: row.try_get::<i64, _>("word_count")? as u32,
                    analysis_status: AnalysisStatus::parse(
                        &row.try_get::<String, _>("analysis_status")?,
                    ),
                    is_excluded: row.try_get::<i64, _>("is_excluded")? != 0,
                })
            })
            .collect()
    }

    async fn set_chapter_status(
        &self,
        novel_id: &str,
        chapter_num: u32,
        status: AnalysisStatus,
    ) -> Result<(), FabulaError> {
        sqlx::query("UPDATE chapters SET analysis_status = ? WHERE novel_id = ? AND chapter_num = ?")
            .bind(status.as_str())
            .bind(novel_id)
            .bind(chapter_num as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_chapter_excluded(
        &self,
        novel_id: &str,
        chapter_num: u32,
        excluded: bool,
    ) -> Result<(), FabulaError> {
        sqlx::query("UPDATE chapters SET is_excluded = ? WHERE novel_id = ? AND chapter_num = ?")
            .bind(excluded as i64)
            .bind(novel_id)
            .bind(chapter_num as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
