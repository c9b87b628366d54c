//! ChapterFact persistence: one JSON value per (novel, chapter).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::models::ChapterFact;
use crate::FabulaError;

#[async_trait]
pub trait FactRepository: Send + Sync {
    /// Insert or replace: re-analysis overwrites the previous fact.
    async fn upsert_fact(
        &self,
        novel_id: &str,
        chapter_num: u32,
        fact: &ChapterFact,
        model: &str,
        prompt_version: &str,
    ) -> Result<(), FabulaError>;

    async fn get_fact(
        &self,
        novel_id: &str,
        chapter_num: u32,
    ) -> Result<Option<ChapterFact>, FabulaError>;

    /// All facts for a novel in ascending chapter order, optionally
    /// restricted to an inclusive chapter range.
    async fn list_facts(
        &self,
        novel_id: &str,
        range: Option<(u32, u32)>,
    ) -> Result<Vec<(u32, ChapterFact)>, FabulaError>;

    async fn count_facts(&self, novel_id: &str) -> Result<u64, FabulaError>;
}

pub struct SqliteFactRepository {
    pool: SqlitePool,
}

impl SqliteFactRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FactRepository for SqliteFactRepository {
    async fn upsert_fact(
        &self,
        novel_id: &str,
        chapter_num: u32,
        fact: &ChapterFact,
        model: &str,
        prompt_version: &str,
    ) -> Result<(), FabulaError> {
        let json = serde_json::to_string(fact)?;
        sqlx::query(
            "INSERT OR REPLACE INTO chapter_facts (novel_id, chapter_num, fact, model, prompt_version, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(novel_id)
        .bind(chapter_num as i64)
        .bind(json)
        .bind(model)
        .bind(prompt_version)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_fact(
        &self,
        novel_id: &str,
        chapter_num: u32,
    ) -> Result<Option<ChapterFact>, FabulaError> {
        let row = sqlx::query("SELECT fact FROM chapter_facts WHERE novel_id = ? AND chapter_num = ?")
            .bind(novel_id)
            .bind(chapter_num as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.try_get("fact")?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_facts(
        &self,
        novel_id: &str,
        range: Option<(u32, u32)>,
    ) -> Result<Vec<(u32, ChapterFact)>, FabulaError> {
        let rows = match range {
            Some((start, end)) => {
                sqlx::query(
                    "SELECT chapter_num, fact FROM chapter_facts
                     WHERE novel_id = ? AND chapter_num >= ? AND chapter_num <= ?
                     ORDER BY chapter_num",
                )
                .bind(novel_id)
                .bind(start as i64)
                .bind(end as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT chapter_num, fact FROM chapter_facts WHERE novel_id = ? ORDER BY chapter_num",
                )
                .bind(novel_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut facts = Vec::with_capacity(rows.len());
        for row in rows {
            let chapter_num = row.try_get::<i64, _>("chapter_num")? as u32;
            let json: String = row.try_get("fact")?;
            // A single undecodable row degrades to empty rather than hiding
            // every other chapter of the novel.
            match serde_json::from_str::<ChapterFact>(&json) {
                Ok(fact) => facts.push((chapter_num, fact)),
                Err(e) => {
                    tracing::warn!(novel_id, chapter_num, error = %e, "skipping undecodable fact row");
                }
            }
        }
        Ok(facts)
    }

    async fn count_facts(&self, novel_id: &str) -> Result<u64, FabulaError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chapter_facts WHERE novel_id = ?")
            .bind(novel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}
