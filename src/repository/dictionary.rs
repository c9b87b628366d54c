//! Pre-scan entity dictionary persistence.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::{DictSource, EntityDictEntry, EntityType};
use crate::FabulaError;

#[async_trait]
pub trait DictionaryRepository: Send + Sync {
    /// Replace the full entry set; callers merge before writing.
    async fn put_entries(
        &self,
        novel_id: &str,
        entries: &[EntityDictEntry],
    ) -> Result<(), FabulaError>;

    async fn list_entries(
        &self,
        novel_id: &str,
        entity_type: Option<EntityType>,
        limit: Option<usize>,
    ) -> Result<Vec<EntityDictEntry>, FabulaError>;

    async fn get_entry(
        &self,
        novel_id: &str,
        name: &str,
    ) -> Result<Option<EntityDictEntry>, FabulaError>;

    async fn count_entries(&self, novel_id: &str) -> Result<u64, FabulaError>;
}

pub struct SqliteDictionaryRepository {
    pool: SqlitePool,
}

impl SqliteDictionaryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EntityDictEntry, FabulaError> {
    let aliases_json: String = row.try_get("aliases")?;
    Ok(EntityDictEntry {
        name: row.try_get("name")?,
        entity_type: EntityType::parse(&row.try_get::<String, _>("entity_type")?),
        frequency: row.try_get::<i64, _>("frequency")? as u32,
        confidence: row.try_get::<f64, _>("confidence")? as f32,
        aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
        source: DictSource::parse(&row.try_get::<String, _>("source")?),
        sample_context: row.try_get("sample_context")?,
    })
}

#[async_trait]
impl DictionaryRepository for SqliteDictionaryRepository {
    async fn put_entries(
        &self,
        novel_id: &str,
        entries: &[EntityDictEntry],
    ) -> Result<(), FabulaError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entity_dictionary WHERE novel_id = ?")
            .bind(novel_id)
            .execute(&mut *tx)
            .await?;
        for entry in entries {
            sqlx::query(
                "INSERT OR REPLACE INTO entity_dictionary
                 (novel_id, name, entity_type, frequency, confidence, aliases, source, sample_context)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(novel_id)
            .bind(&entry.name)
            .bind(entry.entity_type.as_str())
            .bind(entry.frequency as i64)
            .bind(entry.confidence as f64)
            .bind(serde_json::to_string(&entry.aliases)?)
            .bind(entry.source.as_str())
            .bind(&entry.sample_context)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_entries(
        &self,
        novel_id: &str,
        entity_type: Option<EntityType>,
        limit: Option<usize>,
    ) -> Result<Vec<EntityDictEntry>, FabulaError> {
        let limit = limit.unwrap_or(10_000) as i64;
        let rows = match entity_type {
            Some(t) => {
                sqlx::query(
                    "SELECT * FROM entity_dictionary WHERE novel_id = ? AND entity_type = ?
                     ORDER BY frequency DESC LIMIT ?",
                )
                .bind(novel_id)
                .bind(t.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM entity_dictionary WHERE novel_id = ?
                     ORDER BY frequency DESC LIMIT ?",
                )
                .bind(novel_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(entry_from_row).collect()
    }

    async fn get_entry(
        &self,
        novel_id: &str,
        name: &str,
    ) -> Result<Option<EntityDictEntry>, FabulaError> {
        let row = sqlx::query("SELECT * FROM entity_dictionary WHERE novel_id = ? AND name = ?")
            .bind(novel_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| entry_from_row(&r)).transpose()
    }

    async fn count_entries(&self, novel_id: &str) -> Result<u64, FabulaError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entity_dictionary WHERE novel_id = ?")
            .bind(novel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}
