//! World-structure and user-override persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::world::{LayerType, WorldLayer, OVERWORLD_LAYER};
use crate::models::{OverrideType, UserOverride, WorldStructure};
use crate::FabulaError;

#[async_trait]
pub trait WorldRepository: Send + Sync {
    /// The stored structure, or the default single-layer structure if none
    /// was persisted yet. Never returns a layerless structure.
    async fn get_structure(&self, novel_id: &str) -> Result<WorldStructure, FabulaError>;
    async fn put_structure(
        &self,
        novel_id: &str,
        structure: &WorldStructure,
    ) -> Result<(), FabulaError>;

    async fn put_override(&self, value: &UserOverride) -> Result<(), FabulaError>;
    async fn get_override(
        &self,
        novel_id: &str,
        override_type: OverrideType,
        key: &str,
    ) -> Result<Option<UserOverride>, FabulaError>;
    async fn list_overrides(&self, novel_id: &str) -> Result<Vec<UserOverride>, FabulaError>;
    async fn delete_override(
        &self,
        novel_id: &str,
        override_type: OverrideType,
        key: &str,
    ) -> Result<bool, FabulaError>;
}

pub struct SqliteWorldRepository {
    pool: SqlitePool,
}

impl SqliteWorldRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorldRepository for SqliteWorldRepository {
    async fn get_structure(&self, novel_id: &str) -> Result<WorldStructure, FabulaError> {
        let row = sqlx::query("SELECT structure FROM world_structures WHERE novel_id = ?")
            .bind(novel_id)
            .fetch_optional(&self.pool)
            .await?;
        let mut structure = match row {
            Some(row) => {
                let json: String = row.try_get("structure")?;
                serde_json::from_str(&json)?
            }
            None => WorldStructure::default(),
        };
        // Repair a hand-edited or legacy row that lost the base layer.
        if structure.layers.is_empty() {
            structure.layers.push(WorldLayer {
                layer_id: OVERWORLD_LAYER.to_string(),
                name: "主世界".to_string(),
                layer_type: LayerType::Overworld,
                regions: Vec::new(),
            });
        }
        Ok(structure)
    }

    async fn put_structure(
        &self,
        novel_id: &str,
        structure: &WorldStructure,
    ) -> Result<(), FabulaError> {
        let json = serde_json::to_string(structure)?;
        sqlx::query(
            "INSERT OR REPLACE INTO world_structures (novel_id, structure, updated_at) VALUES (?, ?, ?)",
        )
        .bind(novel_id)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_override(&self, value: &UserOverride) -> Result<(), FabulaError> {
        sqlx::query(
            "INSERT OR REPLACE INTO user_overrides (novel_id, override_type, override_key, value, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&value.novel_id)
        .bind(value.override_type.as_str())
        .bind(&value.override_key)
        .bind(serde_json::to_string(&value.value)?)
        .bind(value.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_override(
        &self,
        novel_id: &str,
        override_type: OverrideType,
        key: &str,
    ) -> Result<Option<UserOverride>, FabulaError> {
        let row = sqlx::query(
            "SELECT * FROM user_overrides WHERE novel_id = ? AND override_type = ? AND override_key = ?",
        )
        .bind(novel_id)
        .bind(override_type.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| override_from_row(&r)).transpose()
    }

    async fn list_overrides(&self, novel_id: &str) -> Result<Vec<UserOverride>, FabulaError> {
        // Creation order matters: a delete_portal recorded after an
        // add_portal must win when both are replayed.
        let rows = sqlx::query("SELECT * FROM user_overrides WHERE novel_id = ? ORDER BY created_at")
            .bind(novel_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(override_from_row).collect()
    }

    async fn delete_override(
        &self,
        novel_id: &str,
        override_type: OverrideType,
        key: &str,
    ) -> Result<bool, FabulaError> {
        let result = sqlx::query(
            "DELETE FROM user_overrides WHERE novel_id = ? AND override_type = ? AND override_key = ?",
        )
        .bind(novel_id)
        .bind(override_type.as_str())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn override_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<UserOverride, FabulaError> {
    let type_str: String = row.try_get("override_type")?;
    let override_type = OverrideType::parse(&type_str).ok_or_else(|| {
        FabulaError::Database(format!("unknown override_type '{type_str}' in store"))
    })?;
    let value_json: String = row.try_get("value")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(UserOverride {
        novel_id: row.try_get("novel_id")?,
        override_type,
        override_key: row.try_get("override_key")?,
        value: serde_json::from_str(&value_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
