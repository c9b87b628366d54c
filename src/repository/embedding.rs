//! Semantic-index vector storage.
//!
//! Vectors live in namespaces `{novel_id}_chapters` and `{novel_id}_entities`
//! and are queried with a brute-force cosine scan; fiction-scale corpora stay
//! well under the point where that matters.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::FabulaError;

/// One stored vector with the text it was computed from.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub key: String,
    pub content: String,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait EmbeddingRepository: Send + Sync {
    async fn put_embedding(
        &self,
        novel_id: &str,
        namespace: &str,
        key: &str,
        content: &str,
        vector: &[f32],
    ) -> Result<(), FabulaError>;

    async fn list_embeddings(
        &self,
        novel_id: &str,
        namespace: &str,
    ) -> Result<Vec<StoredEmbedding>, FabulaError>;
}

pub struct SqliteEmbeddingRepository {
    pool: SqlitePool,
}

impl SqliteEmbeddingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingRepository for SqliteEmbeddingRepository {
    async fn put_embedding(
        &self,
        novel_id: &str,
        namespace: &str,
        key: &str,
        content: &str,
        vector: &[f32],
    ) -> Result<(), FabulaError> {
        sqlx::query(
            "INSERT OR REPLACE INTO embeddings (novel_id, namespace, key, content, vector)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(novel_id)
        .bind(namespace)
        .bind(key)
        .bind(content)
        .bind(serde_json::to_string(vector)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_embeddings(
        &self,
        novel_id: &str,
        namespace: &str,
    ) -> Result<Vec<StoredEmbedding>, FabulaError> {
        let rows = sqlx::query(
            "SELECT key, content, vector FROM embeddings WHERE novel_id = ? AND namespace = ?",
        )
        .bind(novel_id)
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;
        let mut embeddings = Vec::with_capacity(rows.len());
        for row in rows {
            let vector_json: String = row.try_get("vector")?;
            embeddings.push(StoredEmbedding {
                key: row.try_get("key")?,
                content: row.try_get("content")?,
                vector: serde_json::from_str(&vector_json).unwrap_or_default(),
            });
        }
        Ok(embeddings)
    }
}
