//! Embedding client.
//!
//! Embeddings are produced by an external HTTP collaborator (an Ollama
//! server by default) and consumed opportunistically: a failed or disabled
//! embedding never fails analysis, it only degrades the semantic Q&A index.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::FabulaError;

/// Dimensionality of the semantic index vectors.
pub const EMBEDDING_DIM: usize = 768;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, FabulaError>;

    /// False when embedding is configured off; callers skip index upkeep.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Ollama `/api/embeddings` client.
pub struct OllamaEmbeddingService {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OllamaEmbeddingService {
    pub fn new(base_url: &str, model: &str) -> Self {
        OllamaEmbeddingService {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingService for OllamaEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, FabulaError> {
        let body = serde_json::json!({ "model": self.model, "prompt": text });
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| FabulaError::Embedding(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FabulaError::Embedding(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let decoded: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| FabulaError::Embedding(e.to_string()))?;
        if decoded.embedding.is_empty() {
            return Err(FabulaError::Embedding("empty embedding".to_string()));
        }
        // A wrong-sized vector means the configured model is not the
        // 768-dim one the index expects; storing it would poison retrieval.
        if decoded.embedding.len() != EMBEDDING_DIM {
            return Err(FabulaError::Embedding(format!(
                "model '{}' returned {} dimensions, expected {EMBEDDING_DIM}",
                self.model,
                decoded.embedding.len()
            )));
        }
        Ok(decoded.embedding)
    }
}

/// Disabled embedding backend.
pub struct NoopEmbeddingService;

#[async_trait]
impl EmbeddingService for NoopEmbeddingService {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, FabulaError> {
        Err(FabulaError::Embedding("embedding disabled".to_string()))
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Create an embedding service from settings; an empty base URL disables it.
pub fn create_embedding_service(
    base_url: &str,
    model: &str,
) -> Arc<dyn EmbeddingService + Send + Sync> {
    if base_url.is_empty() {
        info!("Embedding disabled (no endpoint configured)");
        Arc::new(NoopEmbeddingService)
    } else {
        Arc::new(OllamaEmbeddingService::new(base_url, model))
    }
}
