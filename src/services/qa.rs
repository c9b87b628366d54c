//! Semantic Q&A over the analyzed novel.
//!
//! Chapter digests and entity cards are embedded opportunistically after
//! analysis; questions retrieve the top-scoring snippets by cosine
//! similarity and stream the answer token by token. The extractor never
//! streams; Q&A always does.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::embedding::EmbeddingService;
use crate::llm::{LlmEngine, LLM_TIMEOUT};
use crate::repository::EmbeddingRepository;
use crate::FabulaError;

const CHAPTER_NAMESPACE: &str = "chapters";
const ENTITY_NAMESPACE: &str = "entities";
const TOP_K: usize = 6;

pub struct QaService {
    llm: Arc<dyn LlmEngine>,
    embedding: Arc<dyn EmbeddingService + Send + Sync>,
    store: Arc<dyn EmbeddingRepository>,
}

impl QaService {
    pub fn new(
        llm: Arc<dyn LlmEngine>,
        embedding: Arc<dyn EmbeddingService + Send + Sync>,
        store: Arc<dyn EmbeddingRepository>,
    ) -> Self {
        QaService {
            llm,
            embedding,
            store,
        }
    }

    pub fn embedding_enabled(&self) -> bool {
        self.embedding.is_enabled()
    }

    /// Index one chapter digest. Failures are reported but callers treat
    /// them as a degraded index, never as an analysis failure.
    pub async fn index_chapter(
        &self,
        novel_id: &str,
        chapter_num: u32,
        digest: &str,
    ) -> Result<(), FabulaError> {
        if !self.embedding.is_enabled() || digest.is_empty() {
            return Ok(());
        }
        let vector = self.embedding.embed(digest).await?;
        self.store
            .put_embedding(
                novel_id,
                CHAPTER_NAMESPACE,
                &format!("chapter_{chapter_num}"),
                digest,
                &vector,
            )
            .await
    }

    /// Index an entity card (name + current profile one-liner).
    pub async fn index_entity(
        &self,
        novel_id: &str,
        name: &str,
        card: &str,
    ) -> Result<(), FabulaError> {
        if !self.embedding.is_enabled() || card.is_empty() {
            return Ok(());
        }
        let vector = self.embedding.embed(card).await?;
        self.store
            .put_embedding(novel_id, ENTITY_NAMESPACE, name, card, &vector)
            .await
    }

    /// Answer a question about the novel as a token stream.
    pub async fn ask(
        &self,
        novel_id: &str,
        question: &str,
    ) -> Result<BoxStream<'static, Result<String, FabulaError>>, FabulaError> {
        let context = self.retrieve(novel_id, question).await?;
        let prompt = if context.is_empty() {
            format!("问题：{question}\n（没有检索到相关背景，请基于常识谨慎回答，并说明缺少依据。）")
        } else {
            format!("以下是小说分析索引中与问题最相关的片段：\n{context}\n\n问题：{question}")
        };
        let stream = self.llm.generate_stream(
            "你是小说问答助手。只依据提供的片段回答，不要编造。".to_string(),
            prompt,
            LLM_TIMEOUT,
        );
        Ok(stream)
    }

    async fn retrieve(&self, novel_id: &str, question: &str) -> Result<String, FabulaError> {
        if !self.embedding.is_enabled() {
            return Ok(String::new());
        }
        let query = match self.embedding.embed(question).await {
            Ok(query) => query,
            Err(e) => {
                debug!(error = %e, "query embedding failed, answering without retrieval");
                return Ok(String::new());
            }
        };

        let mut scored = Vec::new();
        for namespace in [CHAPTER_NAMESPACE, ENTITY_NAMESPACE] {
            for stored in self.store.list_embeddings(novel_id, namespace).await? {
                // Rows written under a different embedding model cannot be
                // compared; skip them instead of scoring garbage.
                if stored.vector.len() != query.len() {
                    debug!(key = %stored.key, "skipping embedding row with mismatched dimensions");
                    continue;
                }
                let score = cosine(&query, &stored.vector);
                scored.push((score, stored));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let context: Vec<String> = scored
            .into_iter()
            .take(TOP_K)
            .map(|(_, stored)| format!("- [{}] {}", stored.key, stored.content))
            .collect();
        Ok(context.join("\n"))
    }
}

/// Consume a Q&A stream into a single string (CLI and tests).
pub async fn collect_stream(
    mut stream: BoxStream<'static, Result<String, FabulaError>>,
) -> Result<String, FabulaError> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&chunk?);
    }
    Ok(out)
}

/// Cosine score between a query vector and a stored snippet vector.
/// Degenerate (all-zero) vectors score 0.0 so they never rank above a real
/// match.
fn cosine(query: &[f32], stored: &[f32]) -> f32 {
    let dot: f32 = query.iter().zip(stored).map(|(q, s)| q * s).sum();
    let query_norm = query.iter().map(|q| q * q).sum::<f32>().sqrt();
    let stored_norm = stored.iter().map(|s| s * s).sum::<f32>().sqrt();
    if query_norm == 0.0 || stored_norm == 0.0 {
        return 0.0;
    }
    dot / (query_norm * stored_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_ranks_aligned_snippet_highest() {
        let query = vec![0.6, 0.8, 0.0];
        let aligned = vec![0.3, 0.4, 0.0];
        let unrelated = vec![0.0, 0.0, 1.0];
        assert!((cosine(&query, &aligned) - 1.0).abs() < 1e-6);
        assert!(cosine(&query, &aligned) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_cosine_zero_vector_never_ranks() {
        let query = vec![0.6, 0.8];
        assert_eq!(cosine(&query, &[0.0, 0.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &query), 0.0);
    }
}
