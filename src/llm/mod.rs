//! LLM access layer.
//!
//! Concrete providers are tagged variants selected at configuration time
//! ([`client::LlmClient`]); services depend on the [`LlmEngine`] trait so
//! tests can script replies. The [`LlmManager`] is the process-wide engine:
//! it lazily rebuilds the client when the configuration generation changes
//! and rate-limits cloud calls through a shared semaphore.

pub mod client;
pub mod json_repair;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{RwLock, Semaphore};

use crate::config::LlmConfig;
use crate::FabulaError;

pub use client::LlmClient;

/// Default per-call timeout.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Token usage of one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LlmUsage {
    pub fn add(&mut self, other: LlmUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    /// JSON Schema for structured output. Enforced natively where the
    /// provider supports it, otherwise appended as an instruction.
    pub format: Option<serde_json::Value>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
    /// Context window hint, honored by local providers only.
    pub num_ctx: Option<u32>,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        LlmRequest {
            system: system.into(),
            prompt: prompt.into(),
            format: None,
            temperature: 0.2,
            max_tokens: None,
            timeout: LLM_TIMEOUT,
            num_ctx: None,
        }
    }

    pub fn with_format(mut self, schema: serde_json::Value) -> Self {
        self.format = Some(schema);
        self
    }
}

/// A completed generation.
#[derive(Debug, Clone, Default)]
pub struct LlmReply {
    pub content: String,
    pub usage: LlmUsage,
}

/// Static facts about the active provider, used for budgets and costing.
#[derive(Debug, Clone)]
pub struct LlmProfile {
    pub is_cloud: bool,
    pub model: String,
    pub context_summary_chars: usize,
    pub prompt_char_budget: usize,
}

/// Capability set every LLM backend offers: one-shot generation and token
/// streaming. The extractor never streams; Q&A never batches.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> Result<LlmReply, FabulaError>;

    fn generate_stream(
        &self,
        system: String,
        prompt: String,
        timeout: Duration,
    ) -> BoxStream<'static, Result<String, FabulaError>>;

    fn profile(&self) -> LlmProfile;
}

/// Process-wide LLM engine bound to the mutable configuration.
pub struct LlmManager {
    config: Arc<LlmConfig>,
    cached: RwLock<Option<(u64, Arc<LlmClient>)>>,
    cloud_limiter: Arc<Semaphore>,
}

impl LlmManager {
    pub fn new(config: Arc<LlmConfig>, cloud_concurrency: usize) -> Self {
        LlmManager {
            config,
            cached: RwLock::new(None),
            cloud_limiter: Arc::new(Semaphore::new(cloud_concurrency.max(1))),
        }
    }

    /// Current client, rebuilt when the configuration generation moved.
    async fn client(&self) -> Arc<LlmClient> {
        let (generation, provider) = self.config.snapshot();
        {
            let guard = self.cached.read().await;
            if let Some((cached_gen, client)) = guard.as_ref() {
                if *cached_gen == generation {
                    return client.clone();
                }
            }
        }
        let client = Arc::new(LlmClient::from_provider(&provider));
        *self.cached.write().await = Some((generation, client.clone()));
        client
    }
}

#[async_trait]
impl LlmEngine for LlmManager {
    async fn generate(&self, request: LlmRequest) -> Result<LlmReply, FabulaError> {
        let provider = self.config.provider();
        let client = self.client().await;
        let _permit = if provider.is_cloud() {
            Some(
                self.cloud_limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| FabulaError::LlmUnavailable(e.to_string()))?,
            )
        } else {
            None
        };
        client.generate(request).await
    }

    fn generate_stream(
        &self,
        system: String,
        prompt: String,
        timeout: Duration,
    ) -> BoxStream<'static, Result<String, FabulaError>> {
        let config = self.config.clone();
        let limiter = self.cloud_limiter.clone();
        Box::pin(async_stream::try_stream! {
            let (_, provider) = config.snapshot();
            let _permit = if provider.is_cloud() {
                Some(limiter.acquire_owned().await
                    .map_err(|e| FabulaError::LlmUnavailable(e.to_string()))?)
            } else {
                None
            };
            let client = LlmClient::from_provider(&provider);
            let mut inner = client.generate_stream(system, prompt, timeout);
            while let Some(chunk) = inner.next().await {
                yield chunk?;
            }
        })
    }

    fn profile(&self) -> LlmProfile {
        let provider = self.config.provider();
        LlmProfile {
            is_cloud: provider.is_cloud(),
            model: provider.model_name().to_string(),
            context_summary_chars: provider.context_summary_chars(),
            prompt_char_budget: provider.prompt_char_budget(),
        }
    }
}
