//! Shared test harness: in-memory database plus a scripted LLM engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use sqlx::SqlitePool;

use fabula::config::SolverSettings;
use fabula::db::{apply_schema, connect_memory};
use fabula::llm::{LlmEngine, LlmProfile, LlmReply, LlmRequest, LlmUsage};
use fabula::repository::{
    DictionaryRepository, FactRepository, NovelRepository, SqliteDictionaryRepository,
    SqliteEmbeddingRepository, SqliteFactRepository, SqliteNovelRepository, SqliteTaskRepository,
    SqliteWorldRepository, TaskRepository, WorldRepository,
};
use fabula::services::{
    Aggregator, LayoutSolver, NoopGeoResolver, Orchestrator, PreScanner, ProgressHub, QaService,
};

/// One scripted turn of the fake LLM.
pub enum ScriptedReply {
    Text(String),
    Unavailable,
}

/// LLM engine that pops scripted replies in call order; when the script is
/// exhausted it answers `{}` so incidental calls stay harmless.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<ScriptedReply>>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        ScriptedLlm {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }
}

impl ScriptedLlm {
    pub fn with_delay(delay: Duration) -> Self {
        ScriptedLlm {
            delay,
            ..ScriptedLlm::default()
        }
    }

    pub fn push_text(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(ScriptedReply::Text(reply.into()));
    }

    pub fn push_json(&self, reply: serde_json::Value) {
        self.push_text(reply.to_string());
    }

    pub fn push_unavailable(&self) {
        self.replies
            .lock()
            .unwrap()
            .push_back(ScriptedReply::Unavailable);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmEngine for ScriptedLlm {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmReply, fabula::FabulaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(LlmReply {
                content: text,
                usage: LlmUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                },
            }),
            Some(ScriptedReply::Unavailable) => Err(fabula::FabulaError::LlmUnavailable(
                "scripted outage".to_string(),
            )),
            None => Ok(LlmReply {
                content: "{}".to_string(),
                usage: LlmUsage::default(),
            }),
        }
    }

    fn generate_stream(
        &self,
        _system: String,
        _prompt: String,
        _timeout: Duration,
    ) -> BoxStream<'static, Result<String, fabula::FabulaError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        let text = match reply {
            Some(ScriptedReply::Text(text)) => text,
            Some(ScriptedReply::Unavailable) | None => String::new(),
        };
        Box::pin(futures::stream::iter(
            text.chars()
                .collect::<Vec<_>>()
                .chunks(8)
                .map(|c| Ok(c.iter().collect::<String>()))
                .collect::<Vec<_>>(),
        ))
    }

    fn profile(&self) -> LlmProfile {
        LlmProfile {
            is_cloud: false,
            model: "scripted".to_string(),
            context_summary_chars: 6_000,
            prompt_char_budget: 100_000,
        }
    }
}

/// Fully wired in-memory engine with the scripted LLM injected everywhere.
pub struct TestCtx {
    pub pool: SqlitePool,
    pub llm: Arc<ScriptedLlm>,
    pub novels: Arc<dyn NovelRepository>,
    pub facts: Arc<dyn FactRepository>,
    pub world: Arc<dyn WorldRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub dictionary: Arc<dyn DictionaryRepository>,
    pub aggregator: Arc<Aggregator>,
    pub orchestrator: Arc<Orchestrator>,
    pub qa: Arc<QaService>,
}

pub async fn test_ctx() -> TestCtx {
    test_ctx_with_llm(Arc::new(ScriptedLlm::default())).await
}

pub async fn test_ctx_with_llm(llm: Arc<ScriptedLlm>) -> TestCtx {
    let pool = connect_memory().await.expect("in-memory pool");
    apply_schema(&pool).await.expect("schema");

    let novels: Arc<dyn NovelRepository> = Arc::new(SqliteNovelRepository::new(pool.clone()));
    let facts: Arc<dyn FactRepository> = Arc::new(SqliteFactRepository::new(pool.clone()));
    let world: Arc<dyn WorldRepository> = Arc::new(SqliteWorldRepository::new(pool.clone()));
    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let dictionary: Arc<dyn DictionaryRepository> =
        Arc::new(SqliteDictionaryRepository::new(pool.clone()));
    let embedding_store = Arc::new(SqliteEmbeddingRepository::new(pool.clone()));

    let solver_settings = SolverSettings {
        time_budget_ms: 400,
        ..SolverSettings::default()
    };
    let layout = Arc::new(LayoutSolver::new(solver_settings, Arc::new(NoopGeoResolver)));
    let aggregator = Arc::new(Aggregator::new(
        facts.clone(),
        world.clone(),
        dictionary.clone(),
        layout,
    ));
    let qa = Arc::new(QaService::new(
        llm.clone(),
        Arc::new(fabula::embedding::NoopEmbeddingService),
        embedding_store,
    ));
    let prescan = Arc::new(PreScanner::new(
        novels.clone(),
        dictionary.clone(),
        llm.clone(),
    ));
    let hub = Arc::new(ProgressHub::new());
    let orchestrator = Arc::new(
        Orchestrator::new(
            novels.clone(),
            facts.clone(),
            world.clone(),
            tasks.clone(),
            dictionary.clone(),
            llm.clone(),
            prescan,
            aggregator.clone(),
            qa.clone(),
            hub,
        )
        .with_prescan_poll(Duration::from_millis(10)),
    );

    TestCtx {
        pool,
        llm,
        novels,
        facts,
        world,
        tasks,
        dictionary,
        aggregator,
        orchestrator,
        qa,
    }
}
