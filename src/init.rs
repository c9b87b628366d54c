//! Shared initialization: wires repositories and services into the
//! in-process service surface consumed by the CLI (and any embedding shell).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::{data_dir, load_settings, LlmConfig, Settings};
use crate::db::{apply_schema, connect};
use crate::embedding::create_embedding_service;
use crate::llm::{LlmEngine, LlmManager};
use crate::models::{
    Chapter, ChapterImport, EntityDictEntry, Novel, OverrideType, PrescanStatus, UserOverride,
    WorldStructure,
};
use crate::repository::{
    DictionaryRepository, FactRepository, NovelRepository, SqliteDictionaryRepository,
    SqliteEmbeddingRepository, SqliteFactRepository, SqliteNovelRepository, SqliteTaskRepository,
    SqliteWorldRepository, TaskRepository, WorldRepository,
};
use crate::services::{
    Aggregator, LayoutSolver, NoopGeoResolver, Orchestrator, PreScanner, ProgressHub, QaService,
};
use crate::utils::text::char_count;
use crate::FabulaError;

/// Application context holding all services and repositories.
pub struct AppContext {
    pub pool: SqlitePool,
    pub data_path: PathBuf,
    pub settings: Settings,
    pub llm_config: Arc<LlmConfig>,
    pub llm: Arc<LlmManager>,
    pub novels: Arc<dyn NovelRepository>,
    pub facts: Arc<dyn FactRepository>,
    pub world: Arc<dyn WorldRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub dictionary: Arc<dyn DictionaryRepository>,
    pub aggregator: Arc<Aggregator>,
    pub orchestrator: Arc<Orchestrator>,
    pub qa: Arc<QaService>,
    pub hub: Arc<ProgressHub>,
}

impl AppContext {
    /// Initialize against `{data_dir}/fabula.db`, creating it if missing.
    pub async fn new(explicit_path: Option<PathBuf>) -> Result<Self> {
        let data_path = explicit_path.unwrap_or_else(data_dir);
        tracing::info!("Using data path: {}", data_path.display());

        let settings = load_settings(&data_path);
        let pool = connect(&data_path.join("fabula.db")).await?;
        apply_schema(&pool).await?;
        tracing::info!("Database connected");

        Ok(Self::wire(pool, data_path, settings))
    }

    /// In-memory context for tests.
    pub async fn new_in_memory(settings: Settings) -> Result<Self, FabulaError> {
        let pool = crate::db::connect_memory().await?;
        apply_schema(&pool).await?;
        Ok(Self::wire(pool, PathBuf::from("."), settings))
    }

    fn wire(pool: SqlitePool, data_path: PathBuf, settings: Settings) -> Self {
        let llm_config = Arc::new(LlmConfig::new(settings.llm.clone()));
        let llm: Arc<LlmManager> = Arc::new(LlmManager::new(
            llm_config.clone(),
            settings.cloud_concurrency,
        ));
        let llm_engine: Arc<dyn LlmEngine> = llm.clone();

        let novels: Arc<dyn NovelRepository> = Arc::new(SqliteNovelRepository::new(pool.clone()));
        let facts: Arc<dyn FactRepository> = Arc::new(SqliteFactRepository::new(pool.clone()));
        let world: Arc<dyn WorldRepository> = Arc::new(SqliteWorldRepository::new(pool.clone()));
        let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let dictionary: Arc<dyn DictionaryRepository> =
            Arc::new(SqliteDictionaryRepository::new(pool.clone()));
        let embedding_store = Arc::new(SqliteEmbeddingRepository::new(pool.clone()));

        let embedding_service =
            create_embedding_service(&settings.embedding_base_url, &settings.embedding_model);
        let layout = Arc::new(LayoutSolver::new(
            settings.solver.clone(),
            Arc::new(NoopGeoResolver),
        ));
        let aggregator = Arc::new(Aggregator::new(
            facts.clone(),
            world.clone(),
            dictionary.clone(),
            layout,
        ));
        let qa = Arc::new(QaService::new(
            llm_engine.clone(),
            embedding_service,
            embedding_store,
        ));
        let prescan = Arc::new(PreScanner::new(
            novels.clone(),
            dictionary.clone(),
            llm_engine.clone(),
        ));
        let hub = Arc::new(ProgressHub::new());
        let orchestrator = Arc::new(Orchestrator::new(
            novels.clone(),
            facts.clone(),
            world.clone(),
            tasks.clone(),
            dictionary.clone(),
            llm_engine,
            prescan,
            aggregator.clone(),
            qa.clone(),
            hub.clone(),
        ));

        AppContext {
            pool,
            data_path,
            settings,
            llm_config,
            llm,
            novels,
            facts,
            world,
            tasks,
            dictionary,
            aggregator,
            orchestrator,
            qa,
            hub,
        }
    }

    // ========================================================================
    // Novel import and management
    // ========================================================================

    /// Import a pre-segmented novel (segmentation itself happens upstream).
    pub async fn import_novel(
        &self,
        title: &str,
        author: Option<&str>,
        chapters: Vec<ChapterImport>,
    ) -> Result<Novel, FabulaError> {
        if chapters.is_empty() {
            return Err(FabulaError::Validation(
                "a novel needs at least one chapter".to_string(),
            ));
        }
        let novel_id = Uuid::new_v4().to_string();
        let total_words: u64 = chapters.iter().map(|c| char_count(&c.content) as u64).sum();
        let novel = Novel {
            id: novel_id.clone(),
            title: title.to_string(),
            author: author.map(str::to_string),
            total_chapters: chapters.len() as u32,
            total_words,
            content_hash: content_hash(&chapters),
            prescan_status: PrescanStatus::Pending,
            is_sample: false,
            created_at: Utc::now(),
        };
        self.novels.create_novel(&novel).await?;
        for import in chapters {
            let word_count = char_count(&import.content) as u32;
            self.novels
                .insert_chapter(&Chapter {
                    novel_id: novel_id.clone(),
                    chapter_num: import.chapter_num,
                    volume_num: import.volume_num,
                    title: import.title,
                    content: import.content,
                    word_count,
                    analysis_status: Default::default(),
                    is_excluded: false,
                })
                .await?;
        }
        Ok(novel)
    }

    /// Delete a novel; foreign keys cascade to all derived state.
    pub async fn delete_novel(&self, novel_id: &str) -> Result<bool, FabulaError> {
        let deleted = self.novels.delete_novel(novel_id).await?;
        if deleted {
            self.aggregator.invalidate_novel(novel_id);
        }
        Ok(deleted)
    }

    pub async fn set_chapter_excluded(
        &self,
        novel_id: &str,
        chapter_num: u32,
        excluded: bool,
    ) -> Result<(), FabulaError> {
        self.novels
            .set_chapter_excluded(novel_id, chapter_num, excluded)
            .await
    }

    // ========================================================================
    // World structure surface
    // ========================================================================

    /// The world structure with user overrides already applied.
    pub async fn get_world_structure(&self, novel_id: &str) -> Result<WorldStructure, FabulaError> {
        let mut structure = self.world.get_structure(novel_id).await?;
        structure.apply_overrides(&self.world.list_overrides(novel_id).await?);
        Ok(structure)
    }

    /// Record a user override; it wins over AI values and survives
    /// re-analysis.
    pub async fn put_world_structure_override(
        &self,
        novel_id: &str,
        override_type: OverrideType,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), FabulaError> {
        self.world
            .put_override(&UserOverride {
                novel_id: novel_id.to_string(),
                override_type,
                override_key: key.to_string(),
                value,
                created_at: Utc::now(),
            })
            .await?;
        self.aggregator.invalidate_novel(novel_id);
        Ok(())
    }

    // ========================================================================
    // Entity dictionary surface
    // ========================================================================

    pub async fn get_entity_dictionary(
        &self,
        novel_id: &str,
        entity_type: Option<crate::models::EntityType>,
        limit: Option<usize>,
    ) -> Result<Vec<EntityDictEntry>, FabulaError> {
        self.dictionary
            .list_entries(novel_id, entity_type, limit)
            .await
    }

    /// User alias edit: merge `alias` into `canonical`'s group.
    pub async fn merge_aliases(
        &self,
        novel_id: &str,
        canonical: &str,
        alias: &str,
    ) -> Result<(), FabulaError> {
        let mut entries = self.dictionary.list_entries(novel_id, None, None).await?;
        let absorbed = entries.iter().find(|e| e.name == alias).cloned();
        entries.retain(|e| e.name != alias);
        match entries.iter_mut().find(|e| e.name == canonical) {
            Some(target) => {
                if !target.aliases.iter().any(|a| a == alias) {
                    target.aliases.push(alias.to_string());
                }
                if let Some(absorbed) = absorbed {
                    target.frequency = target.frequency.max(absorbed.frequency);
                    for a in absorbed.aliases {
                        if a != target.name && !target.aliases.contains(&a) {
                            target.aliases.push(a);
                        }
                    }
                }
            }
            None => {
                return Err(FabulaError::NotFound {
                    entity_type: "dictionary entry".to_string(),
                    id: canonical.to_string(),
                })
            }
        }
        self.dictionary.put_entries(novel_id, &entries).await?;
        self.aggregator.invalidate_novel(novel_id);
        Ok(())
    }

    /// User alias edit: split `alias` out of `canonical`'s group into its
    /// own entry.
    pub async fn split_alias(
        &self,
        novel_id: &str,
        canonical: &str,
        alias: &str,
    ) -> Result<(), FabulaError> {
        let mut entries = self.dictionary.list_entries(novel_id, None, None).await?;
        let Some(target) = entries.iter_mut().find(|e| e.name == canonical) else {
            return Err(FabulaError::NotFound {
                entity_type: "dictionary entry".to_string(),
                id: canonical.to_string(),
            });
        };
        if !target.aliases.iter().any(|a| a == alias) {
            return Err(FabulaError::NotFound {
                entity_type: "alias".to_string(),
                id: alias.to_string(),
            });
        }
        target.aliases.retain(|a| a != alias);
        let split = EntityDictEntry {
            name: alias.to_string(),
            entity_type: target.entity_type,
            frequency: 0,
            confidence: 0.5,
            aliases: Vec::new(),
            source: crate::models::DictSource::Llm,
            sample_context: None,
        };
        entries.push(split);
        self.dictionary.put_entries(novel_id, &entries).await?;
        self.aggregator.invalidate_novel(novel_id);
        Ok(())
    }

    /// Recover tasks left `running` by a previous process.
    pub async fn resume_interrupted(&self) -> Result<usize, FabulaError> {
        self.orchestrator.resume_interrupted().await
    }
}

/// FNV-1a over all chapter texts; cheap and stable across imports.
fn content_hash(chapters: &[ChapterImport]) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x1000_0000_01b3;
    let mut hash = FNV_OFFSET;
    for chapter in chapters {
        for byte in chapter.content.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    format!("{hash:016x}")
}
