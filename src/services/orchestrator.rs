//! Analysis orchestrator: drives the per-chapter pipeline.
//!
//! One cooperative task per novel, sequential over chapters because each
//! chapter's output feeds the next chapter's context summary. Pause and
//! cancel are polled from the task row at the top of every iteration; a
//! chapter mid-extraction runs to completion (or times out) before the
//! signal takes effect. A single chapter's failure never propagates past
//! the per-chapter barrier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::llm::LlmEngine;
use crate::models::{
    AnalysisEvent, AnalysisStatus, AnalysisTask, CostEstimate, CostSnapshot, PrescanStatus,
    ProgressStats, TaskStatus,
};
use crate::repository::{
    DictionaryRepository, FactRepository, NovelRepository, TaskRepository, WorldRepository,
};
use crate::services::context::ContextBuilder;
use crate::services::extractor::{FactExtractor, PROMPT_VERSION};
use crate::services::prescan::PreScanner;
use crate::services::progress::ProgressHub;
use crate::services::qa::QaService;
use crate::services::world_agent::WorldAgent;
use crate::services::Aggregator;
use crate::utils::text::char_count;
use crate::FabulaError;

/// Chapters between hierarchy-consolidation / embedding passes.
const CONSOLIDATE_EVERY: u32 = 10;
/// CJK characters per token, empirically ~1.6 for the supported models.
const CHARS_PER_TOKEN: f64 = 1.6;
/// Assumed completion budget per chapter for estimates.
const COMPLETION_TOKENS_PER_CHAPTER: u64 = 900;
const USD_TO_CNY: f64 = 7.2;

/// (model substring, USD per 1M input tokens, USD per 1M output tokens).
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("deepseek", 0.27, 1.10),
    ("qwen", 0.30, 0.60),
    ("glm", 0.60, 2.20),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4", 2.50, 10.00),
    ("claude", 3.00, 15.00),
];
const DEFAULT_PRICE: (f64, f64) = (0.50, 1.50);

pub struct Orchestrator {
    novels: Arc<dyn NovelRepository>,
    facts: Arc<dyn FactRepository>,
    world: Arc<dyn WorldRepository>,
    tasks: Arc<dyn TaskRepository>,
    dictionary: Arc<dyn DictionaryRepository>,
    llm: Arc<dyn LlmEngine>,
    extractor: FactExtractor,
    context: ContextBuilder,
    agent: WorldAgent,
    prescan: Arc<PreScanner>,
    aggregator: Arc<Aggregator>,
    qa: Arc<QaService>,
    hub: Arc<ProgressHub>,
    /// Prescan wait poll interval; shortened in tests.
    prescan_poll: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        novels: Arc<dyn NovelRepository>,
        facts: Arc<dyn FactRepository>,
        world: Arc<dyn WorldRepository>,
        tasks: Arc<dyn TaskRepository>,
        dictionary: Arc<dyn DictionaryRepository>,
        llm: Arc<dyn LlmEngine>,
        prescan: Arc<PreScanner>,
        aggregator: Arc<Aggregator>,
        qa: Arc<QaService>,
        hub: Arc<ProgressHub>,
    ) -> Self {
        Orchestrator {
            extractor: FactExtractor::new(llm.clone()),
            context: ContextBuilder::new(facts.clone(), world.clone(), dictionary.clone()),
            agent: WorldAgent::new(llm.clone()),
            novels,
            facts,
            world,
            tasks,
            dictionary,
            llm,
            prescan,
            aggregator,
            qa,
            hub,
            prescan_poll: Duration::from_secs(5),
        }
    }

    /// Shorten the prescan wait poll (tests).
    pub fn with_prescan_poll(mut self, poll: Duration) -> Self {
        self.prescan_poll = poll;
        self
    }

    /// Start analysis of a chapter range. One task per novel at a time.
    pub async fn analyze(
        self: &Arc<Self>,
        novel_id: &str,
        chapter_start: u32,
        chapter_end: u32,
        force: bool,
    ) -> Result<String, FabulaError> {
        if chapter_start == 0 || chapter_end < chapter_start {
            return Err(FabulaError::Validation(format!(
                "invalid chapter range {chapter_start}-{chapter_end}"
            )));
        }
        let novel = self
            .novels
            .get_novel(novel_id)
            .await?
            .ok_or_else(|| FabulaError::NotFound {
                entity_type: "novel".to_string(),
                id: novel_id.to_string(),
            })?;
        if let Some(active) = self.tasks.active_task_for_novel(novel_id).await? {
            return Err(FabulaError::Conflict(format!(
                "novel '{}' already has task {} in status {}",
                novel.title,
                active.id,
                active.status.as_str()
            )));
        }

        // Force resets statuses up front, so a later pause/resume still
        // re-analyzes exactly the chapters an uninterrupted run would have.
        if force {
            for meta in self.novels.list_chapter_meta(novel_id).await? {
                if meta.chapter_num >= chapter_start
                    && meta.chapter_num <= chapter_end
                    && meta.analysis_status == AnalysisStatus::Completed
                {
                    self.novels
                        .set_chapter_status(novel_id, meta.chapter_num, AnalysisStatus::Pending)
                        .await?;
                }
            }
        }

        let task = AnalysisTask {
            id: Uuid::new_v4().to_string(),
            novel_id: novel_id.to_string(),
            status: TaskStatus::Pending,
            chapter_start,
            chapter_end,
            current_chapter: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.tasks.create_task(&task).await?;

        let this = self.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            this.run_task(task, force).await;
        });
        Ok(task_id)
    }

    /// PATCH a task: pause, resume (respawns the loop), or cancel.
    pub async fn patch_task(
        self: &Arc<Self>,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), FabulaError> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| FabulaError::NotFound {
                entity_type: "task".to_string(),
                id: task_id.to_string(),
            })?;
        if task.status.is_terminal() {
            return Err(FabulaError::Conflict(format!(
                "task {} is already {}",
                task_id,
                task.status.as_str()
            )));
        }
        match status {
            TaskStatus::Paused | TaskStatus::Cancelled => {
                // The running loop sees the row at its next iteration.
                self.tasks.set_status(task_id, status, None).await?;
                Ok(())
            }
            TaskStatus::Running => {
                if task.status != TaskStatus::Paused {
                    return Err(FabulaError::Conflict(format!(
                        "task {} is {}, only paused tasks resume",
                        task_id,
                        task.status.as_str()
                    )));
                }
                self.tasks
                    .set_status(task_id, TaskStatus::Running, None)
                    .await?;
                let mut resumed = task;
                resumed.status = TaskStatus::Running;
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_task(resumed, false).await;
                });
                Ok(())
            }
            other => Err(FabulaError::Validation(format!(
                "cannot patch a task to {}",
                other.as_str()
            ))),
        }
    }

    /// Respawn every task a previous process left in `running`.
    pub async fn resume_interrupted(self: &Arc<Self>) -> Result<usize, FabulaError> {
        let tasks = self.tasks.running_tasks().await?;
        let count = tasks.len();
        for task in tasks {
            info!(task_id = %task.id, novel_id = %task.novel_id, "recovering interrupted task");
            let this = self.clone();
            tokio::spawn(async move {
                this.run_task(task, false).await;
            });
        }
        Ok(count)
    }

    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<AnalysisEvent> {
        self.hub.subscribe(task_id)
    }

    /// Token/cost estimate for a planned range.
    pub async fn estimate_cost(
        &self,
        novel_id: &str,
        chapter_start: u32,
        chapter_end: u32,
    ) -> Result<CostEstimate, FabulaError> {
        let profile = self.llm.profile();
        let metas = self.novels.list_chapter_meta(novel_id).await?;
        let mut input_tokens = 0u64;
        let mut chapters = 0u64;
        for meta in metas {
            if meta.chapter_num < chapter_start
                || meta.chapter_num > chapter_end
                || meta.is_excluded
            {
                continue;
            }
            chapters += 1;
            // Chapter text plus the injected context summary.
            let context_chars = profile.context_summary_chars as f64 * 0.5;
            input_tokens += ((meta.word_count as f64 + context_chars) / CHARS_PER_TOKEN) as u64;
        }
        let output_tokens = chapters * COMPLETION_TOKENS_PER_CHAPTER;

        let (usd_in, usd_out) = if profile.is_cloud {
            PRICE_TABLE
                .iter()
                .find(|(needle, _, _)| profile.model.to_lowercase().contains(needle))
                .map(|(_, i, o)| (*i, *o))
                .unwrap_or(DEFAULT_PRICE)
        } else {
            (0.0, 0.0)
        };
        let cost_usd = (input_tokens as f64 / 1e6) * usd_in + (output_tokens as f64 / 1e6) * usd_out;
        Ok(CostEstimate {
            is_cloud: profile.is_cloud,
            input_tokens,
            output_tokens,
            cost_usd,
            cost_cny: cost_usd * USD_TO_CNY,
        })
    }

    // ========================================================================
    // The chapter loop
    // ========================================================================

    async fn run_task(self: Arc<Self>, task: AnalysisTask, force: bool) {
        let task_id = task.id.clone();
        if let Err(e) = self.tasks.set_status(&task_id, TaskStatus::Running, None).await {
            error!(task_id = %task_id, error = %e, "cannot mark task running");
            return;
        }
        self.hub.emit(
            &task_id,
            AnalysisEvent::TaskStatus {
                task_id: task_id.clone(),
                status: TaskStatus::Running,
            },
        );

        match self.chapter_loop(&task, force).await {
            Ok(LoopOutcome::Completed) => {
                let _ = self
                    .tasks
                    .set_status(&task_id, TaskStatus::Completed, None)
                    .await;
                self.hub.emit(
                    &task_id,
                    AnalysisEvent::TaskStatus {
                        task_id: task_id.clone(),
                        status: TaskStatus::Completed,
                    },
                );
            }
            Ok(LoopOutcome::Interrupted(status)) => {
                self.hub.emit(
                    &task_id,
                    AnalysisEvent::TaskStatus {
                        task_id: task_id.clone(),
                        status,
                    },
                );
            }
            Err(e) => {
                // Only infrastructure failures land here; chapter-level
                // failures are absorbed inside the loop.
                error!(task_id = %task_id, error = %e, "task failed");
                let _ = self
                    .tasks
                    .set_status(&task_id, TaskStatus::Failed, Some(&e.to_string()))
                    .await;
                self.hub.emit(
                    &task_id,
                    AnalysisEvent::TaskStatus {
                        task_id: task_id.clone(),
                        status: TaskStatus::Failed,
                    },
                );
            }
        }
        self.hub.close(&task_id);
    }

    async fn chapter_loop(
        &self,
        task: &AnalysisTask,
        force: bool,
    ) -> Result<LoopOutcome, FabulaError> {
        let novel_id = task.novel_id.as_str();
        let total = task.chapter_end - task.chapter_start + 1;
        let start = task
            .current_chapter
            .map(|c| (c + 1).max(task.chapter_start))
            .unwrap_or(task.chapter_start);

        let mut cost = CostSnapshot::default();
        let profile = self.llm.profile();
        let (usd_in, usd_out) = PRICE_TABLE
            .iter()
            .find(|(needle, _, _)| profile.model.to_lowercase().contains(needle))
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or(DEFAULT_PRICE);

        self.wait_for_prescan(novel_id).await?;

        for chapter_num in start..=task.chapter_end {
            // Cooperative pause/cancel at the top of every iteration.
            let status = self
                .tasks
                .get_task(&task.id)
                .await?
                .map(|t| t.status)
                .unwrap_or(TaskStatus::Cancelled);
            match status {
                TaskStatus::Paused | TaskStatus::Cancelled => {
                    info!(task_id = %task.id, chapter_num, status = status.as_str(), "task interrupted");
                    return Ok(LoopOutcome::Interrupted(status));
                }
                _ => {}
            }
            self.tasks.set_current_chapter(&task.id, chapter_num).await?;

            let Some(chapter) = self.novels.get_chapter(novel_id, chapter_num).await? else {
                continue;
            };
            if chapter.is_excluded
                || (!force && chapter.analysis_status == AnalysisStatus::Completed)
            {
                self.hub.emit(
                    &task.id,
                    AnalysisEvent::Progress {
                        task_id: task.id.clone(),
                        chapter: chapter_num,
                        total,
                        stats: ProgressStats::default(),
                        cost: None,
                    },
                );
                continue;
            }

            self.novels
                .set_chapter_status(novel_id, chapter_num, AnalysisStatus::Analyzing)
                .await?;

            let summary = self
                .context
                .build(novel_id, chapter_num, profile.context_summary_chars)
                .await?;
            let known_persons = self.known_persons(novel_id).await?;

            let outcome = match self
                .extractor
                .extract(novel_id, chapter_num, &chapter.content, &summary, &known_persons)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_chapter_failure() => {
                    warn!(novel_id, chapter_num, error = %e, "chapter extraction failed");
                    self.novels
                        .set_chapter_status(novel_id, chapter_num, AnalysisStatus::Failed)
                        .await?;
                    self.hub.emit(
                        &task.id,
                        AnalysisEvent::ChapterDone {
                            task_id: task.id.clone(),
                            chapter: chapter_num,
                            status: AnalysisStatus::Failed,
                            error: Some(format!("第{chapter_num}章分析失败：{e}")),
                        },
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            // World-structure agent behind its exception barrier: on failure
            // the persisted snapshot stays untouched.
            let mut structure = self.world.get_structure(novel_id).await?;
            let recent = self
                .facts
                .list_facts(
                    novel_id,
                    Some((chapter_num.saturating_sub(3).max(1), chapter_num.saturating_sub(1))),
                )
                .await
                .unwrap_or_default();
            match self
                .agent
                .observe_chapter(
                    &mut structure,
                    chapter_num,
                    &chapter.content,
                    &outcome.fact,
                    &recent,
                )
                .await
            {
                Ok(()) => {
                    self.world.put_structure(novel_id, &structure).await?;
                }
                Err(e) => {
                    warn!(novel_id, chapter_num, error = %e, "world agent failed, keeping last snapshot");
                }
            }

            // One atomic write before the next suspension point.
            self.facts
                .upsert_fact(
                    novel_id,
                    chapter_num,
                    &outcome.fact,
                    &profile.model,
                    PROMPT_VERSION,
                )
                .await?;
            self.novels
                .set_chapter_status(novel_id, chapter_num, AnalysisStatus::Completed)
                .await?;
            self.aggregator.invalidate_novel(novel_id);

            if profile.is_cloud {
                cost.input_tokens += outcome.usage.input_tokens;
                cost.output_tokens += outcome.usage.output_tokens;
                cost.cost_usd = (cost.input_tokens as f64 / 1e6) * usd_in
                    + (cost.output_tokens as f64 / 1e6) * usd_out;
                cost.cost_cny = cost.cost_usd * USD_TO_CNY;
            }

            let stats = ProgressStats {
                characters: outcome.fact.characters.len(),
                relationships: outcome.fact.relationships.len(),
                locations: outcome.fact.locations.len(),
                events: outcome.fact.events.len(),
            };
            self.hub.emit(
                &task.id,
                AnalysisEvent::Progress {
                    task_id: task.id.clone(),
                    chapter: chapter_num,
                    total,
                    stats,
                    cost: profile.is_cloud.then_some(cost),
                },
            );
            self.hub.emit(
                &task.id,
                AnalysisEvent::ChapterDone {
                    task_id: task.id.clone(),
                    chapter: chapter_num,
                    status: AnalysisStatus::Completed,
                    error: None,
                },
            );

            if chapter_num % CONSOLIDATE_EVERY == 0 || chapter_num == task.chapter_end {
                self.periodic_maintenance(novel_id, chapter_num, &outcome.fact)
                    .await;
            }
        }

        Ok(LoopOutcome::Completed)
    }

    /// Trigger the pre-scan if still pending and wait for it, bounded;
    /// failure degrades to analysis without dictionary injection.
    async fn wait_for_prescan(&self, novel_id: &str) -> Result<(), FabulaError> {
        let Some(novel) = self.novels.get_novel(novel_id).await? else {
            return Err(FabulaError::NotFound {
                entity_type: "novel".to_string(),
                id: novel_id.to_string(),
            });
        };
        match novel.prescan_status {
            PrescanStatus::Completed | PrescanStatus::Failed => return Ok(()),
            PrescanStatus::Pending => {
                let prescan = self.prescan.clone();
                let novel_id = novel_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = prescan.run(&novel_id).await {
                        warn!(novel_id = %novel_id, error = %e, "pre-scan failed");
                    }
                });
            }
            PrescanStatus::Running => {}
        }
        for _ in 0..24 {
            tokio::time::sleep(self.prescan_poll).await;
            let status = self
                .novels
                .get_novel(novel_id)
                .await?
                .map(|n| n.prescan_status)
                .unwrap_or(PrescanStatus::Failed);
            if matches!(status, PrescanStatus::Completed | PrescanStatus::Failed) {
                return Ok(());
            }
        }
        warn!(novel_id, "pre-scan still running after wait budget, proceeding without it");
        Ok(())
    }

    /// Known person names (canonical + aliases) for the validator.
    async fn known_persons(&self, novel_id: &str) -> Result<HashSet<String>, FabulaError> {
        let entries = self
            .dictionary
            .list_entries(novel_id, Some(crate::models::EntityType::Person), None)
            .await?;
        let mut known = HashSet::new();
        for entry in entries {
            known.insert(entry.name);
            known.extend(entry.aliases);
        }
        Ok(known)
    }

    /// Hierarchy consolidation plus opportunistic embedding upkeep. Never
    /// fails the task.
    async fn periodic_maintenance(
        &self,
        novel_id: &str,
        chapter_num: u32,
        fact: &crate::models::ChapterFact,
    ) {
        match self.world.get_structure(novel_id).await {
            Ok(mut structure) => {
                if let Err(e) = self.agent.consolidate(&mut structure).await {
                    warn!(novel_id, error = %e, "hierarchy consolidation failed");
                } else if let Err(e) = self.world.put_structure(novel_id, &structure).await {
                    warn!(novel_id, error = %e, "could not persist consolidated structure");
                }
            }
            Err(e) => warn!(novel_id, error = %e, "could not load structure for consolidation"),
        }

        if self.qa.embedding_enabled() {
            let digest = chapter_digest(chapter_num, fact);
            if char_count(&digest) > 10 {
                if let Err(e) = self.qa.index_chapter(novel_id, chapter_num, &digest).await {
                    warn!(novel_id, chapter_num, error = %e, "embedding upkeep failed");
                }
            }
        }
    }
}

enum LoopOutcome {
    Completed,
    Interrupted(TaskStatus),
}

/// One-paragraph chapter digest for the semantic index.
fn chapter_digest(chapter_num: u32, fact: &crate::models::ChapterFact) -> String {
    let mut parts = vec![format!("第{chapter_num}章")];
    if !fact.characters.is_empty() {
        let names: Vec<&str> = fact.characters.iter().map(|c| c.name.as_str()).collect();
        parts.push(format!("人物：{}", names.join("、")));
    }
    if !fact.events.is_empty() {
        let summaries: Vec<&str> = fact.events.iter().map(|e| e.summary.as_str()).collect();
        parts.push(format!("事件：{}", summaries.join("；")));
    }
    if !fact.locations.is_empty() {
        let names: Vec<&str> = fact.locations.iter().map(|l| l.name.as_str()).collect();
        parts.push(format!("地点：{}", names.join("、")));
    }
    parts.join(" ")
}
