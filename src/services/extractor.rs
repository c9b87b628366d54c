//! Chapter fact extractor.
//!
//! For one chapter: assemble the prompt (system instruction + context
//! summary + chapter text), invoke the LLM in structured-JSON mode against
//! the ChapterFact schema, repair/retry once on drift, validate, and report
//! token usage. Long chapters are split at paragraph boundaries and the
//! per-segment outputs merged by union-with-dedup.

use std::collections::HashSet;
use std::sync::Arc;

use schemars::schema_for;
use tracing::{debug, warn};

use crate::llm::{json_repair, LlmEngine, LlmRequest, LlmUsage};
use crate::models::ChapterFact;
use crate::services::validator::FactValidator;
use crate::utils::text::{char_count, segment_at_paragraphs};
use crate::FabulaError;

/// Bumped whenever the system prompt or schema changes; part of cache keys.
pub const PROMPT_VERSION: &str = "v3";

/// Slack reserved for the system instruction and JSON overhead when
/// deciding whether a chapter needs segmentation.
const PROMPT_SLACK_CHARS: usize = 2_500;

const SYSTEM_PROMPT: &str = "\
你是小说结构化信息提取引擎。你将读到一段前文背景和一章小说原文，\
必须输出一个符合所给 JSON Schema 的 JSON 对象，不要输出任何其他文字。

提取规则：
1. 只提取本章原文中实际出现的信息，严禁臆造；前文背景仅用于对齐名称。
2. 地点必须是具体专名。禁止输出“山”“河”“海”等单字通名，\
禁止“小城”“石屋”等修饰语加通名的组合，禁止含“的”的描述性短语，禁止“某”开头的泛指。
3. 人物一律使用规范名。若本章出现的称呼是前文背景中某人的别名，\
characters[].name 填规范名，并把新见到的称呼放进 new_aliases。
4. 人名长度2至10字；“长老”“堂主”这类无姓氏的称谓不是人名。
5. relationships[].evidence 与 spatial_relationships[].narrative_evidence \
摘抄原文，不超过50字。
6. 某数组无内容时输出空数组。";

/// A successful extraction with its accumulated token usage.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub fact: ChapterFact,
    pub usage: LlmUsage,
}

pub struct FactExtractor {
    llm: Arc<dyn LlmEngine>,
    validator: FactValidator,
}

impl FactExtractor {
    pub fn new(llm: Arc<dyn LlmEngine>) -> Self {
        FactExtractor {
            llm,
            validator: FactValidator::new(),
        }
    }

    /// The JSON Schema handed to the LLM as the structured-output format.
    pub fn output_schema() -> serde_json::Value {
        serde_json::to_value(schema_for!(ChapterFact)).unwrap_or_default()
    }

    /// Extract a validated ChapterFact for one chapter.
    ///
    /// The output is content-addressable only by (novel, chapter, model,
    /// prompt version): temperature is low but replies are not
    /// bit-reproducible.
    pub async fn extract(
        &self,
        novel_id: &str,
        chapter_num: u32,
        chapter_text: &str,
        context_summary: &str,
        known_persons: &HashSet<String>,
    ) -> Result<ExtractionOutcome, FabulaError> {
        if chapter_text.trim().is_empty() {
            return Ok(ExtractionOutcome {
                fact: ChapterFact::default(),
                usage: LlmUsage::default(),
            });
        }

        let profile = self.llm.profile();
        let fixed = char_count(context_summary) + PROMPT_SLACK_CHARS;
        let available = profile
            .prompt_char_budget
            .saturating_sub(fixed)
            .max(2_000);

        let segments = if char_count(chapter_text) > available {
            let segments = segment_at_paragraphs(chapter_text, available);
            debug!(
                novel_id,
                chapter_num,
                segments = segments.len(),
                "chapter exceeds context budget, extracting in segments"
            );
            segments
        } else {
            vec![chapter_text.to_string()]
        };

        let schema = Self::output_schema();
        let mut usage = LlmUsage::default();
        let mut merged: Option<ChapterFact> = None;

        for segment in &segments {
            let (value, segment_usage) = self
                .call_with_retry(segment, context_summary, &schema)
                .await?;
            usage.add(segment_usage);
            let fact = self.validator.validate(value, known_persons)?;
            match merged.as_mut() {
                Some(acc) => acc.merge(fact),
                None => merged = Some(fact),
            }
        }

        Ok(ExtractionOutcome {
            fact: merged.unwrap_or_default(),
            usage,
        })
    }

    /// One generation attempt plus exactly one retry, covering both LLM
    /// transport failures and unrepairable JSON.
    async fn call_with_retry(
        &self,
        segment: &str,
        context_summary: &str,
        schema: &serde_json::Value,
    ) -> Result<(serde_json::Value, LlmUsage), FabulaError> {
        let prompt = build_prompt(context_summary, segment);
        let request = LlmRequest::new(SYSTEM_PROMPT, prompt).with_format(schema.clone());

        let mut usage = LlmUsage::default();
        let first_error = match self.llm.generate(request.clone()).await {
            Ok(reply) => {
                usage.add(reply.usage);
                match json_repair::extract_json(&reply.content) {
                    Ok(value) => return Ok((value, usage)),
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };
        warn!(error = %first_error, "extraction attempt failed, retrying once");

        let reply = self.llm.generate(request).await?;
        usage.add(reply.usage);
        let value = json_repair::extract_json(&reply.content)?;
        Ok((value, usage))
    }
}

fn build_prompt(context_summary: &str, chapter_text: &str) -> String {
    if context_summary.is_empty() {
        format!("# 本章原文\n{chapter_text}")
    } else {
        format!("# 前文背景\n{context_summary}\n\n# 本章原文\n{chapter_text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_schema_covers_top_level_arrays() {
        let schema = FactExtractor::output_schema();
        let properties = schema["properties"].as_object().unwrap();
        for key in [
            "characters",
            "relationships",
            "locations",
            "item_events",
            "org_events",
            "events",
            "new_concepts",
            "spatial_relationships",
            "world_declarations",
        ] {
            assert!(properties.contains_key(key), "schema missing {key}");
        }
    }

    #[test]
    fn test_prompt_order_context_then_chapter() {
        let prompt = build_prompt("背景内容", "原文内容");
        let ctx_pos = prompt.find("背景内容").unwrap();
        let text_pos = prompt.find("原文内容").unwrap();
        assert!(ctx_pos < text_pos);
    }
}
