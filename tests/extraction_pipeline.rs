//! Extractor behavior with a scripted LLM: happy path, repair, retry,
//! empty chapters, segmentation.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::ScriptedLlm;
use fabula::llm::LlmEngine;
use fabula::services::FactExtractor;
use fabula::FabulaError;
use serde_json::json;

#[tokio::test]
async fn test_extracts_and_validates_clean_reply() {
    let llm = Arc::new(ScriptedLlm::default());
    llm.push_json(json!({
        "characters": [{"name": "韩立", "locations_in_chapter": ["七玄门"]}],
        "locations": [
            {"name": "七玄门", "type": "宗门"},
            {"name": "山", "type": "山"}
        ]
    }));
    let extractor = FactExtractor::new(llm.clone());

    let outcome = extractor
        .extract("n1", 1, "韩立来到七玄门。", "", &HashSet::new())
        .await
        .unwrap();

    assert_eq!(outcome.fact.characters.len(), 1);
    // The generic single-character location is validated away.
    assert_eq!(outcome.fact.locations.len(), 1);
    assert_eq!(outcome.fact.locations[0].name, "七玄门");
    assert_eq!(outcome.usage.input_tokens, 100);
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_repairs_fenced_reply_without_retry() {
    let llm = Arc::new(ScriptedLlm::default());
    llm.push_text("以下是结果：\n```json\n{\"characters\": [{\"name\": \"墨大夫\"}]}\n```");
    let extractor = FactExtractor::new(llm.clone());

    let outcome = extractor
        .extract("n1", 1, "墨大夫出场。", "", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(outcome.fact.characters[0].name, "墨大夫");
    assert_eq!(llm.call_count(), 1, "repair must not burn the retry");
}

#[tokio::test]
async fn test_retries_once_then_fails_with_parse_error() {
    let llm = Arc::new(ScriptedLlm::default());
    llm.push_text("完全不是 JSON 的内容");
    llm.push_text("第二次也不是 JSON 内容");
    let extractor = FactExtractor::new(llm.clone());

    let err = extractor
        .extract("n1", 1, "正文。", "", &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FabulaError::JsonParse(_)), "got {err:?}");
    assert_eq!(llm.call_count(), 2, "exactly one retry");
    assert!(err.is_chapter_failure());
}

#[tokio::test]
async fn test_llm_outage_retries_once_then_succeeds() {
    let llm = Arc::new(ScriptedLlm::default());
    llm.push_unavailable();
    llm.push_json(json!({"events": [{"summary": "拜师"}]}));
    let extractor = FactExtractor::new(llm.clone());

    let outcome = extractor
        .extract("n1", 1, "正文。", "", &HashSet::new())
        .await
        .unwrap();
    assert_eq!(outcome.fact.events.len(), 1);
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_empty_chapter_short_circuits() {
    let llm = Arc::new(ScriptedLlm::default());
    let extractor = FactExtractor::new(llm.clone());

    let outcome = extractor
        .extract("n1", 1, "   \n  ", "", &HashSet::new())
        .await
        .unwrap();
    assert!(outcome.fact.is_empty());
    assert_eq!(outcome.usage.input_tokens, 0);
    assert_eq!(llm.call_count(), 0, "no LLM call for empty text");
}

/// Segmented extraction: an LLM with a tiny prompt budget forces a split,
/// and per-segment outputs merge by union-with-dedup.
#[tokio::test]
async fn test_long_chapter_segments_and_merges() {
    struct TinyBudgetLlm(ScriptedLlm);

    #[async_trait::async_trait]
    impl fabula::llm::LlmEngine for TinyBudgetLlm {
        async fn generate(
            &self,
            request: fabula::llm::LlmRequest,
        ) -> Result<fabula::llm::LlmReply, FabulaError> {
            self.0.generate(request).await
        }
        fn generate_stream(
            &self,
            system: String,
            prompt: String,
            timeout: std::time::Duration,
        ) -> futures::stream::BoxStream<'static, Result<String, FabulaError>> {
            self.0.generate_stream(system, prompt, timeout)
        }
        fn profile(&self) -> fabula::llm::LlmProfile {
            fabula::llm::LlmProfile {
                prompt_char_budget: 2_600,
                ..self.0.profile()
            }
        }
    }

    let inner = ScriptedLlm::default();
    inner.push_json(json!({
        "characters": [{"name": "韩立", "locations_in_chapter": ["七玄门"]}]
    }));
    inner.push_json(json!({
        "characters": [{"name": "韩立", "new_aliases": ["韩跑跑"]}],
        "locations": [{"name": "药园", "type": "园地"}]
    }));
    let llm = Arc::new(TinyBudgetLlm(inner));
    let extractor = FactExtractor::new(llm.clone());

    // Two paragraphs that together exceed the derived segment budget.
    let chapter = format!("{}\n{}", "前".repeat(1_800), "后".repeat(1_800));
    let outcome = extractor
        .extract("n1", 1, &chapter, "", &HashSet::new())
        .await
        .unwrap();

    assert_eq!(llm.0.call_count(), 2, "two segments, two calls");
    assert_eq!(outcome.fact.characters.len(), 1, "same character merged");
    assert_eq!(outcome.fact.characters[0].new_aliases, vec!["韩跑跑"]);
    assert_eq!(outcome.fact.locations.len(), 1);
    assert_eq!(
        outcome.usage.input_tokens, 200,
        "usage sums across segments"
    );
}
