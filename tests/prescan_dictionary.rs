//! Whole-book pre-scan: statistical pass, LLM classification, degradation.

mod common;

use std::sync::Arc;

use common::{seed_novel_with_prescan, test_ctx_with_llm, ScriptedLlm};
use fabula::models::{DictSource, EntityType, PrescanStatus};
use fabula::repository::{DictionaryRepository, NovelRepository};
use fabula::services::PreScanner;
use serde_json::json;

fn scanner(ctx: &common::TestCtx) -> PreScanner {
    PreScanner::new(
        Arc::clone(&ctx.novels),
        Arc::clone(&ctx.dictionary),
        ctx.llm.clone(),
    )
}

fn repetitive_chapter() -> String {
    "韩立说道，七玄门中藏着秘密。墨大夫笑道，青元剑是至宝。\n".repeat(40)
}

#[tokio::test]
async fn test_prescan_classifies_and_completes() {
    let ctx = test_ctx_with_llm(Arc::new(ScriptedLlm::default())).await;
    let chapter = repetitive_chapter();
    let novel_id =
        seed_novel_with_prescan(&ctx, "凡人", &[chapter.as_str()], PrescanStatus::Pending).await;

    ctx.llm.push_json(json!({
        "entities": [
            {"name": "韩立", "type": "person", "aliases": ["韩跑跑"]},
            {"name": "七玄门", "type": "org", "aliases": []},
            {"name": "青元剑", "type": "item", "aliases": []}
        ]
    }));

    scanner(&ctx).run(&novel_id).await.unwrap();

    let novel = ctx.novels.get_novel(&novel_id).await.unwrap().unwrap();
    assert_eq!(novel.prescan_status, PrescanStatus::Completed);

    let hanli = ctx
        .dictionary
        .get_entry(&novel_id, "韩立")
        .await
        .unwrap()
        .expect("韩立 entry");
    assert_eq!(hanli.entity_type, EntityType::Person);
    assert_eq!(hanli.source, DictSource::Llm);
    assert!(hanli.aliases.contains(&"韩跑跑".to_string()));
    assert!(hanli.frequency >= 40);

    let sword = ctx
        .dictionary
        .get_entry(&novel_id, "青元剑")
        .await
        .unwrap()
        .expect("青元剑 entry");
    assert_eq!(sword.entity_type, EntityType::Item);
}

/// LLM outage degrades to phase-1-only results; the scan still completes.
#[tokio::test]
async fn test_prescan_degrades_without_llm() {
    let ctx = test_ctx_with_llm(Arc::new(ScriptedLlm::default())).await;
    let chapter = repetitive_chapter();
    let novel_id =
        seed_novel_with_prescan(&ctx, "凡人", &[chapter.as_str()], PrescanStatus::Pending).await;

    ctx.llm.push_unavailable();
    scanner(&ctx).run(&novel_id).await.unwrap();

    let novel = ctx.novels.get_novel(&novel_id).await.unwrap().unwrap();
    assert_eq!(novel.prescan_status, PrescanStatus::Completed);

    // Statistical sources still classified the dialogue speaker.
    let hanli = ctx
        .dictionary
        .get_entry(&novel_id, "韩立")
        .await
        .unwrap()
        .expect("韩立 entry");
    assert_eq!(hanli.entity_type, EntityType::Person);
    assert_eq!(hanli.source, DictSource::Dialogue);
}

/// Source priority is monotonic: a later freq-only observation never
/// downgrades an LLM classification.
#[tokio::test]
async fn test_dictionary_rows_queryable_by_type() {
    let ctx = test_ctx_with_llm(Arc::new(ScriptedLlm::default())).await;
    let chapter = repetitive_chapter();
    let novel_id =
        seed_novel_with_prescan(&ctx, "凡人", &[chapter.as_str()], PrescanStatus::Pending).await;

    ctx.llm.push_json(json!({
        "entities": [{"name": "韩立", "type": "person", "aliases": []}]
    }));
    scanner(&ctx).run(&novel_id).await.unwrap();

    let persons = ctx
        .dictionary
        .list_entries(&novel_id, Some(EntityType::Person), Some(10))
        .await
        .unwrap();
    assert!(persons.iter().any(|e| e.name == "韩立"));
    assert!(persons.iter().all(|e| e.entity_type == EntityType::Person));
}
