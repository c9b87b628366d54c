//! Context summary builder: section order, chapter-1 header, budget.

mod common;

use std::sync::Arc;

use common::{fact_with, seed_novel, test_ctx};
use fabula::models::{DictSource, EntityDictEntry, EntityType};
use fabula::repository::{DictionaryRepository, FactRepository, WorldRepository};
use fabula::services::ContextBuilder;
use serde_json::json;

fn builder(ctx: &common::TestCtx) -> ContextBuilder {
    ContextBuilder::new(
        Arc::clone(&ctx.facts),
        Arc::clone(&ctx.world),
        Arc::clone(&ctx.dictionary),
    )
}

#[tokio::test]
async fn test_chapter_one_returns_header() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["正文"]).await;

    let summary = builder(&ctx).build(&novel_id, 1, 6_000).await.unwrap();
    assert!(summary.contains("第1章"), "got: {summary}");
    assert!(summary.contains("暂无前文"));
}

#[tokio::test]
async fn test_chapter_one_includes_dictionary_reference() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["正文"]).await;
    ctx.dictionary
        .put_entries(
            &novel_id,
            &[EntityDictEntry {
                name: "孙悟空".into(),
                entity_type: EntityType::Person,
                frequency: 8000,
                confidence: 0.9,
                aliases: vec!["齐天大圣".into(), "行者".into()],
                source: DictSource::Llm,
                sample_context: None,
            }],
        )
        .await
        .unwrap();

    let summary = builder(&ctx).build(&novel_id, 1, 6_000).await.unwrap();
    assert!(summary.contains("孙悟空"));
    assert!(summary.contains("齐天大圣"));
    assert!(summary.contains("8000"));
    assert!(summary.contains("仅供参考"));
}

#[tokio::test]
async fn test_scene_focus_renders_parent_chain() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二", "三"]).await;

    // World hierarchy 越国 > 彩霞山 > 七玄门.
    let mut world = ctx.world.get_structure(&novel_id).await.unwrap();
    world.set_parent("七玄门", "彩霞山").unwrap();
    world.set_parent("彩霞山", "越国").unwrap();
    ctx.world.put_structure(&novel_id, &world).await.unwrap();

    for chapter in 1..=2u32 {
        ctx.facts
            .upsert_fact(
                &novel_id,
                chapter,
                &fact_with(json!({
                    "characters": [{"name": "韩立", "locations_in_chapter": ["七玄门"]}]
                })),
                "m",
                "v3",
            )
            .await
            .unwrap();
    }

    let summary = builder(&ctx).build(&novel_id, 3, 6_000).await.unwrap();
    assert!(
        summary.contains("越国 > 彩霞山 > 七玄门"),
        "scene focus should render the full chain, got: {summary}"
    );
}

#[tokio::test]
async fn test_known_characters_and_relationships_sections() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二"]).await;

    ctx.facts
        .upsert_fact(
            &novel_id,
            1,
            &fact_with(json!({
                "characters": [
                    {"name": "韩立", "new_aliases": ["韩跑跑"],
                     "abilities_gained": [{"dimension": "realm", "name": "练气三层", "description": ""}]},
                    {"name": "墨大夫"}
                ],
                "relationships": [{
                    "person_a": "韩立", "person_b": "墨大夫", "relation_type": "师徒",
                    "evidence": "收为弟子"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();

    let summary = builder(&ctx).build(&novel_id, 2, 6_000).await.unwrap();
    assert!(summary.contains("已知角色"));
    assert!(summary.contains("练气三层"));
    assert!(summary.contains("韩跑跑"));
    assert!(summary.contains("师徒"));
}

#[tokio::test]
async fn test_budget_is_enforced() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二"]).await;

    // A crowd of characters to inflate the summary.
    let characters: Vec<serde_json::Value> = (0..80)
        .map(|i| json!({"name": format!("角色某{i:03}"), "locations_in_chapter": ["七玄门"]}))
        .collect();
    ctx.facts
        .upsert_fact(
            &novel_id,
            1,
            &fact_with(json!({ "characters": characters })),
            "m",
            "v3",
        )
        .await
        .unwrap();

    let summary = builder(&ctx).build(&novel_id, 2, 500).await.unwrap();
    assert!(
        summary.chars().count() <= 500,
        "summary exceeded budget: {} chars",
        summary.chars().count()
    );
}
