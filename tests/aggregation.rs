//! Entity aggregation: profiles, evolution chains, alias merging, graph,
//! idempotence.

mod common;

use common::{fact_with, seed_novel, test_ctx};
use fabula::models::{DictSource, EdgeCategory, EntityDictEntry, EntityType};
use fabula::repository::{DictionaryRepository, FactRepository};
use pretty_assertions::assert_eq;
use serde_json::json;

/// S1: three simple chapters; relationship evolution coalesces into stages.
#[tokio::test]
async fn test_simple_three_chapter_aggregation() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "凡人", &["一", "二", "三"]).await;

    ctx.facts
        .upsert_fact(
            &novel_id,
            1,
            &fact_with(json!({
                "characters": [
                    {"name": "韩立", "locations_in_chapter": ["七玄门"]},
                    {"name": "墨大夫", "locations_in_chapter": ["七玄门"]}
                ],
                "locations": [{"name": "七玄门", "type": "宗门", "tier": "site"}],
                "relationships": [{
                    "person_a": "韩立", "person_b": "墨大夫",
                    "relation_type": "初识", "is_new": true, "evidence": "见到墨大夫"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();
    ctx.facts
        .upsert_fact(
            &novel_id,
            2,
            &fact_with(json!({
                "characters": [{"name": "韩立", "locations_in_chapter": ["药园"]}],
                "locations": [{"name": "药园", "type": "园地", "tier": "site", "parent": "七玄门"}]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();
    ctx.facts
        .upsert_fact(
            &novel_id,
            3,
            &fact_with(json!({
                "characters": [
                    {"name": "韩立", "locations_in_chapter": ["七玄门"]},
                    {"name": "墨大夫", "locations_in_chapter": ["七玄门"]}
                ],
                "relationships": [{
                    "person_a": "韩立", "person_b": "墨大夫",
                    "relation_type": "师徒", "is_new": false,
                    "previous_type": "初识", "evidence": "正式收为弟子"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();

    let profile = ctx.aggregator.person_profile(&novel_id, "韩立").await.unwrap();
    assert_eq!(profile.chapters_appeared, vec![1, 2, 3]);
    assert_eq!(profile.first_chapter, Some(1));
    assert_eq!(profile.last_chapter, Some(3));
    assert_eq!(profile.locations_visited, vec!["七玄门", "药园"]);

    let evolution = profile
        .relationships
        .iter()
        .find(|r| r.other == "墨大夫")
        .expect("relationship with 墨大夫");
    assert_eq!(evolution.stages.len(), 2);
    assert_eq!(evolution.stages[0].relation_type, "初识");
    assert_eq!(evolution.stages[0].from_chapter, 1);
    assert_eq!(evolution.stages[0].to_chapter, 2);
    assert_eq!(evolution.stages[1].relation_type, "师徒");
    assert_eq!(evolution.stages[1].from_chapter, 3);
}

/// S6: dictionary alias group folds mentions of an alias into the canonical
/// person.
#[tokio::test]
async fn test_alias_group_merges_into_canonical() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "西游", &["一", "二"]).await;
    ctx.dictionary
        .put_entries(
            &novel_id,
            &[EntityDictEntry {
                name: "孙悟空".into(),
                entity_type: EntityType::Person,
                frequency: 8000,
                confidence: 0.9,
                aliases: vec!["齐天大圣".into(), "行者".into(), "猴王".into()],
                source: DictSource::Llm,
                sample_context: None,
            }],
        )
        .await
        .unwrap();

    ctx.facts
        .upsert_fact(
            &novel_id,
            1,
            &fact_with(json!({"characters": [{"name": "孙悟空"}]})),
            "m",
            "v3",
        )
        .await
        .unwrap();
    ctx.facts
        .upsert_fact(
            &novel_id,
            2,
            &fact_with(json!({"characters": [{"name": "行者"}]})),
            "m",
            "v3",
        )
        .await
        .unwrap();

    let profile = ctx.aggregator.person_profile(&novel_id, "行者").await.unwrap();
    assert_eq!(profile.name, "孙悟空");
    assert_eq!(profile.chapters_appeared, vec![1, 2]);
    assert!(profile.aliases.contains(&"行者".to_string()));
}

#[tokio::test]
async fn test_graph_weight_counts_distinct_chapters() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二", "三"]).await;

    for chapter in 1..=3u32 {
        ctx.facts
            .upsert_fact(
                &novel_id,
                chapter,
                &fact_with(json!({
                    "characters": [{"name": "韩立"}, {"name": "墨大夫"}],
                    "relationships": [{
                        "person_a": "韩立", "person_b": "墨大夫",
                        "relation_type": "师徒", "evidence": ""
                    }]
                })),
                "m",
                "v3",
            )
            .await
            .unwrap();
    }

    let graph = ctx.aggregator.graph(&novel_id, None).await.unwrap();
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.edges.len(), 1);
    assert_eq!(graph.edges[0].weight, 3);
    assert_eq!(graph.edges[0].category, EdgeCategory::Organizational);

    // Chapter-range filter shrinks the weight.
    let ranged = ctx.aggregator.graph(&novel_id, Some((1, 2))).await.unwrap();
    assert_eq!(ranged.edges[0].weight, 2);
}

#[tokio::test]
async fn test_item_holding_chain() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二", "三"]).await;

    ctx.facts
        .upsert_fact(
            &novel_id,
            1,
            &fact_with(json!({
                "item_events": [{
                    "item_name": "小瓶", "item_type": "法宝", "action": "obtain",
                    "actor": "韩立", "description": "得到神秘小瓶"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();
    ctx.facts
        .upsert_fact(
            &novel_id,
            2,
            &fact_with(json!({
                "item_events": [{
                    "item_name": "小瓶", "item_type": "法宝", "action": "gift",
                    "actor": "韩立", "recipient": "墨大夫", "description": "转赠"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();
    ctx.facts
        .upsert_fact(
            &novel_id,
            3,
            &fact_with(json!({
                "item_events": [{
                    "item_name": "小瓶", "item_type": "法宝", "action": "destroy",
                    "actor": "墨大夫", "description": "炸毁"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();

    let profile = ctx.aggregator.item_profile(&novel_id, "小瓶").await.unwrap();
    assert_eq!(profile.holding_chain.len(), 2);
    assert_eq!(profile.holding_chain[0].holder, "韩立");
    assert_eq!(profile.holding_chain[0].to_chapter, Some(2));
    assert_eq!(profile.holding_chain[1].holder, "墨大夫");
    assert_eq!(profile.holding_chain[1].to_chapter, Some(3));
    assert_eq!(profile.current_holder, None);
}

#[tokio::test]
async fn test_factions_membership_history() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二"]).await;

    ctx.facts
        .upsert_fact(
            &novel_id,
            1,
            &fact_with(json!({
                "org_events": [{
                    "org_name": "七玄门", "org_type": "门派", "member": "韩立",
                    "role": "记名弟子", "action": "join", "description": "入门"
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();
    ctx.facts
        .upsert_fact(
            &novel_id,
            2,
            &fact_with(json!({
                "org_events": [{
                    "org_name": "七玄门", "org_type": "门派", "member": "韩立",
                    "action": "leave", "description": "出走",
                    "org_relation": {"other_org": "野狼帮", "type": "敌对"}
                }]
            })),
            "m",
            "v3",
        )
        .await
        .unwrap();

    let factions = ctx.aggregator.factions(&novel_id, None).await.unwrap();
    assert_eq!(factions.factions.len(), 1);
    let sect = &factions.factions[0];
    assert_eq!(sect.name, "七玄门");
    assert_eq!(sect.members.len(), 1);
    assert_eq!(sect.members[0].joined_chapter, Some(1));
    assert_eq!(sect.members[0].left_chapter, Some(2));
    assert_eq!(sect.relations.len(), 1);
    assert_eq!(sect.relations[0].other_org, "野狼帮");
}

/// Running the same aggregate twice cache-cold yields identical output.
#[tokio::test]
async fn test_aggregation_is_idempotent() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二"]).await;

    for chapter in 1..=2u32 {
        ctx.facts
            .upsert_fact(
                &novel_id,
                chapter,
                &fact_with(json!({
                    "characters": [{"name": "韩立"}, {"name": "墨大夫"}],
                    "relationships": [{
                        "person_a": "韩立", "person_b": "墨大夫",
                        "relation_type": "师徒", "evidence": ""
                    }],
                    "events": [{"summary": format!("第{chapter}章大事"), "type": "growth"}]
                })),
                "m",
                "v3",
            )
            .await
            .unwrap();
    }

    let graph_a = ctx.aggregator.graph(&novel_id, None).await.unwrap();
    let timeline_a = ctx.aggregator.timeline(&novel_id, None).await.unwrap();
    // Cold cache for the second run.
    ctx.aggregator.invalidate_novel(&novel_id);
    let graph_b = ctx.aggregator.graph(&novel_id, None).await.unwrap();
    let timeline_b = ctx.aggregator.timeline(&novel_id, None).await.unwrap();

    assert_eq!(graph_a, graph_b);
    assert_eq!(timeline_a, timeline_b);
}

#[tokio::test]
async fn test_location_profile_residents_and_visitors() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["一", "二", "三"]).await;

    for chapter in 1..=3u32 {
        let mut characters = vec![json!({"name": "韩立", "locations_in_chapter": ["七玄门"]})];
        if chapter == 2 {
            characters.push(json!({"name": "过客", "locations_in_chapter": ["七玄门"]}));
        }
        ctx.facts
            .upsert_fact(
                &novel_id,
                chapter,
                &fact_with(json!({ "characters": characters })),
                "m",
                "v3",
            )
            .await
            .unwrap();
    }

    let profile = ctx
        .aggregator
        .location_profile(&novel_id, "七玄门")
        .await
        .unwrap();
    assert_eq!(profile.residents, vec!["韩立"]);
    assert_eq!(profile.visitors, vec!["过客"]);
    assert_eq!(profile.mention_count, 3);
}
