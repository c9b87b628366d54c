//! World-structure agent: four-continent recognition, heuristics, portals.

mod common;

use std::sync::Arc;

use common::{fact_with, ScriptedLlm};
use fabula::models::{
    CardinalDirection, LayerType, LocationTier, WorldStructure,
};
use fabula::services::WorldAgent;
use serde_json::json;

/// A Journey-to-the-West opening: the agent recognizes four continents with
/// cardinal directions from the declaration plus the LLM delta.
#[tokio::test]
async fn test_four_continents_with_directions() {
    let llm = Arc::new(ScriptedLlm::default());
    llm.push_json(json!({
        "operations": [
            {"op": "ADD_REGION", "name": "东胜神洲", "cardinal_direction": "east", "region_type": "洲"},
            {"op": "ADD_REGION", "name": "西牛贺洲", "cardinal_direction": "west", "region_type": "洲"},
            {"op": "ADD_REGION", "name": "南赡部洲", "cardinal_direction": "south", "region_type": "洲"},
            {"op": "ADD_REGION", "name": "北俱芦洲", "cardinal_direction": "north", "region_type": "洲"}
        ]
    }));
    let agent = WorldAgent::new(llm.clone());

    let mut structure = WorldStructure::default();
    let text = "盘古开辟，世界之间遂分为四大部洲：东胜神洲、西牛贺洲、南赡部洲、北俱芦洲。";
    let fact = fact_with(json!({
        "locations": [
            {"name": "东胜神洲", "type": "洲", "tier": "continent"},
            {"name": "西牛贺洲", "type": "洲", "tier": "continent"},
            {"name": "南赡部洲", "type": "洲", "tier": "continent"},
            {"name": "北俱芦洲", "type": "洲", "tier": "continent"}
        ]
    }));

    agent
        .observe_chapter(&mut structure, 1, text, &fact, &[])
        .await
        .unwrap();

    let regions = &structure.layers[0].regions;
    assert_eq!(regions.len(), 4);
    let direction_of = |name: &str| {
        regions
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.cardinal_direction)
    };
    assert_eq!(direction_of("东胜神洲"), Some(CardinalDirection::East));
    assert_eq!(direction_of("西牛贺洲"), Some(CardinalDirection::West));
    assert_eq!(direction_of("南赡部洲"), Some(CardinalDirection::South));
    assert_eq!(direction_of("北俱芦洲"), Some(CardinalDirection::North));
    // The region-division chapter triggered exactly one delta call.
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_heuristics_assign_tiers_and_parents_without_llm() {
    let llm = Arc::new(ScriptedLlm::default());
    let agent = WorldAgent::new(llm.clone());
    let mut structure = WorldStructure::default();

    // Chapter 6 with no trigger conditions: heuristics only.
    let fact = fact_with(json!({
        "locations": [
            {"name": "彩霞山", "type": "山"},
            {"name": "七玄门", "type": "宗门", "parent": "彩霞山"}
        ],
        "spatial_relationships": [{
            "source": "彩霞山", "target": "墨府",
            "relation_type": "contains", "value": "inside", "confidence": "high"
        }]
    }));
    agent
        .observe_chapter(&mut structure, 6, "寻常的一章。", &fact, &[])
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 0, "no gate condition, no LLM call");
    assert_eq!(structure.tier_of("彩霞山"), LocationTier::Site);
    assert_eq!(
        structure.location_parents.get("七玄门").map(String::as_str),
        Some("彩霞山")
    );
    assert_eq!(
        structure.location_parents.get("墨府").map(String::as_str),
        Some("彩霞山")
    );
}

#[tokio::test]
async fn test_layer_keyword_creates_layer_and_assignment() {
    let llm = Arc::new(ScriptedLlm::default());
    let agent = WorldAgent::new(llm.clone());
    let mut structure = WorldStructure::default();

    let fact = fact_with(json!({
        "locations": [{"name": "幽冥鬼城", "type": "城"}]
    }));
    // Chapter 6 avoids the small-chapter gate; the layer transition into an
    // absent layer still triggers the delta (scripted NO_CHANGE).
    llm.push_json(json!({"operations": [{"op": "NO_CHANGE"}]}));
    agent
        .observe_chapter(&mut structure, 6, "他坠入幽冥，见到鬼城。", &fact, &[])
        .await
        .unwrap();

    assert!(structure.has_layer("underworld"));
    assert_eq!(
        structure.location_layer_map.get("幽冥鬼城").map(String::as_str),
        Some("underworld")
    );
    assert_eq!(
        structure.layer("underworld").unwrap().layer_type,
        LayerType::Underworld
    );
}

#[tokio::test]
async fn test_bad_llm_op_is_non_fatal() {
    let llm = Arc::new(ScriptedLlm::default());
    // One undecodable op, one portal into a missing layer, one good region.
    llm.push_json(json!({
        "operations": [
            {"op": "TELEPORT_EVERYONE", "where": "nowhere"},
            {"op": "ADD_PORTAL", "name": "鬼门关", "source_layer": "overworld",
             "source_location": "酆都", "target_layer": "missing", "target_location": "奈何桥"},
            {"op": "ADD_REGION", "name": "北地", "cardinal_direction": "north"}
        ]
    }));
    let agent = WorldAgent::new(llm);
    let mut structure = WorldStructure::default();

    agent
        .observe_chapter(
            &mut structure,
            1,
            "正文。",
            &fact_with(json!({})),
            &[],
        )
        .await
        .unwrap();

    assert!(structure.portals.is_empty());
    assert_eq!(structure.layers[0].regions.len(), 1);
    assert_eq!(structure.layers[0].regions[0].name, "北地");
}

#[tokio::test]
async fn test_consolidation_adopts_orphans() {
    let llm = Arc::new(ScriptedLlm::default());
    let agent = WorldAgent::new(llm);
    let mut structure = WorldStructure::default();

    structure
        .location_tiers
        .insert("青牛镇".into(), LocationTier::City);
    structure
        .location_tiers
        .insert("落日峰".into(), LocationTier::Site);
    for child in ["落日崖洞", "落日草堂", "落日石屋"] {
        structure
            .location_tiers
            .insert(child.into(), LocationTier::Building);
        structure.set_parent(child, "落日峰").unwrap();
    }
    structure
        .location_tiers
        .insert("无名小筑".into(), LocationTier::Building);

    agent.consolidate(&mut structure).await.unwrap();

    // City-rank orphan goes to the uber-root; the fine orphan joins the
    // dominant node.
    assert_eq!(
        structure.location_parents.get("青牛镇").map(String::as_str),
        Some(fabula::models::UBER_ROOT)
    );
    assert_eq!(
        structure.location_parents.get("无名小筑").map(String::as_str),
        Some("落日峰")
    );
}
