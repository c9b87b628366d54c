//! User overrides on the world structure: precedence and portal edits.

mod common;

use common::{seed_novel, test_ctx};
use fabula::models::{LayerType, LocationTier, OverrideType, UserOverride};
use fabula::repository::WorldRepository;
use serde_json::json;

fn make_override(
    novel_id: &str,
    override_type: OverrideType,
    key: &str,
    value: serde_json::Value,
) -> UserOverride {
    UserOverride {
        novel_id: novel_id.to_string(),
        override_type,
        override_key: key.to_string(),
        value,
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_overrides_beat_ai_values() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["正文"]).await;

    let mut structure = ctx.world.get_structure(&novel_id).await.unwrap();
    structure
        .location_tiers
        .insert("七玄门".into(), LocationTier::Site);
    structure.set_parent("七玄门", "彩霞山").unwrap();
    ctx.world.put_structure(&novel_id, &structure).await.unwrap();

    for (override_type, key, value) in [
        (OverrideType::LocationTier, "七玄门", json!("city")),
        (OverrideType::LocationParent, "七玄门", json!({"parent": "越国"})),
        (OverrideType::LocationRegion, "七玄门", json!("南域")),
    ] {
        ctx.world
            .put_override(&make_override(&novel_id, override_type, key, value))
            .await
            .unwrap();
    }

    let mut view = ctx.world.get_structure(&novel_id).await.unwrap();
    view.apply_overrides(&ctx.world.list_overrides(&novel_id).await.unwrap());

    assert_eq!(view.tier_of("七玄门"), LocationTier::City);
    assert_eq!(
        view.location_parents.get("七玄门").map(String::as_str),
        Some("越国")
    );
    assert_eq!(
        view.location_region_map.get("七玄门").map(String::as_str),
        Some("南域")
    );
    // The stored structure keeps the AI value; the override wins on read,
    // so it survives any number of re-analyses.
    let stored = ctx.world.get_structure(&novel_id).await.unwrap();
    assert_eq!(stored.tier_of("七玄门"), LocationTier::Site);
}

#[tokio::test]
async fn test_portal_overrides_add_and_delete() {
    let ctx = test_ctx().await;
    let novel_id = seed_novel(&ctx, "测试", &["正文"]).await;

    let mut structure = ctx.world.get_structure(&novel_id).await.unwrap();
    structure.ensure_layer("celestial", "天界", LayerType::Celestial);
    ctx.world.put_structure(&novel_id, &structure).await.unwrap();

    ctx.world
        .put_override(&make_override(
            &novel_id,
            OverrideType::AddPortal,
            "登天梯",
            json!({
                "name": "登天梯",
                "source_layer": "overworld",
                "source_location": "昆仑山",
                "target_layer": "celestial",
                "target_location": "南天门",
                "is_bidirectional": true,
                "first_chapter": 10
            }),
        ))
        .await
        .unwrap();

    let mut view = ctx.world.get_structure(&novel_id).await.unwrap();
    view.apply_overrides(&ctx.world.list_overrides(&novel_id).await.unwrap());
    assert_eq!(view.portals.len(), 1);

    // A delete override for the same portal removes it again.
    ctx.world
        .put_override(&make_override(
            &novel_id,
            OverrideType::DeletePortal,
            "登天梯",
            json!({}),
        ))
        .await
        .unwrap();
    let mut view = ctx.world.get_structure(&novel_id).await.unwrap();
    view.apply_overrides(&ctx.world.list_overrides(&novel_id).await.unwrap());
    assert!(view.portals.is_empty());
}
