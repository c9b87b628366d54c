//! Layout solver: conflict dropping, direction satisfaction, fallbacks,
//! override pinning.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use fabula::config::SolverSettings;
use fabula::models::{
    Confidence, LocationTier, OverrideType, SpatialRelationType, UserOverride, WorldStructure,
};
use fabula::services::{
    LayoutInput, LayoutMode, LayoutSolver, NoopGeoResolver, SpatialConstraint,
};
use serde_json::json;

fn solver() -> LayoutSolver {
    LayoutSolver::new(
        SolverSettings {
            time_budget_ms: 500,
            ..SolverSettings::default()
        },
        Arc::new(NoopGeoResolver),
    )
}

fn direction(source: &str, target: &str, value: &str, confidence: Confidence) -> SpatialConstraint {
    SpatialConstraint {
        source: source.into(),
        target: target.into(),
        kind: SpatialRelationType::Direction,
        value: value.into(),
        confidence,
        chapter: 1,
    }
}

fn world_with(locations: &[(&str, LocationTier)]) -> WorldStructure {
    let mut world = WorldStructure::default();
    for (name, tier) in locations {
        world.location_tiers.insert((*name).to_string(), *tier);
    }
    world
}

fn placement<'a>(
    result: &'a fabula::services::LayoutResult,
    name: &str,
) -> &'a fabula::services::PlacedLocation {
    result
        .layers
        .values()
        .flat_map(|v| v.iter())
        .find(|p| p.name == name)
        .unwrap_or_else(|| panic!("{name} not placed"))
}

/// S4: contradictory directions; the low-confidence one is dropped pre-solve
/// and the surviving one is satisfied.
#[tokio::test]
async fn test_conflicting_directions_resolved_by_confidence() {
    let solver = solver();
    let world = world_with(&[
        ("甲城", LocationTier::City),
        ("乙城", LocationTier::City),
        ("丙城", LocationTier::City),
    ]);
    let result = solver
        .compute_layered_layout(LayoutInput {
            novel_id: "n1".into(),
            world,
            constraints: vec![
                direction("甲城", "乙城", "north_of", Confidence::High),
                direction("乙城", "甲城", "north_of", Confidence::Low),
                direction("甲城", "乙城", "east_of", Confidence::Medium),
                direction("丙城", "乙城", "south_of", Confidence::High),
            ],
            overrides: vec![],
            first_chapter: HashMap::new(),
        })
        .await
        .unwrap();

    assert_eq!(result.mode, LayoutMode::Constraint);
    assert_eq!(result.dropped_constraints.len(), 1);
    assert!(result.dropped_constraints[0].contains("乙城"));

    let a = placement(&result, "甲城");
    let b = placement(&result, "乙城");
    assert!(
        a.y > b.y - 1.0,
        "north_of(甲城, 乙城) must hold: a.y={} b.y={}",
        a.y,
        b.y
    );
}

/// Property 6: every surviving high-confidence north_of is satisfied.
#[tokio::test]
async fn test_direction_constraints_satisfied() {
    let solver = solver();
    let world = world_with(&[
        ("北山", LocationTier::Site),
        ("南谷", LocationTier::Site),
        ("东湖", LocationTier::Site),
    ]);
    let result = solver
        .compute_layered_layout(LayoutInput {
            novel_id: "n2".into(),
            world,
            constraints: vec![
                direction("北山", "南谷", "north_of", Confidence::High),
                direction("东湖", "南谷", "east_of", Confidence::High),
                direction("东湖", "北山", "east_of", Confidence::Medium),
            ],
            overrides: vec![],
            first_chapter: HashMap::new(),
        })
        .await
        .unwrap();

    assert_eq!(result.mode, LayoutMode::Constraint);
    let north = placement(&result, "北山");
    let south = placement(&result, "南谷");
    let east = placement(&result, "东湖");
    assert!(north.y > south.y - 1.0);
    assert!(east.x > south.x - 1.0);
}

/// Zero spatial relationships: hierarchy fallback.
#[tokio::test]
async fn test_no_constraints_falls_back_to_hierarchy() {
    let solver = solver();
    let mut world = world_with(&[
        ("越国", LocationTier::Kingdom),
        ("七玄门", LocationTier::Site),
    ]);
    world.set_parent("七玄门", "越国").unwrap();

    let result = solver
        .compute_layered_layout(LayoutInput {
            novel_id: "n3".into(),
            world,
            constraints: vec![],
            overrides: vec![],
            first_chapter: HashMap::new(),
        })
        .await
        .unwrap();

    assert_eq!(result.mode, LayoutMode::Hierarchy);
    assert!(placement(&result, "七玄门").x > 0.0);
}

/// Coordinate overrides pin locations verbatim, constraint path or not.
#[tokio::test]
async fn test_coordinate_overrides_returned_verbatim() {
    let solver = solver();
    let world = world_with(&[("甲", LocationTier::Site), ("乙", LocationTier::Site)]);
    let overrides = vec![
        UserOverride {
            novel_id: "n4".into(),
            override_type: OverrideType::LocationCoordinate,
            override_key: "甲".into(),
            value: json!({"x": 321.0, "y": 654.0}),
            created_at: chrono::Utc::now(),
        },
        UserOverride {
            novel_id: "n4".into(),
            override_type: OverrideType::LocationCoordinate,
            override_key: "乙".into(),
            value: json!({"x": 111.0, "y": 222.0}),
            created_at: chrono::Utc::now(),
        },
    ];

    let result = solver
        .compute_layered_layout(LayoutInput {
            novel_id: "n4".into(),
            world,
            constraints: vec![],
            overrides,
            first_chapter: HashMap::new(),
        })
        .await
        .unwrap();

    let a = placement(&result, "甲");
    assert_eq!((a.x, a.y), (321.0, 654.0));
    let b = placement(&result, "乙");
    assert_eq!((b.x, b.y), (111.0, 222.0));
}

/// Placements stay inside the canvas safe margin.
#[tokio::test]
async fn test_placements_respect_canvas_bounds() {
    let solver = solver();
    let world = world_with(&[
        ("甲", LocationTier::Site),
        ("乙", LocationTier::Site),
        ("丙", LocationTier::Site),
        ("丁", LocationTier::Site),
    ]);
    let result = solver
        .compute_layered_layout(LayoutInput {
            novel_id: "n5".into(),
            world,
            constraints: vec![
                direction("甲", "乙", "north_of", Confidence::High),
                direction("丙", "丁", "west_of", Confidence::High),
                direction("甲", "丁", "east_of", Confidence::Medium),
            ],
            overrides: vec![],
            first_chapter: HashMap::new(),
        })
        .await
        .unwrap();

    // Continental default canvas: 4800 x 2700.
    for placed in result.layers.values().flat_map(|v| v.iter()) {
        assert!(placed.x >= 0.0 && placed.x <= 4800.0, "{placed:?}");
        assert!(placed.y >= 0.0 && placed.y <= 2700.0, "{placed:?}");
    }
}

/// Same input twice returns the identical (cached, deterministic) layout.
#[tokio::test]
async fn test_layout_is_cached_and_deterministic() {
    let solver = solver();
    let world = world_with(&[("甲", LocationTier::Site), ("乙", LocationTier::Site)]);
    let input = LayoutInput {
        novel_id: "n6".into(),
        world,
        constraints: vec![
            direction("甲", "乙", "north_of", Confidence::High),
            direction("甲", "乙", "east_of", Confidence::Medium),
            direction("乙", "甲", "west_of", Confidence::Medium),
        ],
        overrides: vec![],
        first_chapter: HashMap::new(),
    };

    let first = solver.compute_layered_layout(input.clone()).await.unwrap();
    let second = solver.compute_layered_layout(input).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second), "second call must hit the cache");
}

/// Invalidation bumps the generation so a fresh solve happens.
#[tokio::test]
async fn test_invalidation_forces_resolve() {
    let solver = solver();
    let world = world_with(&[("甲", LocationTier::Site)]);
    let input = LayoutInput {
        novel_id: "n7".into(),
        world,
        constraints: vec![],
        overrides: vec![],
        first_chapter: HashMap::new(),
    };
    let first = solver.compute_layered_layout(input.clone()).await.unwrap();
    solver.invalidate_novel("n7");
    let second = solver.compute_layered_layout(input).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}
