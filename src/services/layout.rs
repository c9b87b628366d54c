//! Constraint-based map layout solver.
//!
//! Places every known location of a novel on one 2-D canvas per layer.
//! Primary path: a global derivative-free optimizer (differential-evolution
//! style) over an energy function built from the extracted spatial
//! constraints, seeded by the hierarchy tree. Degrades to a concentric
//! hierarchy layout when constraints are scarce or the solve goes bad, and
//! passes through real coordinates for real-world novels.
//!
//! Canvas convention: +x = east (right), +y = north (up). A direction
//! constraint that inverts this is malformed and rejected at parse time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SolverSettings;
use crate::models::{
    CardinalDirection, Confidence, LayerType, LocationTier, SpatialRelationType, SpatialScale,
    UserOverride, WorldStructure, OVERWORLD_LAYER,
};
use crate::utils::text::parse_cn_number;
use crate::FabulaError;

/// Bumped when the energy function or optimizer changes; part of cache keys.
const SOLVER_VERSION: &str = "v2";

const SAFE_MARGIN: f64 = 50.0;
const MIN_SPACING: f64 = 50.0;
const DIRECTION_MARGIN: f64 = 30.0;
const SEPARATION_THRESHOLD: f64 = 120.0;

const W_DIR: f64 = 10.0;
const W_DIST: f64 = 0.5;
const W_CONTAIN: f64 = 5.0;
const W_SEP: f64 = 2.0;
const W_OVERLAP: f64 = 3.0;
const W_BOUNDS: f64 = 20.0;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    Constraint,
    Hierarchy,
    Geographic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedLocation {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutResult {
    pub mode: LayoutMode,
    /// layer_id -> placements on that layer's canvas.
    pub layers: BTreeMap<String, Vec<PlacedLocation>>,
    /// Real-world coordinates, geographic mode only.
    pub geo_coords: Option<BTreeMap<String, (f64, f64)>>,
    /// Human-readable descriptions of constraints dropped pre-solve.
    pub dropped_constraints: Vec<String>,
}

/// One spatial constraint, decoupled from the fact it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialConstraint {
    pub source: String,
    pub target: String,
    pub kind: SpatialRelationType,
    pub value: String,
    pub confidence: Confidence,
    pub chapter: u32,
}

/// Everything a solve needs; assembled by the aggregator.
#[derive(Debug, Clone)]
pub struct LayoutInput {
    pub novel_id: String,
    pub world: WorldStructure,
    pub constraints: Vec<SpatialConstraint>,
    pub overrides: Vec<UserOverride>,
    /// First chapter each location appeared in (storyline axis).
    pub first_chapter: HashMap<String, u32>,
}

// ============================================================================
// Geo resolver (external collaborator)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoType {
    Realistic,
    Mixed,
    Fantasy,
}

/// Real-world coordinate resolver for novels set on Earth.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn detect_geo_type(&self, names: &[String]) -> GeoType;
    async fn resolve(&self, names: &[String]) -> HashMap<String, (f64, f64)>;
}

/// Default resolver: everything is fantasy, nothing resolves.
pub struct NoopGeoResolver;

#[async_trait]
impl GeoResolver for NoopGeoResolver {
    async fn detect_geo_type(&self, _names: &[String]) -> GeoType {
        GeoType::Fantasy
    }

    async fn resolve(&self, _names: &[String]) -> HashMap<String, (f64, f64)> {
        HashMap::new()
    }
}

// ============================================================================
// Solver service
// ============================================================================

pub struct LayoutSolver {
    settings: SolverSettings,
    geo: Arc<dyn GeoResolver>,
    cache: Cache<String, Arc<LayoutResult>>,
    generations: Mutex<HashMap<String, u64>>,
}

impl LayoutSolver {
    pub fn new(settings: SolverSettings, geo: Arc<dyn GeoResolver>) -> Self {
        LayoutSolver {
            settings,
            geo,
            cache: Cache::new(64),
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every cached layout of a novel (new fact write or override).
    pub fn invalidate_novel(&self, novel_id: &str) {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *generations.entry(novel_id.to_string()).or_default() += 1;
    }

    fn generation(&self, novel_id: &str) -> u64 {
        let generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        generations.get(novel_id).copied().unwrap_or(0)
    }

    /// Compute (or fetch) the layered layout for a novel.
    pub async fn compute_layered_layout(
        &self,
        input: LayoutInput,
    ) -> Result<Arc<LayoutResult>, FabulaError> {
        let key = self.cache_key(&input);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }
        let result = Arc::new(self.solve(input).await?);
        self.cache.insert(key, result.clone()).await;
        Ok(result)
    }

    fn cache_key(&self, input: &LayoutInput) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        SOLVER_VERSION.hash(&mut hasher);
        let (w, h) = canvas_for(input.world.spatial_scale);
        (w as u64, h as u64).hash(&mut hasher);
        let mut constraint_keys: Vec<String> = input
            .constraints
            .iter()
            .map(|c| format!("{}|{}|{:?}|{}|{:?}", c.source, c.target, c.kind, c.value, c.confidence))
            .collect();
        constraint_keys.sort();
        constraint_keys.hash(&mut hasher);
        let mut override_keys: Vec<String> = input
            .overrides
            .iter()
            .map(|o| format!("{}|{}|{}", o.override_type.as_str(), o.override_key, o.value))
            .collect();
        override_keys.sort();
        override_keys.hash(&mut hasher);
        format!(
            "{}:{}:{:x}",
            input.novel_id,
            self.generation(&input.novel_id),
            hasher.finish()
        )
    }

    async fn solve(&self, mut input: LayoutInput) -> Result<LayoutResult, FabulaError> {
        input.world.apply_overrides(&input.overrides);
        let locations = known_locations(&input.world, &input.constraints);
        if locations.is_empty() {
            return Ok(LayoutResult {
                mode: LayoutMode::Hierarchy,
                layers: BTreeMap::new(),
                geo_coords: None,
                dropped_constraints: Vec::new(),
            });
        }

        // Geographic path for real-world novels.
        match self.geo.detect_geo_type(&locations).await {
            GeoType::Realistic | GeoType::Mixed => {
                let resolved = self.geo.resolve(&locations).await;
                if !resolved.is_empty() {
                    return Ok(geographic_result(&locations, &input, resolved));
                }
                warn!(novel_id = %input.novel_id, "geo resolver returned nothing, falling back");
            }
            GeoType::Fantasy => {}
        }

        let (mut constraints, dropped) = drop_conflicts(input.constraints.clone());
        let pinned = coordinate_pins(&input.overrides);
        constraints.retain(|c| c.kind != SpatialRelationType::Terrain);

        let unpinned_with_constraints = constraints
            .iter()
            .flat_map(|c| [c.source.as_str(), c.target.as_str()])
            .filter(|n| !pinned.contains_key(*n))
            .collect::<HashSet<_>>();
        let usable = constraints.len();

        if usable < 3 || unpinned_with_constraints.is_empty() {
            debug!(
                novel_id = %input.novel_id,
                usable,
                "too few spatial constraints, using hierarchy layout"
            );
            let mut result = hierarchy_layout(&input.world, &locations, &pinned);
            result.dropped_constraints = dropped;
            return Ok(result);
        }

        let budget = Duration::from_millis(self.settings.time_budget_ms);
        match self.constraint_layout(&input, &locations, &constraints, &pinned, budget) {
            Some(mut result) => {
                result.dropped_constraints = dropped;
                Ok(result)
            }
            None => {
                info!(novel_id = %input.novel_id, "constraint solve degenerated, hierarchy fallback");
                let mut result = hierarchy_layout(&input.world, &locations, &pinned);
                result.dropped_constraints = dropped;
                Ok(result)
            }
        }
    }

    /// Region-partitioned constraint solve across all layers.
    fn constraint_layout(
        &self,
        input: &LayoutInput,
        locations: &[String],
        constraints: &[SpatialConstraint],
        pinned: &HashMap<String, (f64, f64)>,
        budget: Duration,
    ) -> Option<LayoutResult> {
        let world = &input.world;
        let mut layers: BTreeMap<String, Vec<PlacedLocation>> = BTreeMap::new();

        // Group locations per layer; the overworld is sub-partitioned by
        // region when regions carry cardinal directions.
        let mut by_layer: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in locations {
            let layer = world
                .location_layer_map
                .get(name)
                .cloned()
                .unwrap_or_else(|| OVERWORLD_LAYER.to_string());
            by_layer.entry(layer).or_default().push(name.clone());
        }

        for (layer_id, layer_locations) in by_layer {
            let canvas = layer_canvas(world, &layer_id);
            let regions = region_boxes(world, &layer_id, canvas);

            // Partition this layer's locations into region boxes.
            let mut groups: Vec<(Rect, Vec<String>)> = Vec::new();
            let mut unassigned: Vec<String> = Vec::new();
            for name in layer_locations {
                match world
                    .location_region_map
                    .get(&name)
                    .and_then(|r| regions.get(r))
                {
                    Some(rect) => match groups.iter().position(|(g, _)| *g == *rect) {
                        Some(pos) => groups[pos].1.push(name),
                        None => groups.push((*rect, vec![name])),
                    },
                    None => unassigned.push(name),
                }
            }
            if !unassigned.is_empty() {
                groups.push((
                    Rect {
                        min_x: SAFE_MARGIN,
                        min_y: SAFE_MARGIN,
                        max_x: canvas.0 - SAFE_MARGIN,
                        max_y: canvas.1 - SAFE_MARGIN,
                    },
                    unassigned,
                ));
            }

            let mut placements: Vec<PlacedLocation> = Vec::new();
            for (rect, members) in groups {
                let solved = self.solve_region(
                    input,
                    &members,
                    constraints,
                    pinned,
                    rect,
                    budget,
                )?;
                placements.extend(solved);
            }

            // Portals sit next to their source location.
            for portal in &world.portals {
                if portal.source_layer != layer_id {
                    continue;
                }
                let anchor = placements
                    .iter()
                    .find(|p| p.name == portal.source_location)
                    .map(|p| (p.x, p.y, p.radius));
                if let Some((ax, ay, radius)) = anchor {
                    placements.push(PlacedLocation {
                        name: portal.name.clone(),
                        x: (ax + radius + 20.0).min(canvas.0 - SAFE_MARGIN),
                        y: (ay + radius + 20.0).min(canvas.1 - SAFE_MARGIN),
                        radius: 12.0,
                    });
                }
            }

            layers.insert(layer_id, placements);
        }

        Some(LayoutResult {
            mode: LayoutMode::Constraint,
            layers,
            geo_coords: None,
            dropped_constraints: Vec::new(),
        })
    }

    /// Solve one region box with the global optimizer.
    fn solve_region(
        &self,
        input: &LayoutInput,
        members: &[String],
        constraints: &[SpatialConstraint],
        pinned: &HashMap<String, (f64, f64)>,
        rect: Rect,
        budget: Duration,
    ) -> Option<Vec<PlacedLocation>> {
        let world = &input.world;
        let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
        let local: Vec<&SpatialConstraint> = constraints
            .iter()
            .filter(|c| member_set.contains(c.source.as_str()) && member_set.contains(c.target.as_str()))
            .collect();

        let free: Vec<&String> = members.iter().filter(|m| !pinned.contains_key(*m)).collect();
        let mut positions: HashMap<String, (f64, f64)> = pinned
            .iter()
            .filter(|(name, _)| member_set.contains(name.as_str()))
            .map(|(name, xy)| (name.clone(), *xy))
            .collect();

        if free.is_empty() {
            // Everything user-pinned: return the overrides verbatim.
            return Some(
                members
                    .iter()
                    .map(|name| PlacedLocation {
                        name: name.clone(),
                        x: positions.get(name).map(|p| p.0).unwrap_or(rect.center_x()),
                        y: positions.get(name).map(|p| p.1).unwrap_or(rect.center_y()),
                        radius: tier_radius(world.tier_of(name)),
                    })
                    .collect(),
            );
        }

        // Deterministic seed keeps layouts stable between runs on the same
        // input; positions differ only when the input does.
        let mut seed_hasher = std::collections::hash_map::DefaultHasher::new();
        input.novel_id.hash(&mut seed_hasher);
        members.hash(&mut seed_hasher);
        let mut rng = StdRng::seed_from_u64(seed_hasher.finish());

        let seed_positions = hierarchy_seed(world, &free, rect, &mut rng);
        let narrative = NarrativeAxis::new(&input.first_chapter, rect);
        let energy = EnergyModel {
            world,
            constraints: &local,
            pinned: &positions,
            free: &free,
            rect,
            narrative,
            narrative_weight: self.settings.narrative_weight,
            scale: world.spatial_scale,
        };

        let best = differential_evolution(&energy, seed_positions, rect, budget, &mut rng);
        if best.iter().any(|v| !v.is_finite()) {
            return None;
        }

        for (idx, name) in free.iter().enumerate() {
            positions.insert((*name).clone(), (best[idx * 2], best[idx * 2 + 1]));
        }

        Some(
            members
                .iter()
                .map(|name| {
                    let (x, y) = positions
                        .get(name)
                        .copied()
                        .unwrap_or((rect.center_x(), rect.center_y()));
                    PlacedLocation {
                        name: name.clone(),
                        x,
                        y,
                        radius: tier_radius(world.tier_of(name)),
                    }
                })
                .collect(),
        )
    }
}

// ============================================================================
// Canvas geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    fn center_x(&self) -> f64 {
        (self.min_x + self.max_x) / 2.0
    }
    fn center_y(&self) -> f64 {
        (self.min_y + self.max_y) / 2.0
    }
    fn width(&self) -> f64 {
        self.max_x - self.min_x
    }
    fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// 16:9 canvases per spatial scale.
pub fn canvas_for(scale: SpatialScale) -> (f64, f64) {
    match scale {
        SpatialScale::Cosmic => (8000.0, 4500.0),
        SpatialScale::Continental => (4800.0, 2700.0),
        SpatialScale::National => (3200.0, 1800.0),
        SpatialScale::Urban => (1600.0, 900.0),
        SpatialScale::Local => (800.0, 450.0),
    }
}

fn layer_canvas(world: &WorldStructure, layer_id: &str) -> (f64, f64) {
    match world.layer(layer_id).map(|l| l.layer_type) {
        Some(LayerType::Overworld) | None => canvas_for(world.spatial_scale),
        Some(LayerType::Instance) => (480.0, 270.0),
        Some(_) => (960.0, 540.0),
    }
}

/// Place each directed region's bounding box in its canvas quadrant; regions
/// sharing a direction split that band evenly.
fn region_boxes(world: &WorldStructure, layer_id: &str, canvas: (f64, f64)) -> HashMap<String, Rect> {
    let mut boxes = HashMap::new();
    let Some(layer) = world.layer(layer_id) else {
        return boxes;
    };
    let (w, h) = canvas;
    let full = Rect {
        min_x: SAFE_MARGIN,
        min_y: SAFE_MARGIN,
        max_x: w - SAFE_MARGIN,
        max_y: h - SAFE_MARGIN,
    };

    let mut per_direction: HashMap<CardinalDirection, Vec<&str>> = HashMap::new();
    for region in &layer.regions {
        let direction = region.cardinal_direction.unwrap_or(CardinalDirection::Center);
        per_direction.entry(direction).or_default().push(&region.name);
    }

    for (direction, names) in per_direction {
        // +y is north: the north band is the upper half of the canvas.
        let band = match direction {
            CardinalDirection::East => Rect {
                min_x: full.center_x(),
                ..full
            },
            CardinalDirection::West => Rect {
                max_x: full.center_x(),
                ..full
            },
            CardinalDirection::North => Rect {
                min_y: full.center_y(),
                ..full
            },
            CardinalDirection::South => Rect {
                max_y: full.center_y(),
                ..full
            },
            CardinalDirection::Center => Rect {
                min_x: full.min_x + full.width() * 0.25,
                max_x: full.max_x - full.width() * 0.25,
                min_y: full.min_y + full.height() * 0.25,
                max_y: full.max_y - full.height() * 0.25,
            },
        };
        // Ties split the band vertically into equal slots.
        let slot = band.width() / names.len() as f64;
        for (idx, name) in names.iter().enumerate() {
            boxes.insert(
                (*name).to_string(),
                Rect {
                    min_x: band.min_x + slot * idx as f64,
                    max_x: band.min_x + slot * (idx + 1) as f64,
                    ..band
                },
            );
        }
    }
    boxes
}

fn tier_radius(tier: LocationTier) -> f64 {
    match tier {
        LocationTier::World => 220.0,
        LocationTier::Continent => 160.0,
        LocationTier::Kingdom => 110.0,
        LocationTier::Region => 90.0,
        LocationTier::City => 60.0,
        LocationTier::Site => 40.0,
        LocationTier::Building => 25.0,
        LocationTier::Room => 15.0,
    }
}

// ============================================================================
// Constraint preprocessing
// ============================================================================

/// Expected sign of (A - B) per axis for a direction value; `dy > 0` means
/// A is north of (above) B. Returns `None` for unparseable values.
fn direction_vector(value: &str) -> Option<(f64, f64)> {
    let v = value.trim().trim_end_matches("_of");
    match v {
        "north" | "北" | "北方" | "以北" => Some((0.0, 1.0)),
        "south" | "南" | "南方" | "以南" => Some((0.0, -1.0)),
        "east" | "东" | "东方" | "以东" => Some((1.0, 0.0)),
        "west" | "西" | "西方" | "以西" => Some((-1.0, 0.0)),
        "northeast" | "东北" => Some((1.0, 1.0)),
        "northwest" | "西北" => Some((-1.0, 1.0)),
        "southeast" | "东南" => Some((1.0, -1.0)),
        "southwest" | "西南" => Some((-1.0, -1.0)),
        _ => None,
    }
}

/// Detect contradictory direction constraints pair-wise and drop the
/// lower-confidence side. Returns surviving constraints and drop logs.
fn drop_conflicts(constraints: Vec<SpatialConstraint>) -> (Vec<SpatialConstraint>, Vec<String>) {
    let mut dropped_idx: HashSet<usize> = HashSet::new();
    let mut dropped_log = Vec::new();

    for i in 0..constraints.len() {
        for j in (i + 1)..constraints.len() {
            if dropped_idx.contains(&i) || dropped_idx.contains(&j) {
                continue;
            }
            let (a, b) = (&constraints[i], &constraints[j]);
            if a.kind != SpatialRelationType::Direction || b.kind != SpatialRelationType::Direction {
                continue;
            }
            let (Some(va), Some(vb)) = (direction_vector(&a.value), direction_vector(&b.value))
            else {
                continue;
            };
            // Normalize b onto a's pair orientation.
            let vb = if a.source == b.source && a.target == b.target {
                vb
            } else if a.source == b.target && a.target == b.source {
                (-vb.0, -vb.1)
            } else {
                continue;
            };
            let conflicting = va.0 * vb.0 + va.1 * vb.1 < 0.0;
            if conflicting {
                let (drop, keep) = if a.confidence >= b.confidence { (j, i) } else { (i, j) };
                dropped_idx.insert(drop);
                let loser = &constraints[drop];
                let winner = &constraints[keep];
                warn!(
                    source = %loser.source,
                    target = %loser.target,
                    value = %loser.value,
                    "dropping direction constraint conflicting with higher-confidence {}",
                    winner.value
                );
                dropped_log.push(format!(
                    "{} {} {} (conflicts with {} at higher confidence)",
                    loser.source, loser.value, loser.target, winner.value
                ));
            }
        }
    }

    let kept = constraints
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !dropped_idx.contains(idx))
        .map(|(_, c)| c)
        .collect();
    (kept, dropped_log)
}

fn coordinate_pins(overrides: &[UserOverride]) -> HashMap<String, (f64, f64)> {
    overrides
        .iter()
        .filter(|o| o.override_type == crate::models::OverrideType::LocationCoordinate)
        .filter_map(|o| {
            let x = o.value.get("x").and_then(|v| v.as_f64())?;
            let y = o.value.get("y").and_then(|v| v.as_f64())?;
            Some((o.override_key.clone(), (x, y)))
        })
        .collect()
}

/// Parse a narrative distance into canvas units: number × mode speed ×
/// terrain factor, then km scaled by the canvas' km-per-unit.
fn narrative_distance_units(value: &str, scale: SpatialScale) -> Option<f64> {
    let number = extract_number(value)?;
    let speed_km_per_day = if value.contains('飞') || value.contains("御剑") {
        200.0
    } else if value.contains('骑') || value.contains('马') {
        60.0
    } else if value.contains("瞬") || value.contains("转眼") {
        0.0
    } else {
        30.0
    };
    let terrain = if value.contains('林') {
        0.6
    } else if value.contains('山') || value.contains('沼') {
        0.3
    } else {
        1.0
    };
    // Hours instead of days shrink the leg proportionally.
    let day_fraction = if value.contains("时辰") || value.contains("小时") {
        1.0 / 12.0
    } else {
        1.0
    };
    let km = number * day_fraction * speed_km_per_day * terrain;
    let km_per_unit = match scale {
        SpatialScale::Cosmic => 50.0,
        SpatialScale::Continental => 20.0,
        SpatialScale::National => 8.0,
        SpatialScale::Urban => 0.5,
        SpatialScale::Local => 0.1,
    };
    Some(km / km_per_unit)
}

/// First number (Chinese or ASCII) found in a free-form distance phrase.
fn extract_number(value: &str) -> Option<f64> {
    let chars: Vec<char> = value.chars().collect();
    for start in 0..chars.len() {
        for len in (1..=4.min(chars.len() - start)).rev() {
            let candidate: String = chars[start..start + len].iter().collect();
            if let Some(n) = parse_cn_number(&candidate) {
                return Some(n);
            }
        }
    }
    None
}

// ============================================================================
// Energy model
// ============================================================================

struct NarrativeAxis {
    /// (index into free vector ordering handled by caller, chapter).
    chapters: HashMap<String, u32>,
    rect: Rect,
}

impl NarrativeAxis {
    fn new(first_chapter: &HashMap<String, u32>, rect: Rect) -> Self {
        NarrativeAxis {
            chapters: first_chapter.clone(),
            rect,
        }
    }

    /// Vertical jitter target for a chapter: a periodic sine keeps
    /// storyline-ordered locations off a single horizontal line.
    fn jitter(&self, chapter: u32) -> f64 {
        self.rect.center_y() + (self.rect.height() / 8.0) * (chapter as f64 * 0.9).sin()
    }
}

struct EnergyModel<'a> {
    world: &'a WorldStructure,
    constraints: &'a [&'a SpatialConstraint],
    pinned: &'a HashMap<String, (f64, f64)>,
    free: &'a [&'a String],
    rect: Rect,
    narrative: NarrativeAxis,
    narrative_weight: f64,
    scale: SpatialScale,
}

impl EnergyModel<'_> {
    fn position(&self, name: &str, vars: &[f64]) -> Option<(f64, f64)> {
        if let Some(xy) = self.pinned.get(name) {
            return Some(*xy);
        }
        self.free
            .iter()
            .position(|f| f.as_str() == name)
            .map(|idx| (vars[idx * 2], vars[idx * 2 + 1]))
    }

    fn evaluate(&self, vars: &[f64]) -> f64 {
        let mut energy = 0.0;

        for constraint in self.constraints {
            let (Some(a), Some(b)) = (
                self.position(&constraint.source, vars),
                self.position(&constraint.target, vars),
            ) else {
                continue;
            };
            match constraint.kind {
                SpatialRelationType::Direction => {
                    if let Some((dx, dy)) = direction_vector(&constraint.value) {
                        // north_of(A,B): B.y - A.y + margin must go negative.
                        if dy > 0.0 {
                            energy += W_DIR * (b.1 - a.1 + DIRECTION_MARGIN).max(0.0).powi(2);
                        } else if dy < 0.0 {
                            energy += W_DIR * (a.1 - b.1 + DIRECTION_MARGIN).max(0.0).powi(2);
                        }
                        if dx > 0.0 {
                            energy += W_DIR * (b.0 - a.0 + DIRECTION_MARGIN).max(0.0).powi(2);
                        } else if dx < 0.0 {
                            energy += W_DIR * (a.0 - b.0 + DIRECTION_MARGIN).max(0.0).powi(2);
                        }
                    }
                }
                SpatialRelationType::Distance => {
                    if let Some(target) = narrative_distance_units(&constraint.value, self.scale) {
                        let d = dist(a, b);
                        energy += W_DIST * (d - target).powi(2);
                    }
                }
                SpatialRelationType::Contains => {
                    let parent_radius = tier_radius(self.world.tier_of(&constraint.source));
                    energy += W_CONTAIN * (dist(a, b) - parent_radius).max(0.0).powi(2);
                }
                SpatialRelationType::SeparatedBy => {
                    energy += W_SEP * (SEPARATION_THRESHOLD - dist(a, b)).max(0.0).powi(2);
                }
                SpatialRelationType::Adjacent => {
                    let d = dist(a, b);
                    energy += W_DIST * (d - MIN_SPACING * 2.0).powi(2) * 0.2;
                }
                SpatialRelationType::Terrain | SpatialRelationType::InBetween => {}
            }
        }

        // Pairwise overlap among free locations (pinned stay where pinned).
        for i in 0..self.free.len() {
            let a = (vars[i * 2], vars[i * 2 + 1]);
            for j in (i + 1)..self.free.len() {
                let b = (vars[j * 2], vars[j * 2 + 1]);
                energy += W_OVERLAP * (MIN_SPACING - dist(a, b)).max(0.0).powi(2);
            }
        }

        // Storyline axis: gentle eastward progression, sine-jittered north.
        for (idx, name) in self.free.iter().enumerate() {
            if let Some(chapter) = self.narrative.chapters.get(name.as_str()) {
                let (x, y) = (vars[idx * 2], vars[idx * 2 + 1]);
                let progress = *chapter as f64 / (self.narrative.chapters.len().max(1) as f64 + 1.0);
                let target_x = self.rect.min_x + self.rect.width() * progress.min(1.0);
                let target_y = self.narrative.jitter(*chapter);
                energy += self.narrative_weight * ((x - target_x).powi(2) * 0.01);
                energy += self.narrative_weight * ((y - target_y).powi(2) * 0.005);
            }
        }

        // Hard quadratic walls.
        for idx in 0..self.free.len() {
            let (x, y) = (vars[idx * 2], vars[idx * 2 + 1]);
            energy += W_BOUNDS * (self.rect.min_x - x).max(0.0).powi(2);
            energy += W_BOUNDS * (x - self.rect.max_x).max(0.0).powi(2);
            energy += W_BOUNDS * (self.rect.min_y - y).max(0.0).powi(2);
            energy += W_BOUNDS * (y - self.rect.max_y).max(0.0).powi(2);
        }

        energy
    }
}

fn dist(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

// ============================================================================
// Optimizer
// ============================================================================

/// Hierarchy-tree seed with light jitter: children start near their parent,
/// roots spread over the box.
fn hierarchy_seed(
    world: &WorldStructure,
    free: &[&String],
    rect: Rect,
    rng: &mut StdRng,
) -> Vec<f64> {
    let mut seed = Vec::with_capacity(free.len() * 2);
    let mut placed: HashMap<&str, (f64, f64)> = HashMap::new();
    for (idx, name) in free.iter().enumerate() {
        let base = match world
            .location_parents
            .get(name.as_str())
            .and_then(|p| placed.get(p.as_str()))
        {
            Some(parent_pos) => *parent_pos,
            None => {
                let angle = idx as f64 * 2.399_963; // golden angle spiral
                let radius = rect.width().min(rect.height()) * 0.35
                    * ((idx + 1) as f64 / (free.len() + 1) as f64).sqrt();
                (
                    rect.center_x() + radius * angle.cos(),
                    rect.center_y() + radius * angle.sin() * (rect.height() / rect.width()),
                )
            }
        };
        let x = (base.0 + rng.gen_range(-60.0..60.0)).clamp(rect.min_x, rect.max_x);
        let y = (base.1 + rng.gen_range(-60.0..60.0)).clamp(rect.min_y, rect.max_y);
        placed.insert(name.as_str(), (x, y));
        seed.push(x);
        seed.push(y);
    }
    seed
}

/// Classic DE/rand/1/bin over the flattened coordinate vector, stopping at
/// the wall-clock budget.
fn differential_evolution(
    energy: &EnergyModel<'_>,
    seed: Vec<f64>,
    rect: Rect,
    budget: Duration,
    rng: &mut StdRng,
) -> Vec<f64> {
    const POPULATION: usize = 24;
    const CROSSOVER: f64 = 0.9;
    let deadline = Instant::now() + budget;
    let dims = seed.len();
    if dims == 0 {
        return seed;
    }

    let mut population: Vec<Vec<f64>> = (0..POPULATION)
        .map(|i| {
            if i == 0 {
                seed.clone()
            } else {
                seed.iter()
                    .enumerate()
                    .map(|(d, v)| {
                        let span = if d % 2 == 0 { rect.width() } else { rect.height() };
                        (v + rng.gen_range(-span / 4.0..span / 4.0)).clamp(
                            if d % 2 == 0 { rect.min_x } else { rect.min_y },
                            if d % 2 == 0 { rect.max_x } else { rect.max_y },
                        )
                    })
                    .collect()
            }
        })
        .collect();
    let mut scores: Vec<f64> = population.iter().map(|p| energy.evaluate(p)).collect();

    let mut generation = 0usize;
    while Instant::now() < deadline && generation < 400 {
        for i in 0..POPULATION {
            let f = rng.gen_range(0.4..0.9);
            let (r1, r2, r3) = pick_three(POPULATION, i, rng);
            let forced = rng.gen_range(0..dims);
            let mut trial = population[i].clone();
            for d in 0..dims {
                if d == forced || rng.gen_bool(CROSSOVER) {
                    let v = population[r1][d] + f * (population[r2][d] - population[r3][d]);
                    let (lo, hi) = if d % 2 == 0 {
                        (rect.min_x, rect.max_x)
                    } else {
                        (rect.min_y, rect.max_y)
                    };
                    trial[d] = v.clamp(lo, hi);
                }
            }
            let trial_score = energy.evaluate(&trial);
            if trial_score <= scores[i] {
                population[i] = trial;
                scores[i] = trial_score;
            }
        }
        generation += 1;
    }

    let best = scores
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    population.swap_remove(best)
}

fn pick_three(n: usize, exclude: usize, rng: &mut StdRng) -> (usize, usize, usize) {
    let mut pick = || loop {
        let v = rng.gen_range(0..n);
        if v != exclude {
            return v;
        }
    };
    (pick(), pick(), pick())
}

// ============================================================================
// Fallback layouts
// ============================================================================

/// Concentric-circle tree rooted at the uber-root (or per-root forests).
fn hierarchy_layout(
    world: &WorldStructure,
    locations: &[String],
    pinned: &HashMap<String, (f64, f64)>,
) -> LayoutResult {
    let mut layers: BTreeMap<String, Vec<PlacedLocation>> = BTreeMap::new();
    let mut by_layer: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for name in locations {
        let layer = world
            .location_layer_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| OVERWORLD_LAYER.to_string());
        by_layer.entry(layer).or_default().push(name);
    }

    for (layer_id, members) in by_layer {
        let (w, h) = layer_canvas(world, &layer_id);
        let center = (w / 2.0, h / 2.0);
        let max_radius = (w.min(h) / 2.0) - SAFE_MARGIN;

        // Depth = distance from a root in the parent forest.
        let mut depths: HashMap<&str, usize> = HashMap::new();
        let mut max_depth = 1usize;
        for name in &members {
            let depth = world.parent_chain(name).len().saturating_sub(1);
            depths.insert(name.as_str(), depth);
            max_depth = max_depth.max(depth.max(1));
        }

        let mut per_ring: HashMap<usize, Vec<&str>> = HashMap::new();
        for name in &members {
            per_ring
                .entry(*depths.get(name.as_str()).unwrap_or(&0))
                .or_default()
                .push(name.as_str());
        }

        let mut placements = Vec::new();
        for (depth, ring) in per_ring {
            let radius = if depth == 0 {
                0.0
            } else {
                max_radius * depth as f64 / max_depth as f64
            };
            let count = ring.len().max(1) as f64;
            for (idx, name) in ring.iter().enumerate() {
                let (x, y) = match pinned.get(*name) {
                    Some(xy) => *xy,
                    None => {
                        let angle = (idx as f64 / count) * std::f64::consts::TAU
                            + depth as f64 * 0.5;
                        (
                            center.0 + radius * angle.cos(),
                            center.1 + radius * angle.sin(),
                        )
                    }
                };
                placements.push(PlacedLocation {
                    name: (*name).to_string(),
                    x: x.clamp(SAFE_MARGIN, w - SAFE_MARGIN),
                    y: y.clamp(SAFE_MARGIN, h - SAFE_MARGIN),
                    radius: tier_radius(world.tier_of(name)),
                });
            }
        }
        placements.sort_by(|a, b| a.name.cmp(&b.name));
        layers.insert(layer_id, placements);
    }

    LayoutResult {
        mode: LayoutMode::Hierarchy,
        layers,
        geo_coords: None,
        dropped_constraints: Vec::new(),
    }
}

/// Geographic passthrough; unresolved names ride along next to their
/// nearest resolved neighbor.
fn geographic_result(
    locations: &[String],
    input: &LayoutInput,
    resolved: HashMap<String, (f64, f64)>,
) -> LayoutResult {
    let mut geo: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for (name, coords) in &resolved {
        geo.insert(name.clone(), *coords);
    }

    for name in locations {
        if geo.contains_key(name) {
            continue;
        }
        // Nearest resolved neighbor: prefer a constraint partner, else the
        // parent, else skip.
        let neighbor = input
            .constraints
            .iter()
            .filter_map(|c| {
                if &c.source == name {
                    resolved.get(&c.target)
                } else if &c.target == name {
                    resolved.get(&c.source)
                } else {
                    None
                }
            })
            .next()
            .or_else(|| {
                input
                    .world
                    .location_parents
                    .get(name)
                    .and_then(|p| resolved.get(p))
            });
        if let Some((lat, lng)) = neighbor {
            geo.insert(name.clone(), (lat + 0.02, lng + 0.02));
        }
    }

    LayoutResult {
        mode: LayoutMode::Geographic,
        layers: BTreeMap::new(),
        geo_coords: Some(geo),
        dropped_constraints: Vec::new(),
    }
}

/// All names the layout should place.
fn known_locations(world: &WorldStructure, constraints: &[SpatialConstraint]) -> Vec<String> {
    let mut names: HashSet<String> = world.known_locations().into_iter().collect();
    for constraint in constraints {
        names.insert(constraint.source.clone());
        names.insert(constraint.target.clone());
    }
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(
        source: &str,
        target: &str,
        value: &str,
        confidence: Confidence,
    ) -> SpatialConstraint {
        SpatialConstraint {
            source: source.into(),
            target: target.into(),
            kind: SpatialRelationType::Direction,
            value: value.into(),
            confidence,
            chapter: 1,
        }
    }

    #[test]
    fn test_direction_vector_rejects_unknown() {
        assert_eq!(direction_vector("north_of"), Some((0.0, 1.0)));
        assert_eq!(direction_vector("东南"), Some((1.0, -1.0)));
        assert_eq!(direction_vector("somewhere"), None);
    }

    #[test]
    fn test_conflicting_directions_drop_lower_confidence() {
        let constraints = vec![
            constraint("甲", "乙", "north_of", Confidence::High),
            constraint("乙", "甲", "north_of", Confidence::Low),
        ];
        let (kept, dropped) = drop_conflicts(constraints);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source, "甲");
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn test_consistent_mirrored_directions_are_kept() {
        let constraints = vec![
            constraint("甲", "乙", "north_of", Confidence::High),
            constraint("乙", "甲", "south_of", Confidence::Medium),
        ];
        let (kept, dropped) = drop_conflicts(constraints);
        assert_eq!(kept.len(), 2);
        assert!(dropped.is_empty());
    }

    #[test]
    fn test_narrative_distance_parses_days_walk() {
        let units = narrative_distance_units("三天路程", SpatialScale::National).unwrap();
        // 3 days * 30 km/day / 8 km-per-unit
        assert!((units - 11.25).abs() < 1e-9);
    }

    #[test]
    fn test_narrative_distance_terrain_factor() {
        let plain = narrative_distance_units("三天路程", SpatialScale::National).unwrap();
        let mountain = narrative_distance_units("三天山路", SpatialScale::National).unwrap();
        assert!(mountain < plain);
    }

    #[test]
    fn test_canvas_sizes_are_16_9() {
        for scale in [
            SpatialScale::Cosmic,
            SpatialScale::Continental,
            SpatialScale::National,
            SpatialScale::Urban,
            SpatialScale::Local,
        ] {
            let (w, h) = canvas_for(scale);
            assert!((w / h - 16.0 / 9.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_region_boxes_follow_cardinal_convention() {
        let mut world = WorldStructure::default();
        if let Some(layer) = world.layer_mut(OVERWORLD_LAYER) {
            layer.regions.push(crate::models::Region {
                name: "东胜神洲".into(),
                cardinal_direction: Some(CardinalDirection::East),
                region_type: "洲".into(),
                parent_region: None,
                description: String::new(),
            });
            layer.regions.push(crate::models::Region {
                name: "北俱芦洲".into(),
                cardinal_direction: Some(CardinalDirection::North),
                region_type: "洲".into(),
                parent_region: None,
                description: String::new(),
            });
        }
        let boxes = region_boxes(&world, OVERWORLD_LAYER, (1600.0, 900.0));
        let east = boxes.get("东胜神洲").unwrap();
        assert!(east.min_x >= 800.0, "east region must sit in the right half");
        let north = boxes.get("北俱芦洲").unwrap();
        assert!(north.min_y >= 450.0, "+y is north, so the north band is the upper half");
    }
}
