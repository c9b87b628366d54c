//! Progressive world-structure agent.
//!
//! Runs once per analyzed chapter, never blocking the analysis loop: the
//! orchestrator wraps the call in an exception barrier and reverts to the
//! last persisted snapshot on failure.
//!
//! Stage A scans the chapter text and fact for world-level signals with no
//! LLM involvement. Stage B always applies deterministic heuristics
//! (suffix tiers, parent-vote propagation, layer keywords, scale). Stage C
//! is a gated LLM call that answers with a closed operation vocabulary,
//! each operation applied in isolation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::{json_repair, LlmEngine, LlmRequest};
use crate::models::{
    CardinalDirection, ChapterFact, Confidence, LayerType, LocationTier, Portal, Region,
    SpatialRelationType, WorldStructure, UBER_ROOT,
};
use crate::utils::text::{char_count, truncate_chars};
use crate::FabulaError;

const EVIDENCE_CHARS: usize = 200;
/// Orphan count above which consolidation asks the LLM for help.
const ORPHAN_LLM_THRESHOLD: usize = 80;
const ORPHAN_BATCH: usize = 70;
const ORPHAN_MAX_CALLS: usize = 3;

// ============================================================================
// Reference tables
// ============================================================================

/// Suffix-to-tier reference table, longest suffix first. Unknown suffixes
/// fall back to `site`, never to `city`.
const SUFFIX_TIERS: &[(&str, LocationTier)] = &[
    ("大世界", LocationTier::World),
    ("大陆", LocationTier::Continent),
    ("神洲", LocationTier::Continent),
    ("王朝", LocationTier::Kingdom),
    ("帝国", LocationTier::Kingdom),
    ("皇朝", LocationTier::Kingdom),
    ("圣地", LocationTier::Region),
    ("山脉", LocationTier::Region),
    ("海域", LocationTier::Region),
    ("群岛", LocationTier::Region),
    ("地界", LocationTier::Region),
    ("草原", LocationTier::Region),
    ("沙漠", LocationTier::Region),
    ("平原", LocationTier::Region),
    ("盆地", LocationTier::Region),
    ("雪原", LocationTier::Region),
    ("冰原", LocationTier::Region),
    ("森林", LocationTier::Region),
    ("丛林", LocationTier::Region),
    ("沼泽", LocationTier::Region),
    ("都城", LocationTier::City),
    ("皇城", LocationTier::City),
    ("王城", LocationTier::City),
    ("京城", LocationTier::City),
    ("集市", LocationTier::Site),
    ("战场", LocationTier::Site),
    ("矿脉", LocationTier::Site),
    ("矿山", LocationTier::Site),
    ("码头", LocationTier::Site),
    ("渡口", LocationTier::Site),
    ("关隘", LocationTier::Site),
    ("要塞", LocationTier::Site),
    ("营地", LocationTier::Site),
    ("墓地", LocationTier::Site),
    ("陵墓", LocationTier::Site),
    ("祭坛", LocationTier::Building),
    ("广场", LocationTier::Site),
    ("庭院", LocationTier::Building),
    ("院落", LocationTier::Building),
    ("客栈", LocationTier::Building),
    ("酒楼", LocationTier::Building),
    ("茶楼", LocationTier::Building),
    ("铁匠铺", LocationTier::Building),
    ("药铺", LocationTier::Building),
    ("书院", LocationTier::Building),
    ("练功房", LocationTier::Room),
    ("藏书阁", LocationTier::Building),
    ("议事厅", LocationTier::Room),
    ("密室", LocationTier::Room),
    ("地牢", LocationTier::Room),
    ("寝宫", LocationTier::Room),
    ("卧房", LocationTier::Room),
    ("书房", LocationTier::Room),
    ("洲", LocationTier::Continent),
    ("界", LocationTier::Continent),
    ("域", LocationTier::Continent),
    ("国", LocationTier::Kingdom),
    ("朝", LocationTier::Kingdom),
    ("州", LocationTier::Region),
    ("郡", LocationTier::Region),
    ("境", LocationTier::Region),
    ("原", LocationTier::Region),
    ("漠", LocationTier::Region),
    ("城", LocationTier::City),
    ("都", LocationTier::City),
    ("京", LocationTier::City),
    ("镇", LocationTier::City),
    ("村", LocationTier::Site),
    ("寨", LocationTier::Site),
    ("庄", LocationTier::Site),
    ("山", LocationTier::Site),
    ("峰", LocationTier::Site),
    ("岭", LocationTier::Site),
    ("崖", LocationTier::Site),
    ("谷", LocationTier::Site),
    ("湖", LocationTier::Site),
    ("河", LocationTier::Site),
    ("江", LocationTier::Site),
    ("海", LocationTier::Site),
    ("潭", LocationTier::Site),
    ("泉", LocationTier::Site),
    ("岛", LocationTier::Site),
    ("林", LocationTier::Site),
    ("园", LocationTier::Site),
    ("门", LocationTier::Site),
    ("派", LocationTier::Site),
    ("宗", LocationTier::Site),
    ("帮", LocationTier::Site),
    ("教", LocationTier::Site),
    ("洞", LocationTier::Site),
    ("窟", LocationTier::Site),
    ("穴", LocationTier::Site),
    ("府", LocationTier::Site),
    ("宫", LocationTier::Building),
    ("殿", LocationTier::Building),
    ("楼", LocationTier::Building),
    ("塔", LocationTier::Building),
    ("阁", LocationTier::Building),
    ("堂", LocationTier::Building),
    ("馆", LocationTier::Building),
    ("庙", LocationTier::Building),
    ("寺", LocationTier::Building),
    ("观", LocationTier::Building),
    ("亭", LocationTier::Building),
    ("桥", LocationTier::Building),
    ("房", LocationTier::Room),
    ("室", LocationTier::Room),
    ("厅", LocationTier::Room),
    ("间", LocationTier::Room),
    ("窖", LocationTier::Room),
];

/// Name fragments that place a location on a non-overworld layer.
const LAYER_KEYWORDS: &[(&str, LayerType, &str)] = &[
    ("天宫", LayerType::Celestial, "celestial"),
    ("天庭", LayerType::Celestial, "celestial"),
    ("凌霄", LayerType::Celestial, "celestial"),
    ("天界", LayerType::Celestial, "celestial"),
    ("仙界", LayerType::Celestial, "celestial"),
    ("九重天", LayerType::Celestial, "celestial"),
    ("地府", LayerType::Underworld, "underworld"),
    ("冥界", LayerType::Underworld, "underworld"),
    ("幽冥", LayerType::Underworld, "underworld"),
    ("黄泉", LayerType::Underworld, "underworld"),
    ("阴间", LayerType::Underworld, "underworld"),
    ("酆都", LayerType::Underworld, "underworld"),
    ("海底", LayerType::Underwater, "underwater"),
    ("龙宫", LayerType::Underwater, "underwater"),
    ("水府", LayerType::Underwater, "underwater"),
    ("秘境", LayerType::Instance, "instance"),
    ("遗迹", LayerType::Instance, "instance"),
    ("试炼之地", LayerType::Instance, "instance"),
    ("小世界", LayerType::Pocket, "pocket"),
    ("洞天", LayerType::Pocket, "pocket"),
    ("芥子", LayerType::Pocket, "pocket"),
];

/// Genre keywords voting for the cosmic end of the scale.
const COSMIC_GENRE_HINTS: &[&str] = &["修仙", "修真", "仙侠", "洪荒", "诸天", "飞升"];

fn region_division_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(分为|划为|分成|共分)([^。！？\n]{2,60})").ok())
        .as_ref()
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    RegionDivision,
    LayerTransition(LayerType),
    InstanceEntry,
    NewMacroLocation(String),
}

#[derive(Debug, Clone)]
pub struct WorldSignal {
    pub kind: SignalKind,
    pub confidence: Confidence,
    pub evidence: String,
}

/// Scan chapter text and fact for world-level cues. No LLM.
pub fn scan_signals(
    chapter_text: &str,
    fact: &ChapterFact,
    structure: &WorldStructure,
) -> Vec<WorldSignal> {
    let mut signals = Vec::new();

    if let Some(re) = region_division_re() {
        if let Some(m) = re.find(chapter_text) {
            signals.push(WorldSignal {
                kind: SignalKind::RegionDivision,
                confidence: Confidence::High,
                evidence: excerpt(chapter_text, m.start(), EVIDENCE_CHARS),
            });
        }
    }

    for (keyword, layer_type, _) in LAYER_KEYWORDS {
        if let Some(pos) = chapter_text.find(keyword) {
            let kind = if *layer_type == LayerType::Instance {
                SignalKind::InstanceEntry
            } else {
                SignalKind::LayerTransition(*layer_type)
            };
            if !signals.iter().any(|s| s.kind == kind) {
                signals.push(WorldSignal {
                    kind,
                    confidence: Confidence::Medium,
                    evidence: excerpt(chapter_text, pos, EVIDENCE_CHARS),
                });
            }
        }
    }

    for location in &fact.locations {
        let tier = effective_tier(location.name.as_str(), location.tier);
        if tier.rank() <= LocationTier::Region.rank()
            && !structure.location_tiers.contains_key(&location.name)
        {
            signals.push(WorldSignal {
                kind: SignalKind::NewMacroLocation(location.name.clone()),
                confidence: Confidence::Medium,
                evidence: truncate_chars(&location.description, EVIDENCE_CHARS).to_string(),
            });
        }
    }

    for declaration in &fact.world_declarations {
        let kind = match declaration.declaration_type {
            crate::models::DeclarationType::RegionDivision
            | crate::models::DeclarationType::RegionPosition => SignalKind::RegionDivision,
            crate::models::DeclarationType::LayerExists => {
                SignalKind::LayerTransition(LayerType::Celestial)
            }
            crate::models::DeclarationType::Portal => SignalKind::InstanceEntry,
        };
        signals.push(WorldSignal {
            kind,
            confidence: declaration.confidence,
            evidence: truncate_chars(&declaration.narrative_evidence, EVIDENCE_CHARS).to_string(),
        });
    }

    signals
}

/// Tier from the fact when the model committed to one, else by suffix.
fn effective_tier(name: &str, fact_tier: LocationTier) -> LocationTier {
    if fact_tier != LocationTier::Site {
        return fact_tier;
    }
    suffix_tier(name)
}

/// Longest-suffix lookup; unknown falls back to `site`.
pub fn suffix_tier(name: &str) -> LocationTier {
    for (suffix, tier) in SUFFIX_TIERS {
        if name.ends_with(suffix) {
            return *tier;
        }
    }
    LocationTier::Site
}

fn layer_for_name(name: &str) -> Option<(&'static str, LayerType)> {
    LAYER_KEYWORDS
        .iter()
        .find(|(keyword, _, _)| name.contains(keyword))
        .map(|(_, layer_type, layer_id)| (*layer_id, *layer_type))
}

fn excerpt(text: &str, byte_pos: usize, max_chars: usize) -> String {
    let start = text[..byte_pos]
        .char_indices()
        .rev()
        .take(20)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(byte_pos);
    truncate_chars(&text[start..], max_chars).to_string()
}

// ============================================================================
// Agent
// ============================================================================

pub struct WorldAgent {
    llm: Arc<dyn LlmEngine>,
}

impl WorldAgent {
    pub fn new(llm: Arc<dyn LlmEngine>) -> Self {
        WorldAgent { llm }
    }

    /// Observe one analyzed chapter.
    ///
    /// `recent_facts` are the trailing already-persisted facts (newest last),
    /// used for co-location parenting; the current chapter's fact is passed
    /// separately.
    pub async fn observe_chapter(
        &self,
        structure: &mut WorldStructure,
        chapter_num: u32,
        chapter_text: &str,
        fact: &ChapterFact,
        recent_facts: &[(u32, ChapterFact)],
    ) -> Result<(), FabulaError> {
        let signals = scan_signals(chapter_text, fact, structure);
        let new_macro_count = signals
            .iter()
            .filter(|s| matches!(s.kind, SignalKind::NewMacroLocation(_)))
            .count();
        // Judged against the structure as it stood when the signal fired,
        // not after the heuristics already added the layer.
        let absent_layer_transition = signals.iter().any(|s| match &s.kind {
            SignalKind::LayerTransition(layer_type) => !structure
                .layers
                .iter()
                .any(|l| l.layer_type == *layer_type),
            _ => false,
        });

        apply_heuristics(structure, fact, recent_facts, chapter_num, chapter_text);
        let triggered = chapter_num <= 5
            || signals
                .iter()
                .any(|s| s.kind == SignalKind::RegionDivision)
            || absent_layer_transition
            || new_macro_count >= 2
            || chapter_num % 20 == 0;

        if triggered {
            self.llm_delta(structure, &signals, fact, chapter_num).await?;
        }
        Ok(())
    }

    /// Stage C: ask the LLM for a delta as a closed list of operations.
    async fn llm_delta(
        &self,
        structure: &mut WorldStructure,
        signals: &[WorldSignal],
        fact: &ChapterFact,
        chapter_num: u32,
    ) -> Result<(), FabulaError> {
        let summary = summarize_structure(structure);
        let signal_lines: Vec<String> = signals
            .iter()
            .map(|s| format!("- {:?}: {}", s.kind, s.evidence))
            .collect();
        let locations: Vec<String> = fact
            .locations
            .iter()
            .map(|l| format!("{}({})", l.name, l.kind))
            .collect();
        let spatial: Vec<String> = fact
            .spatial_relationships
            .iter()
            .map(|s| format!("{} -{:?}/{}- {}", s.source, s.relation_type, s.value, s.target))
            .collect();

        let prompt = format!(
            "当前世界结构：\n{summary}\n\n本章（第{chapter_num}章）信号：\n{}\n\n本章地点：{}\n空间关系：{}\n\n\
请输出需要对世界结构做的增量修改，JSON 格式：\n\
{{\"operations\":[{{\"op\":\"ADD_REGION|ADD_LAYER|ADD_PORTAL|ASSIGN_LOCATION|UPDATE_REGION|SET_TIER|SET_ICON|NO_CHANGE\", ...}}]}}\n\
字段约定：ADD_REGION{{name,cardinal_direction(east/west/south/north/center),region_type,description}}；\
ADD_LAYER{{layer_id,name,layer_type(celestial/underworld/underwater/instance/pocket)}}；\
ADD_PORTAL{{name,source_layer,source_location,target_layer,target_location,is_bidirectional}}；\
ASSIGN_LOCATION{{name,region,layer,parent}}；UPDATE_REGION{{name,cardinal_direction,description}}；\
SET_TIER{{name,tier(world/continent/kingdom/region/city/site/building/room)}}；SET_ICON{{name,icon}}。\
没有修改时输出 NO_CHANGE。只依据信号与原文证据，不要虚构。",
            signal_lines.join("\n"),
            locations.join("、"),
            spatial.join("；"),
        );

        let reply = self
            .llm
            .generate(LlmRequest::new(
                "你是小说世界结构维护助手，只输出 JSON。",
                prompt,
            ))
            .await?;
        let value = json_repair::extract_json(&reply.content)?;

        #[derive(Deserialize)]
        struct OpList {
            #[serde(default)]
            operations: Vec<serde_json::Value>,
        }
        let decoded: OpList = serde_json::from_value(value)?;
        for raw_op in decoded.operations {
            // Partial failure is non-fatal: each operation applies alone.
            match serde_json::from_value::<WorldOp>(raw_op.clone()) {
                Ok(op) => {
                    if let Err(e) = apply_op(structure, op, chapter_num) {
                        warn!(error = %e, "world op rejected");
                    }
                }
                Err(e) => {
                    debug!(error = %e, op = %raw_op, "undecodable world op skipped");
                }
            }
        }
        Ok(())
    }

    /// Periodic hierarchy consolidation: adopt orphans into the dominant
    /// intermediate node, and ask the LLM for help when the orphan count is
    /// unreasonable.
    pub async fn consolidate(&self, structure: &mut WorldStructure) -> Result<(), FabulaError> {
        adopt_orphans(structure);

        let orphans = structure.orphans();
        if orphans.len() > ORPHAN_LLM_THRESHOLD {
            self.llm_orphan_review(structure, orphans).await?;
        }
        Ok(())
    }

    async fn llm_orphan_review(
        &self,
        structure: &mut WorldStructure,
        orphans: Vec<String>,
    ) -> Result<(), FabulaError> {
        let known_parents: Vec<String> = structure
            .location_parents
            .values()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut prior_assignments: Vec<String> = Vec::new();

        for (call, batch) in orphans.chunks(ORPHAN_BATCH).take(ORPHAN_MAX_CALLS).enumerate() {
            let prompt = format!(
                "以下孤立地点尚无归属。已知可作为上级的地点：{}。\n{}\n\
孤立地点：{}\n输出 JSON：{{\"assignments\":[{{\"name\":\"地点\",\"parent\":\"上级地点\"}}]}}，\
不确定的地点省略。",
                known_parents.join("、"),
                if prior_assignments.is_empty() {
                    String::new()
                } else {
                    format!("之前批次已确定：{}。", prior_assignments.join("、"))
                },
                batch.join("、"),
            );
            let reply = match self
                .llm
                .generate(LlmRequest::new(
                    "你是小说地理层级整理助手，只输出 JSON。",
                    prompt,
                ))
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(call, error = %e, "orphan review call failed");
                    break;
                }
            };

            #[derive(Deserialize)]
            struct Assignments {
                #[serde(default)]
                assignments: Vec<Assignment>,
            }
            #[derive(Deserialize)]
            struct Assignment {
                name: String,
                parent: String,
            }
            let Ok(value) = json_repair::extract_json(&reply.content) else {
                continue;
            };
            let Ok(decoded) = serde_json::from_value::<Assignments>(value) else {
                continue;
            };
            for assignment in decoded.assignments {
                if structure.location_parents.contains_key(&assignment.name) {
                    continue;
                }
                if structure.set_parent(&assignment.name, &assignment.parent).is_ok() {
                    prior_assignments.push(format!("{}→{}", assignment.name, assignment.parent));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Stage B heuristics
// ============================================================================

fn apply_heuristics(
    structure: &mut WorldStructure,
    fact: &ChapterFact,
    recent_facts: &[(u32, ChapterFact)],
    _chapter_num: u32,
    chapter_text: &str,
) {
    // Tiers and icons.
    for location in &fact.locations {
        let tier = effective_tier(&location.name, location.tier);
        structure
            .location_tiers
            .entry(location.name.clone())
            .or_insert(tier);
        if let Some(icon) = &location.icon_hint {
            structure
                .location_icons
                .entry(location.name.clone())
                .or_insert_with(|| icon.clone());
        }
    }

    // Parent votes. Explicit declarations weigh 2, neighbor propagation 1.
    let mut votes: HashMap<String, HashMap<String, u32>> = HashMap::new();
    let vote = |votes: &mut HashMap<String, HashMap<String, u32>>,
                    child: &str,
                    parent: &str,
                    weight: u32| {
        if child != parent && !child.is_empty() && !parent.is_empty() {
            *votes
                .entry(child.to_string())
                .or_default()
                .entry(parent.to_string())
                .or_default() += weight;
        }
    };

    for location in &fact.locations {
        if let Some(parent) = &location.parent {
            vote(&mut votes, &location.name, parent, 2);
        }
    }
    for spatial in &fact.spatial_relationships {
        if spatial.relation_type == SpatialRelationType::Contains {
            vote(&mut votes, &spatial.target, &spatial.source, 2);
        }
    }

    apply_votes(structure, &votes);

    // Neighbor propagation: an adjacent/direction endpoint inherits the
    // other side's parent. At most two rounds; set_parent rejects cycles.
    for _round in 0..2 {
        let mut round_votes: HashMap<String, HashMap<String, u32>> = HashMap::new();
        for spatial in &fact.spatial_relationships {
            let (a, b) = (spatial.source.as_str(), spatial.target.as_str());
            match spatial.relation_type {
                SpatialRelationType::Adjacent | SpatialRelationType::Direction => {
                    if let Some(parent) = structure.location_parents.get(a) {
                        let parent = parent.clone();
                        vote(&mut round_votes, b, &parent, 1);
                    }
                    if let Some(parent) = structure.location_parents.get(b) {
                        let parent = parent.clone();
                        vote(&mut round_votes, a, &parent, 1);
                    }
                }
                SpatialRelationType::InBetween => {
                    // The in-between triple shares a parent.
                    let third = spatial.value.as_str();
                    let names = [a, b, third];
                    let known: Vec<&str> = names
                        .iter()
                        .filter_map(|n| structure.location_parents.get(*n).map(String::as_str))
                        .collect();
                    if let Some(shared) = known.first() {
                        let shared = shared.to_string();
                        for name in names {
                            if !structure.location_parents.contains_key(name) {
                                vote(&mut round_votes, name, &shared, 1);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if round_votes.is_empty() {
            break;
        }
        apply_votes(structure, &round_votes);
    }

    // Scene-transition siblings: tier-compatible stops on one character's
    // same-chapter path share a parent when one side already has one.
    let mut sibling_votes: HashMap<String, HashMap<String, u32>> = HashMap::new();
    for character in &fact.characters {
        for pair in character.locations_in_chapter.windows(2) {
            let (a, b) = (pair[0].as_str(), pair[1].as_str());
            let tier_a = structure.tier_of(a).rank();
            let tier_b = structure.tier_of(b).rank();
            if tier_a.abs_diff(tier_b) <= 1 {
                if let Some(parent) = structure.location_parents.get(a) {
                    let parent = parent.clone();
                    vote(&mut sibling_votes, b, &parent, 1);
                }
                if let Some(parent) = structure.location_parents.get(b) {
                    let parent = parent.clone();
                    vote(&mut sibling_votes, a, &parent, 1);
                }
            }
        }
    }
    apply_votes(structure, &sibling_votes);

    // Co-location: a character seen in the same macro location across >=3
    // consecutive chapters pulls the fine locations they visit under it.
    let mut coloc_votes: HashMap<String, HashMap<String, u32>> = HashMap::new();
    if recent_facts.len() >= 2 {
        let mut windows: Vec<&ChapterFact> = recent_facts.iter().map(|(_, f)| f).collect();
        windows.push(fact);
        let mut presence: HashMap<(&str, &str), u32> = HashMap::new();
        for chapter_fact in &windows {
            for character in &chapter_fact.characters {
                for loc in &character.locations_in_chapter {
                    let tier = structure.tier_of(loc);
                    if matches!(
                        tier,
                        LocationTier::Region | LocationTier::Kingdom | LocationTier::City
                    ) {
                        *presence
                            .entry((character.name.as_str(), loc.as_str()))
                            .or_default() += 1;
                    }
                }
            }
        }
        for ((person, macro_loc), count) in presence {
            if count < 3 {
                continue;
            }
            let macro_rank = structure.tier_of(macro_loc).rank();
            for character in &fact.characters {
                if character.name != person {
                    continue;
                }
                for loc in &character.locations_in_chapter {
                    let rank = structure.tier_of(loc).rank();
                    if loc != macro_loc
                        && rank >= LocationTier::Site.rank()
                        && rank.abs_diff(macro_rank) >= 2
                        && !structure.location_parents.contains_key(loc)
                    {
                        vote(&mut coloc_votes, loc, macro_loc, count.min(5));
                    }
                }
            }
        }
    }
    apply_votes(structure, &coloc_votes);

    // Layer assignment by name keywords.
    for location in &fact.locations {
        if let Some((layer_id, layer_type)) = layer_for_name(&location.name) {
            structure.ensure_layer(layer_id, layer_cn_name(layer_type), layer_type);
            structure
                .location_layer_map
                .entry(location.name.clone())
                .or_insert_with(|| layer_id.to_string());
        }
    }

    detect_scale(structure, chapter_text);
}

fn apply_votes(structure: &mut WorldStructure, votes: &HashMap<String, HashMap<String, u32>>) {
    for (child, parents) in votes {
        if structure.location_parents.contains_key(child) {
            continue;
        }
        let mut ranked: Vec<(&String, &u32)> = parents.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        if let Some((parent, _)) = ranked.first() {
            if let Err(e) = structure.set_parent(child, parent) {
                debug!(child, parent = %parent, error = %e, "parent vote rejected");
            }
        }
    }
}

fn layer_cn_name(layer_type: LayerType) -> &'static str {
    match layer_type {
        LayerType::Overworld => "主世界",
        LayerType::Celestial => "天界",
        LayerType::Underworld => "冥界",
        LayerType::Underwater => "水下世界",
        LayerType::Instance => "秘境",
        LayerType::Pocket => "洞天",
    }
}

/// Infer the spatial scale from genre keywords and the tier histogram.
fn detect_scale(structure: &mut WorldStructure, chapter_text: &str) {
    use crate::models::SpatialScale;

    if structure.novel_genre_hint.is_none() {
        if let Some(hint) = COSMIC_GENRE_HINTS
            .iter()
            .find(|k| chapter_text.contains(*k))
        {
            structure.novel_genre_hint = Some((*hint).to_string());
        }
    }

    let mut histogram: BTreeMap<u8, usize> = BTreeMap::new();
    for tier in structure.location_tiers.values() {
        *histogram.entry(tier.rank()).or_default() += 1;
    }
    let has = |rank: u8| histogram.get(&rank).copied().unwrap_or(0);

    let multiple_layers = structure.layers.len() > 1;
    structure.spatial_scale = if multiple_layers
        || has(LocationTier::World.rank()) > 0
        || (structure.novel_genre_hint.is_some() && has(LocationTier::Continent.rank()) > 0)
    {
        SpatialScale::Cosmic
    } else if has(LocationTier::Continent.rank()) > 0 {
        SpatialScale::Continental
    } else if has(LocationTier::Kingdom.rank()) > 0 || has(LocationTier::Region.rank()) > 1 {
        SpatialScale::National
    } else if has(LocationTier::City.rank()) > 0 {
        SpatialScale::Urban
    } else {
        SpatialScale::Local
    };
}

// ============================================================================
// Stage C operations
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "op")]
enum WorldOp {
    #[serde(rename = "ADD_REGION")]
    AddRegion {
        name: String,
        #[serde(default)]
        layer_id: Option<String>,
        #[serde(default)]
        cardinal_direction: Option<String>,
        #[serde(default)]
        region_type: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename = "ADD_LAYER")]
    AddLayer {
        layer_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        layer_type: Option<LayerType>,
    },
    #[serde(rename = "ADD_PORTAL")]
    AddPortal {
        name: String,
        source_layer: String,
        source_location: String,
        target_layer: String,
        target_location: String,
        #[serde(default)]
        is_bidirectional: Option<bool>,
    },
    #[serde(rename = "ASSIGN_LOCATION")]
    AssignLocation {
        name: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        layer: Option<String>,
        #[serde(default)]
        parent: Option<String>,
    },
    #[serde(rename = "UPDATE_REGION")]
    UpdateRegion {
        name: String,
        #[serde(default)]
        cardinal_direction: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename = "SET_TIER")]
    SetTier { name: String, tier: LocationTier },
    #[serde(rename = "SET_ICON")]
    SetIcon { name: String, icon: String },
    #[serde(rename = "NO_CHANGE")]
    NoChange,
}

fn parse_direction(s: &str) -> Option<CardinalDirection> {
    match s {
        "east" | "东" | "东方" => Some(CardinalDirection::East),
        "west" | "西" | "西方" => Some(CardinalDirection::West),
        "south" | "南" | "南方" => Some(CardinalDirection::South),
        "north" | "北" | "北方" => Some(CardinalDirection::North),
        "center" | "中" | "中央" => Some(CardinalDirection::Center),
        _ => None,
    }
}

fn apply_op(
    structure: &mut WorldStructure,
    op: WorldOp,
    chapter_num: u32,
) -> Result<(), FabulaError> {
    match op {
        WorldOp::AddRegion {
            name,
            layer_id,
            cardinal_direction,
            region_type,
            description,
        } => {
            let layer = layer_id.unwrap_or_else(|| crate::models::OVERWORLD_LAYER.to_string());
            structure.upsert_region(
                &layer,
                Region {
                    name,
                    cardinal_direction: cardinal_direction.as_deref().and_then(parse_direction),
                    region_type: region_type.unwrap_or_default(),
                    parent_region: None,
                    description: description.unwrap_or_default(),
                },
            );
            Ok(())
        }
        WorldOp::AddLayer {
            layer_id,
            name,
            layer_type,
        } => {
            let layer_type = layer_type.unwrap_or(LayerType::Instance);
            let name = name.unwrap_or_else(|| layer_cn_name(layer_type).to_string());
            structure.ensure_layer(&layer_id, &name, layer_type);
            Ok(())
        }
        WorldOp::AddPortal {
            name,
            source_layer,
            source_location,
            target_layer,
            target_location,
            is_bidirectional,
        } => structure.add_portal(Portal {
            name,
            source_layer,
            source_location,
            target_layer,
            target_location,
            is_bidirectional: is_bidirectional.unwrap_or(true),
            first_chapter: chapter_num,
        }),
        WorldOp::AssignLocation {
            name,
            region,
            layer,
            parent,
        } => {
            if let Some(region) = region {
                structure.location_region_map.insert(name.clone(), region);
            }
            if let Some(layer) = layer {
                if !structure.has_layer(&layer) {
                    return Err(FabulaError::Validation(format!(
                        "ASSIGN_LOCATION references unknown layer '{layer}'"
                    )));
                }
                structure.location_layer_map.insert(name.clone(), layer);
            }
            if let Some(parent) = parent {
                structure.set_parent(&name, &parent)?;
            }
            Ok(())
        }
        WorldOp::UpdateRegion {
            name,
            cardinal_direction,
            description,
        } => {
            for layer in &mut structure.layers {
                if let Some(region) = layer.regions.iter_mut().find(|r| r.name == name) {
                    if let Some(direction) = cardinal_direction.as_deref().and_then(parse_direction)
                    {
                        region.cardinal_direction = Some(direction);
                    }
                    if let Some(description) = &description {
                        region.description = description.clone();
                    }
                }
            }
            Ok(())
        }
        WorldOp::SetTier { name, tier } => {
            structure.location_tiers.insert(name, tier);
            Ok(())
        }
        WorldOp::SetIcon { name, icon } => {
            structure.location_icons.insert(name, icon);
            Ok(())
        }
        WorldOp::NoChange => Ok(()),
    }
}

/// Structure summary for the delta prompt, capped well under 2000 tokens.
fn summarize_structure(structure: &WorldStructure) -> String {
    let mut s = String::new();
    for layer in &structure.layers {
        s.push_str(&format!("层 {}（{:?}）", layer.layer_id, layer.layer_type));
        if !layer.regions.is_empty() {
            let regions: Vec<String> = layer
                .regions
                .iter()
                .map(|r| match r.cardinal_direction {
                    Some(d) => format!("{}:{:?}", r.name, d),
                    None => r.name.clone(),
                })
                .collect();
            s.push_str(&format!(" 区域[{}]", regions.join("、")));
        }
        s.push('\n');
    }
    for portal in &structure.portals {
        s.push_str(&format!(
            "通道 {}: {}→{}\n",
            portal.name, portal.source_layer, portal.target_layer
        ));
    }
    let assignments: Vec<String> = structure
        .location_region_map
        .iter()
        .take(50)
        .map(|(loc, region)| format!("{loc}∈{region}"))
        .collect();
    if !assignments.is_empty() {
        s.push_str(&assignments.join("、"));
        s.push('\n');
    }
    if char_count(&s) > 3_000 {
        return truncate_chars(&s, 3_000).to_string();
    }
    s
}

// ============================================================================
// Consolidation heuristics
// ============================================================================

/// Adopt orphans: site/building orphans go to the dominant intermediate
/// node (substring-name matches preferred); city-rank or coarser orphans go
/// directly under the synthetic uber-root. Unmatched fine orphans stay as
/// independent roots.
fn adopt_orphans(structure: &mut WorldStructure) {
    let orphans = structure.orphans();
    if orphans.is_empty() {
        return;
    }

    // Descendant counts per node.
    let mut descendants: HashMap<String, usize> = HashMap::new();
    for child in structure.location_parents.keys() {
        let mut cursor = child.clone();
        let mut hops = 0;
        while let Some(parent) = structure.location_parents.get(&cursor) {
            *descendants.entry(parent.clone()).or_default() += 1;
            cursor = parent.clone();
            hops += 1;
            if hops > structure.location_parents.len() {
                break;
            }
        }
    }
    let dominant = descendants
        .iter()
        .filter(|(name, count)| **count >= 3 && *name != UBER_ROOT)
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(name, _)| name.clone());

    let candidates: Vec<String> = descendants
        .keys()
        .filter(|n| *n != UBER_ROOT)
        .cloned()
        .collect();

    for orphan in orphans {
        let rank = structure.tier_of(&orphan).rank();
        if rank <= LocationTier::City.rank() {
            // Coarse orphans hang off the uber-root so the tree stays rooted.
            let _ = structure.set_parent(&orphan, UBER_ROOT);
            continue;
        }
        // Prefer a node whose name the orphan extends ("落日峰主殿" → "落日峰").
        let by_name = candidates
            .iter()
            .filter(|c| orphan.contains(c.as_str()) && **c != orphan)
            .max_by_key(|c| c.chars().count());
        if let Some(parent) = by_name {
            let parent = parent.clone();
            let _ = structure.set_parent(&orphan, &parent);
            continue;
        }
        if let Some(parent) = &dominant {
            let _ = structure.set_parent(&orphan, parent);
        }
        // No dominant node: the orphan stays an independent root.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_tier_longest_match_wins() {
        assert_eq!(suffix_tier("乱星山脉"), LocationTier::Region);
        assert_eq!(suffix_tier("彩霞山"), LocationTier::Site);
        assert_eq!(suffix_tier("天南大陆"), LocationTier::Continent);
        assert_eq!(suffix_tier("越国"), LocationTier::Kingdom);
        assert_eq!(suffix_tier("青牛镇"), LocationTier::City);
        assert_eq!(suffix_tier("不知名地点"), LocationTier::Site);
    }

    #[test]
    fn test_region_division_signal() {
        let fact = ChapterFact::default();
        let structure = WorldStructure::default();
        let signals = scan_signals("世界之间遂分为四大部洲。", &fact, &structure);
        assert!(signals
            .iter()
            .any(|s| s.kind == SignalKind::RegionDivision));
    }

    #[test]
    fn test_layer_transition_signal() {
        let fact = ChapterFact::default();
        let structure = WorldStructure::default();
        let signals = scan_signals("他一路升入天庭，直抵凌霄宝殿。", &fact, &structure);
        assert!(signals
            .iter()
            .any(|s| matches!(s.kind, SignalKind::LayerTransition(LayerType::Celestial))));
    }

    #[test]
    fn test_orphan_adoption_by_name_overlap() {
        let mut structure = WorldStructure::default();
        structure
            .location_tiers
            .insert("落日峰".into(), LocationTier::Site);
        structure
            .location_tiers
            .insert("落日峰主殿".into(), LocationTier::Building);
        for child in ["炼丹房", "藏宝阁", "演武坪"] {
            structure.location_tiers.insert(child.into(), LocationTier::Building);
            structure.set_parent(child, "落日峰").unwrap();
        }
        adopt_orphans(&mut structure);
        assert_eq!(
            structure.location_parents.get("落日峰主殿").map(String::as_str),
            Some("落日峰")
        );
    }

    #[test]
    fn test_coarse_orphans_go_to_uber_root() {
        let mut structure = WorldStructure::default();
        structure
            .location_tiers
            .insert("越国".into(), LocationTier::Kingdom);
        adopt_orphans(&mut structure);
        assert_eq!(
            structure.location_parents.get("越国").map(String::as_str),
            Some(UBER_ROOT)
        );
    }

    #[test]
    fn test_apply_op_rejects_bad_portal() {
        let mut structure = WorldStructure::default();
        let op = WorldOp::AddPortal {
            name: "鬼门关".into(),
            source_layer: "overworld".into(),
            source_location: "酆都城".into(),
            target_layer: "underworld".into(),
            target_location: "奈何桥".into(),
            is_bidirectional: None,
        };
        assert!(apply_op(&mut structure, op, 7).is_err());
        assert!(structure.portals.is_empty());
    }

    #[test]
    fn test_scale_detection_prefers_cosmic_for_layered_worlds() {
        let mut structure = WorldStructure::default();
        structure.ensure_layer("celestial", "天界", LayerType::Celestial);
        detect_scale(&mut structure, "他继续修仙。");
        assert_eq!(structure.spatial_scale, crate::models::SpatialScale::Cosmic);
    }
}
