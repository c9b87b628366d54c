//! The ChapterFact tree: the structured extraction product for one chapter.
//!
//! This is the atomic unit of analysis. The whole tree is serialized as a
//! single JSON value per (novel, chapter) and every downstream view (profiles,
//! graph, timeline, map) is a reduction over these records.
//!
//! Enum fields returned by the LLM are *clamped*: an unknown string decodes
//! to the documented default variant instead of failing the whole chapter.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

// ============================================================================
// Clamped enumerations
// ============================================================================

/// Extraction confidence reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    High,
    #[default]
    #[serde(other)]
    Medium,
}

impl Confidence {
    /// Low < Medium < High, independent of enum declaration order (which is
    /// constrained by `#[serde(other)]` needing to be the last variant).
    fn rank(self) -> u8 {
        match self {
            Confidence::Low => 0,
            Confidence::Medium => 1,
            Confidence::High => 2,
        }
    }
}

impl PartialOrd for Confidence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Confidence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Narrative importance of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Low,
    #[default]
    #[serde(other)]
    Medium,
}

/// Granularity class of a location, from whole worlds down to single rooms.
///
/// Controls visibility at map zoom levels and drives the parent-adoption
/// heuristics (rank distance, orphan adoption thresholds).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LocationTier {
    World,
    Continent,
    Kingdom,
    Region,
    City,
    Building,
    Room,
    #[serde(other)]
    Site,
}

impl Default for LocationTier {
    fn default() -> Self {
        // Unknown granularity falls back to site, never to city.
        LocationTier::Site
    }
}

impl LocationTier {
    /// Rank from coarse (0 = world) to fine (7 = room).
    pub fn rank(self) -> u8 {
        match self {
            LocationTier::World => 0,
            LocationTier::Continent => 1,
            LocationTier::Kingdom => 2,
            LocationTier::Region => 3,
            LocationTier::City => 4,
            LocationTier::Site => 5,
            LocationTier::Building => 6,
            LocationTier::Room => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LocationTier::World => "world",
            LocationTier::Continent => "continent",
            LocationTier::Kingdom => "kingdom",
            LocationTier::Region => "region",
            LocationTier::City => "city",
            LocationTier::Site => "site",
            LocationTier::Building => "building",
            LocationTier::Room => "room",
        }
    }
}

/// How a location figures in the chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationRole {
    /// Mentioned but not visited.
    Referenced,
    /// A character's place of origin.
    Origin,
    /// The scene takes place here.
    #[default]
    #[serde(other)]
    Setting,
}

/// Dimension of a gained ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbilityDimension {
    /// Cultivation realm / power level.
    Realm,
    /// Social identity (titles, offices, discipleships).
    Identity,
    #[default]
    #[serde(other)]
    Skill,
}

/// What happened to an item in this chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Obtain,
    Use,
    Gift,
    Consume,
    Lose,
    Destroy,
    #[default]
    #[serde(other)]
    Appear,
}

/// Membership change within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrgAction {
    Leave,
    Promote,
    Die,
    Defect,
    Expel,
    #[default]
    #[serde(other)]
    Join,
}

/// Coarse category of a chapter event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Combat,
    Growth,
    Social,
    Travel,
    #[default]
    #[serde(other)]
    Other,
}

/// Kind of a spatial relationship between two locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpatialRelationType {
    Distance,
    Contains,
    Adjacent,
    SeparatedBy,
    Terrain,
    InBetween,
    #[default]
    #[serde(other)]
    Direction,
}

/// Kind of a world-level declaration the narration makes explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationType {
    LayerExists,
    Portal,
    RegionPosition,
    #[default]
    #[serde(other)]
    RegionDivision,
}

// ============================================================================
// Fact records
// ============================================================================

/// An ability gained by a character in this chapter.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AbilityGain {
    #[serde(default)]
    pub dimension: AbilityDimension,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One character observed in the chapter, under its canonical name.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CharacterFact {
    /// Canonical name (the dictionary's primary name when an alias appears).
    pub name: String,
    /// Aliases first observed in this chapter.
    #[serde(default)]
    pub new_aliases: Vec<String>,
    pub appearance: Option<String>,
    #[serde(default)]
    pub abilities_gained: Vec<AbilityGain>,
    /// Names of locations this character visited in this chapter.
    #[serde(default)]
    pub locations_in_chapter: Vec<String>,
}

/// A relationship observation between two people.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RelationshipFact {
    pub person_a: String,
    pub person_b: String,
    /// Free-text relation ("师徒", "仇人", "结拜兄弟").
    pub relation_type: String,
    #[serde(default)]
    pub is_new: bool,
    pub previous_type: Option<String>,
    /// Supporting quote, truncated to ~50 chars by the validator.
    #[serde(default)]
    pub evidence: String,
    /// Downgraded to `Low` when neither endpoint is a known character.
    #[serde(default)]
    pub confidence: Confidence,
}

/// A location observed or referenced in the chapter.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LocationFact {
    pub name: String,
    /// Free-text type ("山脉", "宗门", "客栈").
    #[serde(rename = "type", default)]
    pub kind: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tier: LocationTier,
    pub icon_hint: Option<String>,
    #[serde(default)]
    pub role: LocationRole,
}

/// An item event: something appeared, changed hands, or was destroyed.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemEvent {
    pub item_name: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub action: ItemAction,
    #[serde(default)]
    pub actor: String,
    pub recipient: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// A relation between two organizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OrgRelation {
    pub other_org: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// A membership or inter-org event.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OrgEvent {
    pub org_name: String,
    #[serde(default)]
    pub org_type: String,
    pub member: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub action: OrgAction,
    #[serde(default)]
    pub description: String,
    pub org_relation: Option<OrgRelation>,
}

/// A one-sentence chapter event for the timeline.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventFact {
    pub summary: String,
    #[serde(rename = "type", default)]
    pub kind: EventKind,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub participants: Vec<String>,
    pub location: Option<String>,
}

/// A new in-world concept (technique, material, rank system, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConceptFact {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub related: Vec<String>,
}

/// A spatial statement the narration makes about two locations.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpatialRelationship {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub relation_type: SpatialRelationType,
    /// Free-form payload: "north_of", "three_days_walk", "on_coast", ...
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub confidence: Confidence,
    /// Supporting quote, truncated to ~50 chars by the validator.
    #[serde(default)]
    pub narrative_evidence: String,
}

/// An explicit world-structure declaration ("天下分为四大部洲").
///
/// The content dict is type-specific and intentionally left loose; the
/// world-structure agent interprets it defensively.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorldDeclaration {
    #[serde(default)]
    pub declaration_type: DeclarationType,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub narrative_evidence: String,
    #[serde(default)]
    pub confidence: Confidence,
}

/// The extraction product for exactly one chapter.
///
/// Every array tolerates absence in the model output; a missing key decodes
/// to an empty list rather than failing the chapter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ChapterFact {
    #[serde(default)]
    pub characters: Vec<CharacterFact>,
    #[serde(default)]
    pub relationships: Vec<RelationshipFact>,
    #[serde(default)]
    pub locations: Vec<LocationFact>,
    #[serde(default)]
    pub item_events: Vec<ItemEvent>,
    #[serde(default)]
    pub org_events: Vec<OrgEvent>,
    #[serde(default)]
    pub events: Vec<EventFact>,
    #[serde(default)]
    pub new_concepts: Vec<ConceptFact>,
    #[serde(default)]
    pub spatial_relationships: Vec<SpatialRelationship>,
    /// Optional; many model outputs omit it entirely.
    #[serde(default)]
    pub world_declarations: Vec<WorldDeclaration>,
}

impl ChapterFact {
    /// True when nothing at all was extracted.
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
            && self.relationships.is_empty()
            && self.locations.is_empty()
            && self.item_events.is_empty()
            && self.org_events.is_empty()
            && self.events.is_empty()
            && self.new_concepts.is_empty()
            && self.spatial_relationships.is_empty()
            && self.world_declarations.is_empty()
    }

    /// Merge `other` into `self` by union-with-dedup: same name and same
    /// kind keeps the first occurrence. Used when a long chapter was
    /// extracted in segments.
    pub fn merge(&mut self, other: ChapterFact) {
        for ch in other.characters {
            match self.characters.iter_mut().find(|c| c.name == ch.name) {
                Some(existing) => {
                    for alias in ch.new_aliases {
                        if !existing.new_aliases.contains(&alias) {
                            existing.new_aliases.push(alias);
                        }
                    }
                    for ability in ch.abilities_gained {
                        if !existing.abilities_gained.iter().any(|a| a.name == ability.name) {
                            existing.abilities_gained.push(ability);
                        }
                    }
                    for loc in ch.locations_in_chapter {
                        if !existing.locations_in_chapter.contains(&loc) {
                            existing.locations_in_chapter.push(loc);
                        }
                    }
                    if existing.appearance.is_none() {
                        existing.appearance = ch.appearance;
                    }
                }
                None => self.characters.push(ch),
            }
        }
        for rel in other.relationships {
            let dup = self.relationships.iter().any(|r| {
                r.relation_type == rel.relation_type
                    && ((r.person_a == rel.person_a && r.person_b == rel.person_b)
                        || (r.person_a == rel.person_b && r.person_b == rel.person_a))
            });
            if !dup {
                self.relationships.push(rel);
            }
        }
        for loc in other.locations {
            match self.locations.iter_mut().find(|l| l.name == loc.name) {
                // Conflicting fields keep the higher-confidence side; with no
                // per-location confidence the first extraction wins, filling
                // only holes.
                Some(existing) => {
                    if existing.parent.is_none() {
                        existing.parent = loc.parent;
                    }
                    if existing.description.is_empty() {
                        existing.description = loc.description;
                    }
                }
                None => self.locations.push(loc),
            }
        }
        for item in other.item_events {
            let dup = self
                .item_events
                .iter()
                .any(|i| i.item_name == item.item_name && i.action == item.action && i.actor == item.actor);
            if !dup {
                self.item_events.push(item);
            }
        }
        for org in other.org_events {
            let dup = self
                .org_events
                .iter()
                .any(|o| o.org_name == org.org_name && o.member == org.member && o.action == org.action);
            if !dup {
                self.org_events.push(org);
            }
        }
        for ev in other.events {
            if !self.events.iter().any(|e| e.summary == ev.summary) {
                self.events.push(ev);
            }
        }
        for concept in other.new_concepts {
            if !self.new_concepts.iter().any(|c| c.name == concept.name) {
                self.new_concepts.push(concept);
            }
        }
        for sp in other.spatial_relationships {
            match self
                .spatial_relationships
                .iter_mut()
                .find(|s| s.source == sp.source && s.target == sp.target && s.relation_type == sp.relation_type)
            {
                Some(existing) => {
                    if sp.confidence > existing.confidence {
                        *existing = sp;
                    }
                }
                None => self.spatial_relationships.push(sp),
            }
        }
        self.world_declarations.extend(other.world_declarations);
    }
}
