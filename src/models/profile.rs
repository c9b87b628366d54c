//! Derived per-entity views, reduced on demand from ChapterFacts.
//!
//! Profiles are snapshots: they reference entities by name, hold no pointers
//! into storage, and are never persisted.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::models::fact::{AbilityDimension, EventKind, Importance, ItemAction, LocationTier, OrgAction};

// ============================================================================
// Person
// ============================================================================

/// One ability acquisition, pinned to the chapter it happened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbilityMoment {
    pub chapter: u32,
    pub dimension: AbilityDimension,
    pub name: String,
    pub description: String,
}

/// One stage of a relationship's evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipStage {
    pub from_chapter: u32,
    pub to_chapter: u32,
    pub relation_type: String,
    pub evidence: String,
}

/// Evolution chain toward one other person, contiguous equal types coalesced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEvolution {
    pub other: String,
    pub stages: Vec<RelationshipStage>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonProfile {
    pub name: String,
    pub aliases: Vec<String>,
    pub chapters_appeared: Vec<u32>,
    pub first_chapter: Option<u32>,
    pub last_chapter: Option<u32>,
    pub mention_count: usize,
    pub appearance: Option<String>,
    pub abilities: Vec<AbilityMoment>,
    pub relationships: Vec<RelationshipEvolution>,
    pub locations_visited: Vec<String>,
}

// ============================================================================
// Location
// ============================================================================

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationProfile {
    pub name: String,
    pub tier: LocationTier,
    /// Root-first chain including the location itself.
    pub parent_chain: Vec<String>,
    pub description: String,
    pub first_chapter: Option<u32>,
    pub last_chapter: Option<u32>,
    pub mention_count: usize,
    /// Characters present here in at least `resident_threshold` chapters.
    pub residents: Vec<String>,
    pub visitors: Vec<String>,
}

// ============================================================================
// Item
// ============================================================================

/// One link of an item's holding chain.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingStage {
    pub from_chapter: u32,
    pub to_chapter: Option<u32>,
    pub holder: String,
    pub acquired_via: ItemAction,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemProfile {
    pub name: String,
    pub item_type: String,
    pub first_chapter: Option<u32>,
    pub last_chapter: Option<u32>,
    pub holding_chain: Vec<HoldingStage>,
    /// None once the item was consumed, lost, or destroyed.
    pub current_holder: Option<String>,
    pub event_count: usize,
}

// ============================================================================
// Organization
// ============================================================================

/// Membership history of one person in one org.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub name: String,
    pub role: Option<String>,
    pub joined_chapter: Option<u32>,
    pub left_chapter: Option<u32>,
    pub last_action: OrgAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgRelationEntry {
    pub other_org: String,
    pub relation: String,
    pub chapter: u32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgProfile {
    pub name: String,
    pub org_type: String,
    pub first_chapter: Option<u32>,
    pub last_chapter: Option<u32>,
    pub members: Vec<Membership>,
    pub relations: Vec<OrgRelationEntry>,
}

/// Any profile kind, for `get_entity` lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Profile {
    Person(PersonProfile),
    Location(LocationProfile),
    Item(ItemProfile),
    Org(OrgProfile),
}

// ============================================================================
// Graph / timeline / factions
// ============================================================================

/// Coarse edge colour for the relationship graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCategory {
    Kinship,
    Friendly,
    Hostile,
    Organizational,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub mention_count: usize,
    pub first_chapter: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    /// Number of distinct chapters with a relationship row for this pair.
    pub weight: usize,
    pub category: EdgeCategory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub chapter: u32,
    pub summary: String,
    pub kind: EventKind,
    pub importance: Importance,
    pub participants: Vec<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineData {
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faction {
    pub name: String,
    pub org_type: String,
    pub member_count: usize,
    pub members: Vec<Membership>,
    pub relations: Vec<OrgRelationEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactionData {
    pub factions: Vec<Faction>,
}
