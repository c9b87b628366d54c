//! On-demand entity aggregation.
//!
//! Streams all stored ChapterFacts of a novel once per query, folding them
//! into per-entity profiles, graph data, timeline data, faction data and
//! map data. Profiles are snapshots referencing entities by name; nothing
//! here is persisted. Results sit in an LRU cache invalidated wholesale per
//! novel on any fact write or override.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::models::{
    AbilityMoment, ChapterFact, EdgeCategory, EntityType, Faction, FactionData, GraphData,
    GraphEdge, GraphNode, HoldingStage, ItemAction, ItemProfile, LocationProfile, LocationTier,
    Membership, OrgAction, OrgProfile, OrgRelationEntry, PersonProfile, Profile,
    RelationshipEvolution, RelationshipStage, SpatialScale, TimelineData, TimelineEvent,
    WorldStructure,
};
use crate::repository::{DictionaryRepository, FactRepository, WorldRepository};
use crate::services::context::pair_key;
use crate::services::layout::{LayoutInput, LayoutResult, LayoutSolver, SpatialConstraint};
use crate::FabulaError;

/// Chapters of presence at a location required to count as a resident.
const RESIDENT_THRESHOLD: usize = 3;

const CACHE_CAPACITY: u64 = 100;

/// Map payload: solved layout plus the hierarchy the front end needs for
/// zoom filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapData {
    pub layout: LayoutResult,
    pub spatial_scale: SpatialScale,
    pub location_parents: BTreeMap<String, String>,
    pub location_tiers: BTreeMap<String, LocationTier>,
}

#[derive(Clone)]
enum AggregateValue {
    Entity(Profile),
    Graph(GraphData),
    Timeline(TimelineData),
    Factions(FactionData),
    Map(MapData),
}

pub struct Aggregator {
    facts: Arc<dyn FactRepository>,
    world: Arc<dyn WorldRepository>,
    dictionary: Arc<dyn DictionaryRepository>,
    layout: Arc<LayoutSolver>,
    cache: Cache<String, AggregateValue>,
    generations: Mutex<HashMap<String, u64>>,
}

impl Aggregator {
    pub fn new(
        facts: Arc<dyn FactRepository>,
        world: Arc<dyn WorldRepository>,
        dictionary: Arc<dyn DictionaryRepository>,
        layout: Arc<LayoutSolver>,
    ) -> Self {
        Aggregator {
            facts,
            world,
            dictionary,
            layout,
            cache: Cache::new(CACHE_CAPACITY),
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Invalidate every cached aggregate of a novel.
    pub fn invalidate_novel(&self, novel_id: &str) {
        let mut generations = self
            .generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *generations.entry(novel_id.to_string()).or_default() += 1;
        self.layout.invalidate_novel(novel_id);
    }

    fn cache_key(&self, novel_id: &str, kind: &str, id: &str, range: Option<(u32, u32)>) -> String {
        let generation = {
            let generations = self
                .generations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            generations.get(novel_id).copied().unwrap_or(0)
        };
        format!("{novel_id}:{generation}:{kind}:{id}:{range:?}")
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    pub async fn person_profile(
        &self,
        novel_id: &str,
        name: &str,
    ) -> Result<PersonProfile, FabulaError> {
        let key = self.cache_key(novel_id, "person", name, None);
        if let Some(AggregateValue::Entity(Profile::Person(profile))) = self.cache.get(&key).await {
            return Ok(profile);
        }
        let facts = self.facts.list_facts(novel_id, None).await?;
        let aliases = self.alias_resolver(novel_id, &facts).await?;
        let profile = fold_person(&facts, &aliases, name);
        self.cache
            .insert(key, AggregateValue::Entity(Profile::Person(profile.clone())))
            .await;
        Ok(profile)
    }

    pub async fn location_profile(
        &self,
        novel_id: &str,
        name: &str,
    ) -> Result<LocationProfile, FabulaError> {
        let key = self.cache_key(novel_id, "location", name, None);
        if let Some(AggregateValue::Entity(Profile::Location(profile))) =
            self.cache.get(&key).await
        {
            return Ok(profile);
        }
        let facts = self.facts.list_facts(novel_id, None).await?;
        let mut world = self.world.get_structure(novel_id).await?;
        world.apply_overrides(&self.world.list_overrides(novel_id).await?);
        let aliases = self.alias_resolver(novel_id, &facts).await?;
        let profile = fold_location(&facts, &aliases, &world, name);
        self.cache
            .insert(
                key,
                AggregateValue::Entity(Profile::Location(profile.clone())),
            )
            .await;
        Ok(profile)
    }

    pub async fn item_profile(&self, novel_id: &str, name: &str) -> Result<ItemProfile, FabulaError> {
        let key = self.cache_key(novel_id, "item", name, None);
        if let Some(AggregateValue::Entity(Profile::Item(profile))) = self.cache.get(&key).await {
            return Ok(profile);
        }
        let facts = self.facts.list_facts(novel_id, None).await?;
        let aliases = self.alias_resolver(novel_id, &facts).await?;
        let profile = fold_item(&facts, &aliases, name);
        self.cache
            .insert(key, AggregateValue::Entity(Profile::Item(profile.clone())))
            .await;
        Ok(profile)
    }

    pub async fn org_profile(&self, novel_id: &str, name: &str) -> Result<OrgProfile, FabulaError> {
        let key = self.cache_key(novel_id, "org", name, None);
        if let Some(AggregateValue::Entity(Profile::Org(profile))) = self.cache.get(&key).await {
            return Ok(profile);
        }
        let facts = self.facts.list_facts(novel_id, None).await?;
        let aliases = self.alias_resolver(novel_id, &facts).await?;
        let profile = fold_org(&facts, &aliases, name);
        self.cache
            .insert(key, AggregateValue::Entity(Profile::Org(profile.clone())))
            .await;
        Ok(profile)
    }

    /// Entity lookup with an optional kind hint; without one, the pre-scan
    /// dictionary decides, falling back to probing person → location →
    /// item → org.
    pub async fn get_entity(
        &self,
        novel_id: &str,
        name: &str,
        kind: Option<EntityType>,
    ) -> Result<Profile, FabulaError> {
        let kind = match kind {
            Some(kind) => kind,
            None => self
                .dictionary
                .get_entry(novel_id, name)
                .await?
                .map(|e| e.entity_type)
                .unwrap_or(EntityType::Unknown),
        };
        match kind {
            EntityType::Person => Ok(Profile::Person(self.person_profile(novel_id, name).await?)),
            EntityType::Location => Ok(Profile::Location(
                self.location_profile(novel_id, name).await?,
            )),
            EntityType::Item => Ok(Profile::Item(self.item_profile(novel_id, name).await?)),
            EntityType::Org => Ok(Profile::Org(self.org_profile(novel_id, name).await?)),
            EntityType::Concept | EntityType::Unknown => {
                let person = self.person_profile(novel_id, name).await?;
                if !person.chapters_appeared.is_empty() {
                    return Ok(Profile::Person(person));
                }
                let location = self.location_profile(novel_id, name).await?;
                if location.mention_count > 0 {
                    return Ok(Profile::Location(location));
                }
                let item = self.item_profile(novel_id, name).await?;
                if item.event_count > 0 {
                    return Ok(Profile::Item(item));
                }
                let org = self.org_profile(novel_id, name).await?;
                if org.first_chapter.is_some() {
                    return Ok(Profile::Org(org));
                }
                Err(FabulaError::NotFound {
                    entity_type: "entity".to_string(),
                    id: name.to_string(),
                })
            }
        }
    }

    // ========================================================================
    // Graph / timeline / factions / map
    // ========================================================================

    pub async fn graph(
        &self,
        novel_id: &str,
        range: Option<(u32, u32)>,
    ) -> Result<GraphData, FabulaError> {
        let key = self.cache_key(novel_id, "graph", "", range);
        if let Some(AggregateValue::Graph(graph)) = self.cache.get(&key).await {
            return Ok(graph);
        }
        let facts = self.facts.list_facts(novel_id, range).await?;
        let aliases = self.alias_resolver(novel_id, &facts).await?;
        let graph = fold_graph(&facts, &aliases);
        self.cache
            .insert(key, AggregateValue::Graph(graph.clone()))
            .await;
        Ok(graph)
    }

    pub async fn timeline(
        &self,
        novel_id: &str,
        range: Option<(u32, u32)>,
    ) -> Result<TimelineData, FabulaError> {
        let key = self.cache_key(novel_id, "timeline", "", range);
        if let Some(AggregateValue::Timeline(timeline)) = self.cache.get(&key).await {
            return Ok(timeline);
        }
        let facts = self.facts.list_facts(novel_id, range).await?;
        let timeline = TimelineData {
            events: facts
                .iter()
                .flat_map(|(chapter, fact)| {
                    fact.events.iter().map(|e| TimelineEvent {
                        chapter: *chapter,
                        summary: e.summary.clone(),
                        kind: e.kind,
                        importance: e.importance,
                        participants: e.participants.clone(),
                        location: e.location.clone(),
                    })
                })
                .collect(),
        };
        self.cache
            .insert(key, AggregateValue::Timeline(timeline.clone()))
            .await;
        Ok(timeline)
    }

    pub async fn factions(
        &self,
        novel_id: &str,
        range: Option<(u32, u32)>,
    ) -> Result<FactionData, FabulaError> {
        let key = self.cache_key(novel_id, "factions", "", range);
        if let Some(AggregateValue::Factions(factions)) = self.cache.get(&key).await {
            return Ok(factions);
        }
        let facts = self.facts.list_facts(novel_id, range).await?;
        let aliases = self.alias_resolver(novel_id, &facts).await?;
        let org_names: HashSet<String> = facts
            .iter()
            .flat_map(|(_, f)| f.org_events.iter().map(|o| o.org_name.clone()))
            .collect();
        let mut factions: Vec<Faction> = org_names
            .into_iter()
            .map(|name| {
                let profile = fold_org(&facts, &aliases, &name);
                Faction {
                    name,
                    org_type: profile.org_type,
                    member_count: profile.members.len(),
                    members: profile.members,
                    relations: profile.relations,
                }
            })
            .collect();
        factions.sort_by(|a, b| b.member_count.cmp(&a.member_count).then(a.name.cmp(&b.name)));
        let data = FactionData { factions };
        self.cache
            .insert(key, AggregateValue::Factions(data.clone()))
            .await;
        Ok(data)
    }

    /// Map data: world structure (with overrides) solved into coordinates.
    pub async fn map_data(
        &self,
        novel_id: &str,
        range: Option<(u32, u32)>,
    ) -> Result<MapData, FabulaError> {
        let key = self.cache_key(novel_id, "map", "", range);
        if let Some(AggregateValue::Map(map)) = self.cache.get(&key).await {
            return Ok(map);
        }
        let facts = self.facts.list_facts(novel_id, range).await?;
        let world = self.world.get_structure(novel_id).await?;
        let overrides = self.world.list_overrides(novel_id).await?;

        let mut constraints = Vec::new();
        let mut first_chapter: HashMap<String, u32> = HashMap::new();
        for (chapter, fact) in &facts {
            for spatial in &fact.spatial_relationships {
                constraints.push(SpatialConstraint {
                    source: spatial.source.clone(),
                    target: spatial.target.clone(),
                    kind: spatial.relation_type,
                    value: spatial.value.clone(),
                    confidence: spatial.confidence,
                    chapter: *chapter,
                });
            }
            for location in &fact.locations {
                first_chapter.entry(location.name.clone()).or_insert(*chapter);
            }
        }

        let layout = self
            .layout
            .compute_layered_layout(LayoutInput {
                novel_id: novel_id.to_string(),
                world: world.clone(),
                constraints,
                overrides: overrides.clone(),
                first_chapter,
            })
            .await?;

        let mut world_view = world;
        world_view.apply_overrides(&overrides);
        let map = MapData {
            layout: (*layout).clone(),
            spatial_scale: world_view.spatial_scale,
            location_parents: world_view.location_parents.clone(),
            location_tiers: world_view.location_tiers.clone(),
        };
        self.cache
            .insert(key, AggregateValue::Map(map.clone()))
            .await;
        Ok(map)
    }

    /// Build the alias resolver for a novel: union-find over name tokens
    /// seeded by declared aliases, pre-scan alias groups, and user edits
    /// (dictionary rows carry user merges after editing).
    async fn alias_resolver(
        &self,
        novel_id: &str,
        facts: &[(u32, ChapterFact)],
    ) -> Result<AliasResolver, FabulaError> {
        let mut union = UnionFind::default();
        let mut first_chapter: HashMap<String, u32> = HashMap::new();
        let mut frequency: HashMap<String, u32> = HashMap::new();

        for (chapter, fact) in facts {
            for character in &fact.characters {
                first_chapter
                    .entry(character.name.clone())
                    .or_insert(*chapter);
                for alias in &character.new_aliases {
                    first_chapter.entry(alias.clone()).or_insert(*chapter);
                    union.union(&character.name, alias);
                }
            }
        }
        for entry in self
            .dictionary
            .list_entries(novel_id, Some(EntityType::Person), None)
            .await?
        {
            frequency.insert(entry.name.clone(), entry.frequency);
            for alias in &entry.aliases {
                union.union(&entry.name, alias);
            }
        }

        Ok(AliasResolver {
            union,
            first_chapter,
            frequency,
        })
    }
}

// ============================================================================
// Alias resolution
// ============================================================================

#[derive(Default)]
struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn find(&mut self, name: &str) -> String {
        let parent = match self.parent.get(name) {
            Some(parent) if parent != name => parent.clone(),
            _ => return name.to_string(),
        };
        let root = self.find(&parent);
        self.parent.insert(name.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent.insert(root_b, root_a.clone());
        }
    }

    fn members_of(&mut self, root: &str) -> Vec<String> {
        let root = self.find(root);
        let names: Vec<String> = self.parent.keys().cloned().collect();
        let mut members = vec![root.clone()];
        for name in names {
            if self.find(&name) == root && name != root {
                members.push(name);
            }
        }
        members
    }
}

struct AliasResolver {
    union: UnionFind,
    first_chapter: HashMap<String, u32>,
    frequency: HashMap<String, u32>,
}

impl AliasResolver {
    /// Canonical name of a group: earliest first chapter, ties broken by
    /// whole-book frequency, then lexicographically.
    fn canonical(&mut self, name: &str) -> String {
        let members = self.union.members_of(name);
        members
            .into_iter()
            .min_by(|a, b| {
                let chapter_a = self.first_chapter.get(a).copied().unwrap_or(u32::MAX);
                let chapter_b = self.first_chapter.get(b).copied().unwrap_or(u32::MAX);
                let freq_a = self.frequency.get(a).copied().unwrap_or(0);
                let freq_b = self.frequency.get(b).copied().unwrap_or(0);
                chapter_a
                    .cmp(&chapter_b)
                    .then(freq_b.cmp(&freq_a))
                    .then(a.cmp(b))
            })
            .unwrap_or_else(|| name.to_string())
    }

    fn aliases_of(&mut self, name: &str) -> Vec<String> {
        let canonical = self.canonical(name);
        let mut aliases = self.union.members_of(&canonical);
        aliases.retain(|a| *a != canonical);
        aliases.sort();
        aliases
    }

    fn same_entity(&mut self, a: &str, b: &str) -> bool {
        self.union.find(a) == self.union.find(b)
    }
}

// ============================================================================
// Folds
// ============================================================================

fn fold_person(
    facts: &[(u32, ChapterFact)],
    aliases: &AliasResolver,
    name: &str,
) -> PersonProfile {
    // The resolver needs &mut for path compression; rebuild a local handle.
    let mut resolver = AliasResolver {
        union: UnionFind {
            parent: aliases.union.parent.clone(),
        },
        first_chapter: aliases.first_chapter.clone(),
        frequency: aliases.frequency.clone(),
    };
    let canonical = resolver.canonical(name);

    let mut profile = PersonProfile {
        name: canonical.clone(),
        aliases: resolver.aliases_of(&canonical),
        ..PersonProfile::default()
    };

    let mut evolutions: BTreeMap<String, Vec<RelationshipStage>> = BTreeMap::new();

    for (chapter, fact) in facts {
        let mut appeared = false;
        for character in &fact.characters {
            if resolver.same_entity(&character.name, &canonical) {
                appeared = true;
                if profile.appearance.is_none() {
                    profile.appearance = character.appearance.clone();
                }
                for ability in &character.abilities_gained {
                    profile.abilities.push(AbilityMoment {
                        chapter: *chapter,
                        dimension: ability.dimension,
                        name: ability.name.clone(),
                        description: ability.description.clone(),
                    });
                }
                for loc in &character.locations_in_chapter {
                    if !profile.locations_visited.contains(loc) {
                        profile.locations_visited.push(loc.clone());
                    }
                }
            }
        }
        if appeared {
            profile.chapters_appeared.push(*chapter);
        }

        for rel in &fact.relationships {
            let other = if resolver.same_entity(&rel.person_a, &canonical) {
                &rel.person_b
            } else if resolver.same_entity(&rel.person_b, &canonical) {
                &rel.person_a
            } else {
                continue;
            };
            let other = resolver.canonical(other);
            let stages = evolutions.entry(other).or_default();
            let same_type = stages
                .last()
                .is_some_and(|last| last.relation_type == rel.relation_type);
            if same_type {
                if let Some(last) = stages.last_mut() {
                    last.to_chapter = *chapter;
                }
            } else {
                // The previous stage holds until the new type begins.
                if let Some(last) = stages.last_mut() {
                    last.to_chapter = chapter.saturating_sub(1).max(last.from_chapter);
                }
                stages.push(RelationshipStage {
                    from_chapter: *chapter,
                    to_chapter: *chapter,
                    relation_type: rel.relation_type.clone(),
                    evidence: rel.evidence.clone(),
                });
            }
        }
    }

    profile.first_chapter = profile.chapters_appeared.first().copied();
    profile.last_chapter = profile.chapters_appeared.last().copied();
    profile.mention_count = profile.chapters_appeared.len();
    profile.relationships = evolutions
        .into_iter()
        .map(|(other, stages)| RelationshipEvolution { other, stages })
        .collect();
    profile
}

fn fold_location(
    facts: &[(u32, ChapterFact)],
    aliases: &AliasResolver,
    world: &WorldStructure,
    name: &str,
) -> LocationProfile {
    let mut resolver = AliasResolver {
        union: UnionFind {
            parent: aliases.union.parent.clone(),
        },
        first_chapter: aliases.first_chapter.clone(),
        frequency: aliases.frequency.clone(),
    };

    let mut profile = LocationProfile {
        name: name.to_string(),
        tier: world.tier_of(name),
        parent_chain: world.parent_chain(name),
        ..LocationProfile::default()
    };

    // Person -> chapters present at this location.
    let mut presence: HashMap<String, Vec<u32>> = HashMap::new();

    for (chapter, fact) in facts {
        let mut mentioned = false;
        for location in &fact.locations {
            if location.name == name {
                mentioned = true;
                if profile.description.is_empty() && !location.description.is_empty() {
                    profile.description = location.description.clone();
                }
            }
        }
        for character in &fact.characters {
            if character.locations_in_chapter.iter().any(|l| l == name) {
                mentioned = true;
                let canonical = resolver.canonical(&character.name);
                presence.entry(canonical).or_default().push(*chapter);
            }
        }
        if mentioned {
            profile.mention_count += 1;
            if profile.first_chapter.is_none() {
                profile.first_chapter = Some(*chapter);
            }
            profile.last_chapter = Some(*chapter);
        }
    }

    let mut residents: Vec<String> = Vec::new();
    let mut visitors: Vec<String> = Vec::new();
    for (person, chapters) in presence {
        if chapters.len() >= RESIDENT_THRESHOLD {
            residents.push(person);
        } else {
            visitors.push(person);
        }
    }
    residents.sort();
    visitors.sort();
    profile.residents = residents;
    profile.visitors = visitors;
    profile
}

fn fold_item(facts: &[(u32, ChapterFact)], aliases: &AliasResolver, name: &str) -> ItemProfile {
    let mut resolver = AliasResolver {
        union: UnionFind {
            parent: aliases.union.parent.clone(),
        },
        first_chapter: aliases.first_chapter.clone(),
        frequency: aliases.frequency.clone(),
    };

    let mut profile = ItemProfile {
        name: name.to_string(),
        ..ItemProfile::default()
    };

    for (chapter, fact) in facts {
        for event in &fact.item_events {
            if event.item_name != name {
                continue;
            }
            profile.event_count += 1;
            if profile.item_type.is_empty() {
                profile.item_type = event.item_type.clone();
            }
            if profile.first_chapter.is_none() {
                profile.first_chapter = Some(*chapter);
            }
            profile.last_chapter = Some(*chapter);

            match event.action {
                ItemAction::Appear | ItemAction::Use => {
                    if profile.current_holder.is_none() && !event.actor.is_empty() {
                        let holder = resolver.canonical(&event.actor);
                        open_stage(&mut profile, *chapter, holder, event.action);
                    }
                }
                ItemAction::Obtain => {
                    let holder = resolver.canonical(&event.actor);
                    close_stage(&mut profile, *chapter);
                    open_stage(&mut profile, *chapter, holder, ItemAction::Obtain);
                }
                ItemAction::Gift => {
                    close_stage(&mut profile, *chapter);
                    if let Some(recipient) = &event.recipient {
                        let holder = resolver.canonical(recipient);
                        open_stage(&mut profile, *chapter, holder, ItemAction::Gift);
                    }
                }
                ItemAction::Consume | ItemAction::Lose | ItemAction::Destroy => {
                    close_stage(&mut profile, *chapter);
                }
            }
        }
    }
    profile
}

fn open_stage(profile: &mut ItemProfile, chapter: u32, holder: String, via: ItemAction) {
    profile.current_holder = Some(holder.clone());
    profile.holding_chain.push(HoldingStage {
        from_chapter: chapter,
        to_chapter: None,
        holder,
        acquired_via: via,
    });
}

fn close_stage(profile: &mut ItemProfile, chapter: u32) {
    profile.current_holder = None;
    if let Some(last) = profile.holding_chain.last_mut() {
        if last.to_chapter.is_none() {
            last.to_chapter = Some(chapter);
        }
    }
}

fn fold_org(facts: &[(u32, ChapterFact)], aliases: &AliasResolver, name: &str) -> OrgProfile {
    let mut resolver = AliasResolver {
        union: UnionFind {
            parent: aliases.union.parent.clone(),
        },
        first_chapter: aliases.first_chapter.clone(),
        frequency: aliases.frequency.clone(),
    };

    let mut profile = OrgProfile {
        name: name.to_string(),
        ..OrgProfile::default()
    };
    let mut members: BTreeMap<String, Membership> = BTreeMap::new();

    for (chapter, fact) in facts {
        for event in &fact.org_events {
            if event.org_name != name {
                continue;
            }
            if profile.org_type.is_empty() {
                profile.org_type = event.org_type.clone();
            }
            if profile.first_chapter.is_none() {
                profile.first_chapter = Some(*chapter);
            }
            profile.last_chapter = Some(*chapter);

            if let Some(member) = &event.member {
                let canonical = resolver.canonical(member);
                let membership = members.entry(canonical.clone()).or_insert(Membership {
                    name: canonical,
                    role: None,
                    joined_chapter: None,
                    left_chapter: None,
                    last_action: event.action,
                });
                membership.last_action = event.action;
                if let Some(role) = &event.role {
                    membership.role = Some(role.clone());
                }
                match event.action {
                    OrgAction::Join => {
                        membership.joined_chapter.get_or_insert(*chapter);
                        membership.left_chapter = None;
                    }
                    OrgAction::Promote => {
                        membership.joined_chapter.get_or_insert(*chapter);
                    }
                    OrgAction::Leave | OrgAction::Defect | OrgAction::Expel | OrgAction::Die => {
                        membership.left_chapter = Some(*chapter);
                    }
                }
            }
            if let Some(relation) = &event.org_relation {
                profile.relations.push(OrgRelationEntry {
                    other_org: relation.other_org.clone(),
                    relation: relation.kind.clone(),
                    chapter: *chapter,
                });
            }
        }
    }

    profile.members = members.into_values().collect();
    profile
}

fn fold_graph(facts: &[(u32, ChapterFact)], aliases: &AliasResolver) -> GraphData {
    let mut resolver = AliasResolver {
        union: UnionFind {
            parent: aliases.union.parent.clone(),
        },
        first_chapter: aliases.first_chapter.clone(),
        frequency: aliases.frequency.clone(),
    };

    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
    // Pair -> (distinct chapters, latest relation type).
    let mut edges: BTreeMap<(String, String), (HashSet<u32>, String)> = BTreeMap::new();

    for (chapter, fact) in facts {
        for character in &fact.characters {
            let canonical = resolver.canonical(&character.name);
            let node = nodes.entry(canonical.clone()).or_insert(GraphNode {
                id: canonical.clone(),
                name: canonical,
                mention_count: 0,
                first_chapter: *chapter,
            });
            node.mention_count += 1;
        }
        for rel in &fact.relationships {
            let a = resolver.canonical(&rel.person_a);
            let b = resolver.canonical(&rel.person_b);
            if a == b {
                continue;
            }
            let key = pair_key(&a, &b);
            let entry = edges
                .entry(key)
                .or_insert_with(|| (HashSet::new(), rel.relation_type.clone()));
            entry.0.insert(*chapter);
            entry.1 = rel.relation_type.clone();
        }
    }

    let edges = edges
        .into_iter()
        .map(|((source, target), (chapters, relation_type))| GraphEdge {
            source,
            target,
            category: classify_relation(&relation_type),
            weight: chapters.len(),
            relation_type,
        })
        .collect();

    GraphData {
        nodes: nodes.into_values().collect(),
        edges,
    }
}

/// Coarse colour category for an edge, by keyword.
pub fn classify_relation(relation_type: &str) -> EdgeCategory {
    const KINSHIP: &[&str] = &[
        "父", "母", "兄", "弟", "姐", "妹", "夫", "妻", "子", "女", "儿", "爷", "奶", "叔",
        "舅", "姑", "姨", "婚", "亲",
    ];
    const HOSTILE: &[&str] = &["敌", "仇", "杀", "恨", "对头", "死敌"];
    const ORGANIZATIONAL: &[&str] = &["师", "徒", "同门", "上司", "下属", "主仆", "同僚", "掌门"];
    const FRIENDLY: &[&str] = &["友", "朋", "伴", "盟", "恋", "爱", "知己", "结拜"];

    if KINSHIP.iter().any(|k| relation_type.contains(k)) {
        EdgeCategory::Kinship
    } else if HOSTILE.iter().any(|k| relation_type.contains(k)) {
        EdgeCategory::Hostile
    } else if ORGANIZATIONAL.iter().any(|k| relation_type.contains(k)) {
        EdgeCategory::Organizational
    } else if FRIENDLY.iter().any(|k| relation_type.contains(k)) {
        EdgeCategory::Friendly
    } else {
        EdgeCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_find_groups_aliases() {
        let mut union = UnionFind::default();
        union.union("孙悟空", "齐天大圣");
        union.union("齐天大圣", "行者");
        assert_eq!(union.find("行者"), union.find("孙悟空"));
        let members = union.members_of("行者");
        assert_eq!(members.len(), 3);
    }

    #[test]
    fn test_canonical_prefers_earliest_chapter() {
        let mut union = UnionFind::default();
        union.union("韩立", "韩跑跑");
        let mut first_chapter = HashMap::new();
        first_chapter.insert("韩立".to_string(), 1);
        first_chapter.insert("韩跑跑".to_string(), 12);
        let mut resolver = AliasResolver {
            union,
            first_chapter,
            frequency: HashMap::new(),
        };
        assert_eq!(resolver.canonical("韩跑跑"), "韩立");
    }

    #[test]
    fn test_classify_relation_categories() {
        assert_eq!(classify_relation("师徒"), EdgeCategory::Organizational);
        assert_eq!(classify_relation("仇人"), EdgeCategory::Hostile);
        assert_eq!(classify_relation("结拜兄弟"), EdgeCategory::Kinship);
        assert_eq!(classify_relation("初识"), EdgeCategory::Other);
    }
}
