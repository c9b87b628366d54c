//! Context summary builder.
//!
//! Produces the bounded textual digest injected into the extractor's prompt:
//! current scene focus, recently active characters and relationships,
//! top locations, held items, a world-structure summary, and the whole-book
//! high-frequency reference from the pre-scan dictionary.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::models::{AbilityDimension, ChapterFact, ItemAction};
use crate::repository::{DictionaryRepository, FactRepository, WorldRepository};
use crate::utils::text::{char_count, truncate_chars};
use crate::FabulaError;

/// Section sizing knobs. The hard character budget comes from the active
/// LLM tier and is passed to [`ContextBuilder::build`] per call.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Chapters considered "recent" for character/relationship activity.
    pub recent_window: u32,
    /// Number of trailing facts scanned for the scene focus.
    pub scene_facts: usize,
    pub max_characters: usize,
    pub max_locations: usize,
    pub max_items: usize,
    pub dict_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            recent_window: 5,
            scene_facts: 3,
            max_characters: 20,
            max_locations: 15,
            max_items: 10,
            dict_limit: 100,
        }
    }
}

struct CharacterState {
    last_chapter: u32,
    aliases: Vec<String>,
    realm: Option<String>,
    identity: Option<String>,
}

pub struct ContextBuilder {
    facts: Arc<dyn FactRepository>,
    world: Arc<dyn WorldRepository>,
    dictionary: Arc<dyn DictionaryRepository>,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(
        facts: Arc<dyn FactRepository>,
        world: Arc<dyn WorldRepository>,
        dictionary: Arc<dyn DictionaryRepository>,
    ) -> Self {
        ContextBuilder {
            facts,
            world,
            dictionary,
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the digest for `chapter_num`, at most `max_chars` characters.
    ///
    /// Sees exactly the facts with `chapter_num < current` at the moment of
    /// the call. Over-budget output narrows sections (older material first)
    /// before hard truncation; this path never fails the chapter.
    pub async fn build(
        &self,
        novel_id: &str,
        chapter_num: u32,
        max_chars: usize,
    ) -> Result<String, FabulaError> {
        let prior = if chapter_num > 1 {
            self.facts
                .list_facts(novel_id, Some((1, chapter_num - 1)))
                .await?
        } else {
            Vec::new()
        };

        let dict_section = self.dictionary_section(novel_id, self.config.dict_limit).await?;

        if prior.is_empty() {
            let mut summary = String::from("本章为第1章，暂无前文上下文。\n");
            summary.push_str(&dict_section);
            return Ok(enforce_budget(summary, max_chars));
        }

        let world = self.world.get_structure(novel_id).await?;
        let cfg = &self.config;

        // One pass over prior facts collecting everything the sections need.
        let mut char_states: HashMap<String, CharacterState> = HashMap::new();
        let mut location_mentions: HashMap<String, usize> = HashMap::new();
        let mut relationships: BTreeMap<(String, String), (u32, String)> = BTreeMap::new();
        let mut holders: BTreeMap<String, Option<String>> = BTreeMap::new();

        for (chapter, fact) in &prior {
            fold_fact(
                *chapter,
                fact,
                &mut char_states,
                &mut location_mentions,
                &mut relationships,
                &mut holders,
            );
        }

        let scene_focus = self.scene_focus(&prior, &world);
        let recent_floor = chapter_num.saturating_sub(cfg.recent_window);

        let mut sections: Vec<String> = Vec::new();

        if !scene_focus.is_empty() {
            let mut s = String::from("## 当前场景\n");
            for chain in &scene_focus {
                s.push_str(&format!("- {chain}\n"));
            }
            s.push_str("新出现的建筑/房间若未指明归属，优先挂在上述场景之下。\n");
            sections.push(s);
        }

        let mut active: Vec<(&String, &CharacterState)> = char_states
            .iter()
            .filter(|(_, st)| st.last_chapter >= recent_floor)
            .collect();
        active.sort_by(|a, b| b.1.last_chapter.cmp(&a.1.last_chapter).then(a.0.cmp(b.0)));
        if !active.is_empty() {
            let mut s = String::from("## 已知角色\n");
            for (name, state) in active.iter().take(cfg.max_characters) {
                let mut line = format!("- {name}");
                if let Some(realm) = &state.realm {
                    line.push_str(&format!("（境界：{realm}）"));
                }
                if let Some(identity) = &state.identity {
                    line.push_str(&format!("（身份：{identity}）"));
                }
                if !state.aliases.is_empty() {
                    line.push_str(&format!(" 别名：{}", state.aliases.join("、")));
                }
                s.push_str(&line);
                s.push('\n');
            }
            sections.push(s);
        }

        let recent_rels: Vec<(&(String, String), &(u32, String))> = relationships
            .iter()
            .filter(|(_, (chapter, _))| *chapter >= recent_floor)
            .collect();
        if !recent_rels.is_empty() {
            let mut s = String::from("## 已知关系\n");
            for ((a, b), (_, kind)) in recent_rels {
                s.push_str(&format!("- {a} 与 {b}：{kind}\n"));
            }
            sections.push(s);
        }

        let mut top_locations: Vec<(&String, &usize)> = location_mentions.iter().collect();
        top_locations.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        if !top_locations.is_empty() {
            let mut s = String::from("## 已知地点\n");
            for (name, count) in top_locations.iter().take(cfg.max_locations) {
                let tier = world.tier_of(name);
                let parent = world
                    .location_parents
                    .get(*name)
                    .map(|p| format!("，属于{p}"))
                    .unwrap_or_default();
                s.push_str(&format!("- {name}（{}，提及{count}次{parent}）\n", tier.as_str()));
            }
            sections.push(s);
        }

        let held: Vec<(&String, &String)> = holders
            .iter()
            .filter_map(|(item, holder)| holder.as_ref().map(|h| (item, h)))
            .collect();
        if !held.is_empty() {
            let mut s = String::from("## 已知物品\n");
            for (item, holder) in held.iter().take(cfg.max_items) {
                s.push_str(&format!("- {item}（持有者：{holder}）\n"));
            }
            sections.push(s);
        }

        sections.push(world_section(&world));

        let assembled = format!("{}{}", sections.concat(), dict_section);
        if char_count(&assembled) <= max_chars {
            return Ok(assembled);
        }

        // Narrow: shrink the whole-book reference first, then the character
        // window, before hard truncation.
        for (dict_limit, char_limit) in [(50usize, 20usize), (20, 10), (0, 5)] {
            let narrowed_dict = if dict_limit == 0 {
                String::new()
            } else {
                self.dictionary_section(novel_id, dict_limit).await?
            };
            let mut narrowed = sections.clone();
            if let Some(chars_section) = narrowed.iter_mut().find(|s| s.starts_with("## 已知角色")) {
                *chars_section = take_lines(chars_section, char_limit + 1);
            }
            let assembled = format!("{}{}", narrowed.concat(), narrowed_dict);
            if char_count(&assembled) <= max_chars {
                return Ok(assembled);
            }
        }

        Ok(enforce_budget(assembled, max_chars))
    }

    /// The 1-3 most frequent scene locations of the trailing facts, rendered
    /// with their full parent chain ("越国 > 彩霞山 > 七玄门").
    fn scene_focus(
        &self,
        prior: &[(u32, ChapterFact)],
        world: &crate::models::WorldStructure,
    ) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, fact) in prior.iter().rev().take(self.config.scene_facts) {
            for character in &fact.characters {
                for loc in &character.locations_in_chapter {
                    *counts.entry(loc.as_str()).or_default() += 1;
                }
            }
        }
        let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(3)
            .map(|(name, _)| world.parent_chain(name).join(" > "))
            .collect()
    }

    async fn dictionary_section(
        &self,
        novel_id: &str,
        limit: usize,
    ) -> Result<String, FabulaError> {
        let entries = self
            .dictionary
            .list_entries(novel_id, None, Some(limit))
            .await?;
        if entries.is_empty() {
            return Ok(String::new());
        }
        let mut s = String::from("## 全书高频实体（仅供参考，仍须从本章原文提取）\n");
        for entry in entries {
            let aliases = if entry.aliases.is_empty() {
                String::new()
            } else {
                format!(" 别名：{}", entry.aliases.join("、"))
            };
            s.push_str(&format!(
                "- {}（{}，出现{}次）{}\n",
                entry.name,
                entry.entity_type.as_str(),
                entry.frequency,
                aliases
            ));
        }
        Ok(s)
    }
}

fn fold_fact(
    chapter: u32,
    fact: &ChapterFact,
    char_states: &mut HashMap<String, CharacterState>,
    location_mentions: &mut HashMap<String, usize>,
    relationships: &mut BTreeMap<(String, String), (u32, String)>,
    holders: &mut BTreeMap<String, Option<String>>,
) {
    for character in &fact.characters {
        let state = char_states
            .entry(character.name.clone())
            .or_insert_with(|| CharacterState {
                last_chapter: chapter,
                aliases: Vec::new(),
                realm: None,
                identity: None,
            });
        state.last_chapter = chapter;
        for alias in &character.new_aliases {
            if !state.aliases.contains(alias) {
                state.aliases.push(alias.clone());
            }
        }
        for ability in &character.abilities_gained {
            match ability.dimension {
                AbilityDimension::Realm => state.realm = Some(ability.name.clone()),
                AbilityDimension::Identity => state.identity = Some(ability.name.clone()),
                AbilityDimension::Skill => {}
            }
        }
        for loc in &character.locations_in_chapter {
            *location_mentions.entry(loc.clone()).or_default() += 1;
        }
    }
    for location in &fact.locations {
        *location_mentions.entry(location.name.clone()).or_default() += 1;
    }
    for rel in &fact.relationships {
        let key = pair_key(&rel.person_a, &rel.person_b);
        relationships.insert(key, (chapter, rel.relation_type.clone()));
    }
    for item in &fact.item_events {
        let holder = holders.entry(item.item_name.clone()).or_insert(None);
        match item.action {
            ItemAction::Obtain | ItemAction::Appear | ItemAction::Use => {
                if !item.actor.is_empty() {
                    *holder = Some(item.actor.clone());
                }
            }
            ItemAction::Gift => {
                if let Some(recipient) = &item.recipient {
                    *holder = Some(recipient.clone());
                }
            }
            ItemAction::Consume | ItemAction::Lose | ItemAction::Destroy => {
                *holder = None;
            }
        }
    }
}

fn world_section(world: &crate::models::WorldStructure) -> String {
    let mut s = String::from("## 世界结构\n");
    for layer in &world.layers {
        if layer.regions.is_empty() {
            s.push_str(&format!("- {}（{}）\n", layer.name, layer_type_cn(layer.layer_type)));
        } else {
            let regions: Vec<String> = layer
                .regions
                .iter()
                .map(|r| match r.cardinal_direction {
                    Some(d) => format!("{}（{}方）", r.name, direction_cn(d)),
                    None => r.name.clone(),
                })
                .collect();
            s.push_str(&format!("- {}：{}\n", layer.name, regions.join("、")));
        }
    }
    for portal in world.portals.iter().take(5) {
        s.push_str(&format!(
            "- 通道 {}：{} ↔ {}\n",
            portal.name, portal.source_location, portal.target_location
        ));
    }
    s
}

fn layer_type_cn(t: crate::models::LayerType) -> &'static str {
    use crate::models::LayerType::*;
    match t {
        Overworld => "主世界",
        Celestial => "天界",
        Underworld => "冥界",
        Underwater => "水下",
        Instance => "秘境",
        Pocket => "洞天",
    }
}

fn direction_cn(d: crate::models::CardinalDirection) -> &'static str {
    use crate::models::CardinalDirection::*;
    match d {
        East => "东",
        West => "西",
        South => "南",
        North => "北",
        Center => "中",
    }
}

pub(crate) fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn take_lines(s: &str, n: usize) -> String {
    let mut out: String = s.lines().take(n).collect::<Vec<_>>().join("\n");
    out.push('\n');
    out
}

fn enforce_budget(s: String, max_chars: usize) -> String {
    if char_count(&s) <= max_chars {
        s
    } else {
        truncate_chars(&s, max_chars).to_string()
    }
}
