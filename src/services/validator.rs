//! Fact validation: hard rules and noise filters applied before persistence.
//!
//! The validator never fails a chapter over individual bad items; it drops
//! them and logs at debug. Only a wrong top-level shape raises.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::models::{ChapterFact, Confidence};
use crate::utils::text::{char_count, truncate_chars};
use crate::FabulaError;

/// Single characters that name a kind of place rather than a place.
const GENERIC_SINGLE: &[&str] = &[
    "山", "河", "海", "湖", "江", "城", "村", "镇", "门", "殿", "宫", "洞", "府", "院", "楼",
    "塔", "桥", "街", "路", "岛", "林", "谷", "峰", "崖", "坡", "洲", "国", "界", "地", "天",
    "房", "屋", "店", "铺", "厅", "堂",
];

/// Generic nouns that cannot stand alone as the proper portion of a name.
const GENERIC_NOUNS: &[&str] = &[
    "山", "河", "海", "湖", "城", "村", "镇", "屋", "房", "店", "铺", "路", "街", "桥", "林",
    "谷", "洞", "院", "楼", "门",
];

/// Descriptive modifiers that combine with a generic noun into noise
/// ("小城", "大河", "石屋").
const GENERIC_MODIFIERS: &[&str] = &[
    "大", "小", "老", "新", "高", "低", "长", "短", "深", "浅", "石", "木", "土", "破", "旧",
];

/// Building names so common that different sites reuse them; disambiguated
/// by prefixing the parent.
const HOMONYM_PRONE: &[&str] = &[
    "夹道", "后门", "上房", "前厅", "后院", "偏殿", "侧门", "大门", "正厅", "厢房", "柴房",
    "地窖", "书房", "议事厅", "演武场", "后山",
];

/// Titles that are not names when they appear without a surname.
const BARE_TITLES: &[&str] = &[
    "堂主", "长老", "掌门", "帮主", "宗主", "城主", "殿主", "长者", "前辈", "弟子", "师兄",
    "师姐", "师弟", "师妹", "师父", "师傅", "老者", "少年", "女子", "男子", "大汉",
];

const MAX_EVIDENCE_CHARS: usize = 50;

/// Stateless rule engine; construct once and share.
#[derive(Default)]
pub struct FactValidator;

impl FactValidator {
    pub fn new() -> Self {
        FactValidator
    }

    /// Validate a decoded model output.
    ///
    /// `known_persons` carries characters from prior chapters and the
    /// pre-scan dictionary; relationships naming strangers on both sides are
    /// kept but downgraded, since fiction often references off-screen people.
    pub fn validate(
        &self,
        raw: Value,
        known_persons: &HashSet<String>,
    ) -> Result<ChapterFact, FabulaError> {
        if !raw.is_object() {
            return Err(FabulaError::SchemaInvalid(format!(
                "expected a JSON object at top level, got {}",
                type_name(&raw)
            )));
        }
        let mut fact: ChapterFact = serde_json::from_value(raw)
            .map_err(|e| FabulaError::SchemaInvalid(e.to_string()))?;

        self.filter_characters(&mut fact);
        self.filter_locations(&mut fact);
        self.disambiguate_homonyms(&mut fact);
        self.check_relationships(&mut fact, known_persons);
        self.truncate_evidence(&mut fact);

        Ok(fact)
    }

    fn filter_characters(&self, fact: &mut ChapterFact) {
        fact.characters.retain(|c| {
            let len = char_count(&c.name);
            if !(2..=10).contains(&len) {
                debug!(name = %c.name, "dropping character: name length out of range");
                return false;
            }
            if BARE_TITLES.contains(&c.name.as_str()) {
                debug!(name = %c.name, "dropping character: bare title without surname");
                return false;
            }
            true
        });
        for character in &mut fact.characters {
            character
                .new_aliases
                .retain(|a| (2..=10).contains(&char_count(a)) && a != &character.name);
        }
    }

    fn filter_locations(&self, fact: &mut ChapterFact) {
        let dropped: Vec<String> = fact
            .locations
            .iter()
            .filter(|l| is_generic_location_name(&l.name))
            .map(|l| l.name.clone())
            .collect();
        for name in &dropped {
            debug!(name = %name, "dropping location: generic or descriptive name");
        }
        fact.locations.retain(|l| !is_generic_location_name(&l.name));

        // Scrub references to the dropped names.
        if !dropped.is_empty() {
            let dropped: HashSet<&str> = dropped.iter().map(String::as_str).collect();
            for character in &mut fact.characters {
                character
                    .locations_in_chapter
                    .retain(|l| !dropped.contains(l.as_str()));
            }
            for event in &mut fact.events {
                if let Some(loc) = &event.location {
                    if dropped.contains(loc.as_str()) {
                        event.location = None;
                    }
                }
            }
            fact.spatial_relationships
                .retain(|s| !dropped.contains(s.source.as_str()) && !dropped.contains(s.target.as_str()));
        }
    }

    /// Rename homonym-prone building names to `"{parent}·{name}"`, keeping
    /// every cross-reference consistent.
    fn disambiguate_homonyms(&self, fact: &mut ChapterFact) {
        let renames: Vec<(String, String)> = fact
            .locations
            .iter()
            .filter(|l| HOMONYM_PRONE.contains(&l.name.as_str()))
            .filter_map(|l| {
                l.parent
                    .as_ref()
                    .map(|p| (l.name.clone(), format!("{p}·{}", l.name)))
            })
            .collect();

        for (old, new) in &renames {
            for location in &mut fact.locations {
                if &location.name == old {
                    location.name = new.clone();
                }
            }
            for character in &mut fact.characters {
                for loc in &mut character.locations_in_chapter {
                    if loc == old {
                        *loc = new.clone();
                    }
                }
            }
            for event in &mut fact.events {
                if event.location.as_deref() == Some(old.as_str()) {
                    event.location = Some(new.clone());
                }
            }
            for spatial in &mut fact.spatial_relationships {
                if &spatial.source == old {
                    spatial.source = new.clone();
                }
                if &spatial.target == old {
                    spatial.target = new.clone();
                }
            }
        }
    }

    fn check_relationships(&self, fact: &mut ChapterFact, known_persons: &HashSet<String>) {
        let chapter_names: HashSet<&str> =
            fact.characters.iter().map(|c| c.name.as_str()).collect();
        for rel in &mut fact.relationships {
            let a_known =
                chapter_names.contains(rel.person_a.as_str()) || known_persons.contains(&rel.person_a);
            let b_known =
                chapter_names.contains(rel.person_b.as_str()) || known_persons.contains(&rel.person_b);
            if !a_known || !b_known {
                rel.confidence = Confidence::Low;
            }
        }
    }

    fn truncate_evidence(&self, fact: &mut ChapterFact) {
        for rel in &mut fact.relationships {
            if char_count(&rel.evidence) > MAX_EVIDENCE_CHARS {
                rel.evidence = truncate_chars(&rel.evidence, MAX_EVIDENCE_CHARS).to_string();
            }
        }
        for spatial in &mut fact.spatial_relationships {
            if char_count(&spatial.narrative_evidence) > MAX_EVIDENCE_CHARS {
                spatial.narrative_evidence =
                    truncate_chars(&spatial.narrative_evidence, MAX_EVIDENCE_CHARS).to_string();
            }
        }
    }
}

/// The generic-name filter: drops bare type words, descriptive phrases and
/// modifier+noun pairs with no proper portion.
pub fn is_generic_location_name(name: &str) -> bool {
    let len = char_count(name);
    if len == 0 {
        return true;
    }
    if len == 1 {
        return GENERIC_SINGLE.contains(&name);
    }
    if name.contains('的') {
        return true;
    }
    if name.starts_with('某') {
        return true;
    }
    if len > 7 {
        // Anything this long reads as narrative description, not a toponym.
        return true;
    }
    if len == 2 {
        let mut chars = name.chars();
        let first = chars.next().map(|c| c.to_string()).unwrap_or_default();
        let second = chars.next().map(|c| c.to_string()).unwrap_or_default();
        let first_generic =
            GENERIC_MODIFIERS.contains(&first.as_str()) || GENERIC_NOUNS.contains(&first.as_str());
        let second_generic = GENERIC_NOUNS.contains(&second.as_str());
        if first_generic && second_generic {
            return true;
        }
    }
    false
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(raw: Value) -> ChapterFact {
        FactValidator::new()
            .validate(raw, &HashSet::new())
            .unwrap()
    }

    #[test]
    fn test_top_level_shape_enforced() {
        let err = FactValidator::new().validate(json!([1, 2]), &HashSet::new());
        assert!(matches!(err, Err(FabulaError::SchemaInvalid(_))));
    }

    #[test]
    fn test_generic_single_char_locations_dropped() {
        let fact = validate(json!({
            "locations": [
                {"name": "山", "type": "山"},
                {"name": "七玄门", "type": "宗门"}
            ]
        }));
        assert_eq!(fact.locations.len(), 1);
        assert_eq!(fact.locations[0].name, "七玄门");
    }

    #[test]
    fn test_modifier_noun_pairs_dropped() {
        assert!(is_generic_location_name("小城"));
        assert!(is_generic_location_name("石屋"));
        assert!(is_generic_location_name("大河"));
        assert!(!is_generic_location_name("落日峰"));
        assert!(!is_generic_location_name("七玄门"));
    }

    #[test]
    fn test_possessive_and_long_phrases_dropped() {
        assert!(is_generic_location_name("韩立的家"));
        assert!(is_generic_location_name("某处山谷"));
        assert!(is_generic_location_name("一座被薄雾笼罩的无名小山"));
    }

    #[test]
    fn test_dropped_location_references_scrubbed() {
        let fact = validate(json!({
            "characters": [{"name": "韩立", "locations_in_chapter": ["小城", "七玄门"]}],
            "locations": [
                {"name": "小城", "type": "城"},
                {"name": "七玄门", "type": "宗门"}
            ],
            "events": [{"summary": "入城", "location": "小城"}],
            "spatial_relationships": [
                {"source": "小城", "target": "七玄门", "relation_type": "direction", "value": "north_of"}
            ]
        }));
        assert_eq!(fact.characters[0].locations_in_chapter, vec!["七玄门"]);
        assert!(fact.events[0].location.is_none());
        assert!(fact.spatial_relationships.is_empty());
    }

    #[test]
    fn test_homonym_renamed_with_cross_references() {
        let fact = validate(json!({
            "characters": [{"name": "韩立", "locations_in_chapter": ["后院"]}],
            "locations": [
                {"name": "七玄门", "type": "宗门"},
                {"name": "后院", "type": "院落", "parent": "七玄门"}
            ],
            "events": [{"summary": "密谈", "location": "后院"}]
        }));
        let renamed = fact.locations.iter().find(|l| l.name == "七玄门·后院");
        assert!(renamed.is_some());
        assert_eq!(fact.characters[0].locations_in_chapter, vec!["七玄门·后院"]);
        assert_eq!(fact.events[0].location.as_deref(), Some("七玄门·后院"));
    }

    #[test]
    fn test_bare_titles_dropped_as_characters() {
        let fact = validate(json!({
            "characters": [{"name": "长老"}, {"name": "墨大夫"}]
        }));
        assert_eq!(fact.characters.len(), 1);
        assert_eq!(fact.characters[0].name, "墨大夫");
    }

    #[test]
    fn test_unknown_relationship_endpoints_downgraded() {
        let mut known = HashSet::new();
        known.insert("墨大夫".to_string());
        let fact = FactValidator::new()
            .validate(
                json!({
                    "characters": [{"name": "韩立"}],
                    "relationships": [
                        {"person_a": "韩立", "person_b": "墨大夫", "relation_type": "师徒", "confidence": "high"},
                        {"person_a": "韩立", "person_b": "神秘人", "relation_type": "仇敌", "confidence": "high"}
                    ]
                }),
                &known,
            )
            .unwrap();
        assert_eq!(fact.relationships[0].confidence, Confidence::High);
        assert_eq!(fact.relationships[1].confidence, Confidence::Low);
    }

    #[test]
    fn test_evidence_truncated() {
        let long = "证".repeat(80);
        let fact = validate(json!({
            "relationships": [{
                "person_a": "甲", "person_b": "乙",
                "relation_type": "朋友", "evidence": long
            }]
        }));
        assert_eq!(char_count(&fact.relationships[0].evidence), 50);
    }
}
