//! Pre-scan entity dictionary entries.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Coarse class of a dictionary entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Location,
    Item,
    Org,
    Concept,
    #[default]
    #[serde(other)]
    Unknown,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Location => "location",
            EntityType::Item => "item",
            EntityType::Org => "org",
            EntityType::Concept => "concept",
            EntityType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "person" => EntityType::Person,
            "location" => EntityType::Location,
            "item" => EntityType::Item,
            "org" => EntityType::Org,
            "concept" => EntityType::Concept,
            _ => EntityType::Unknown,
        }
    }
}

/// Which pass produced a classification. Higher priority overwrites lower
/// on merge: `llm > dialogue > title > suffix > freq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DictSource {
    Suffix,
    Title,
    Dialogue,
    Llm,
    #[default]
    #[serde(other)]
    Freq,
}

impl DictSource {
    pub fn priority(self) -> u8 {
        match self {
            DictSource::Freq => 0,
            DictSource::Suffix => 1,
            DictSource::Title => 2,
            DictSource::Dialogue => 3,
            DictSource::Llm => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DictSource::Freq => "freq",
            DictSource::Suffix => "suffix",
            DictSource::Title => "title",
            DictSource::Dialogue => "dialogue",
            DictSource::Llm => "llm",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "suffix" => DictSource::Suffix,
            "title" => DictSource::Title,
            "dialogue" => DictSource::Dialogue,
            "llm" => DictSource::Llm,
            _ => DictSource::Freq,
        }
    }
}

/// One whole-book dictionary entry, keyed by canonical name per novel.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDictEntry {
    pub name: String,
    pub entity_type: EntityType,
    pub frequency: u32,
    pub confidence: f32,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub source: DictSource,
    pub sample_context: Option<String>,
}

impl EntityDictEntry {
    /// Merge a new observation for the same name: classification follows
    /// source priority, frequency takes the max, aliases union.
    pub fn absorb(&mut self, other: EntityDictEntry) {
        if other.source.priority() > self.source.priority() {
            self.entity_type = other.entity_type;
            self.source = other.source;
            self.confidence = other.confidence;
        } else if other.source.priority() == self.source.priority() {
            self.confidence = self.confidence.max(other.confidence);
        }
        self.frequency = self.frequency.max(other.frequency);
        for alias in other.aliases {
            if alias != self.name && !self.aliases.contains(&alias) {
                self.aliases.push(alias);
            }
        }
        if self.sample_context.is_none() {
            self.sample_context = other.sample_context;
        }
    }
}
