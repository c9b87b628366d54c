//! The per-novel multi-layer world model.
//!
//! A WorldStructure is built incrementally by the world-structure agent and
//! persisted as one JSON value per novel. It always contains at least the
//! overworld layer; portals may only reference layers that already exist.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::models::fact::LocationTier;
use crate::models::overrides::{OverrideType, UserOverride};
use crate::FabulaError;

/// Synthetic top-level node that owns orphan kingdom/continent-tier roots.
pub const UBER_ROOT: &str = "天下";

/// Identifier of the always-present base layer.
pub const OVERWORLD_LAYER: &str = "overworld";

/// Semantically independent plane on which locations are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayerType {
    Celestial,
    Underworld,
    Underwater,
    Instance,
    Pocket,
    #[default]
    #[serde(other)]
    Overworld,
}

/// Cardinal placement of a region on its layer's canvas.
///
/// Convention: +x = east (right on canvas), +y = north (up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CardinalDirection {
    East,
    West,
    South,
    North,
    #[serde(other)]
    Center,
}

/// Physical extent the story spans; determines canvas size and initial zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpatialScale {
    Cosmic,
    National,
    Urban,
    Local,
    #[default]
    #[serde(other)]
    Continental,
}

/// A named region within a layer ("东胜神洲", "北地").
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Region {
    pub name: String,
    pub cardinal_direction: Option<CardinalDirection>,
    #[serde(default)]
    pub region_type: String,
    pub parent_region: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// One layer of the world with its regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorldLayer {
    pub layer_id: String,
    pub name: String,
    #[serde(default)]
    pub layer_type: LayerType,
    #[serde(default)]
    pub regions: Vec<Region>,
}

/// A named connection between two layers, anchored at a location in each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Portal {
    pub name: String,
    pub source_layer: String,
    pub source_location: String,
    pub target_layer: String,
    pub target_location: String,
    #[serde(default)]
    pub is_bidirectional: bool,
    /// Chapter in which the portal was first observed.
    #[serde(default)]
    pub first_chapter: u32,
}

/// Per-novel singleton world model.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldStructure {
    pub layers: Vec<WorldLayer>,
    #[serde(default)]
    pub portals: Vec<Portal>,
    /// location name -> region name (overworld regions).
    #[serde(default)]
    pub location_region_map: BTreeMap<String, String>,
    /// location name -> layer_id.
    #[serde(default)]
    pub location_layer_map: BTreeMap<String, String>,
    /// location name -> parent location name. Acyclic by construction.
    #[serde(default)]
    pub location_parents: BTreeMap<String, String>,
    #[serde(default)]
    pub location_tiers: BTreeMap<String, LocationTier>,
    #[serde(default)]
    pub location_icons: BTreeMap<String, String>,
    #[serde(default)]
    pub spatial_scale: SpatialScale,
    pub novel_genre_hint: Option<String>,
}

impl Default for WorldStructure {
    fn default() -> Self {
        WorldStructure {
            layers: vec![WorldLayer {
                layer_id: OVERWORLD_LAYER.to_string(),
                name: "主世界".to_string(),
                layer_type: LayerType::Overworld,
                regions: Vec::new(),
            }],
            portals: Vec::new(),
            location_region_map: BTreeMap::new(),
            location_layer_map: BTreeMap::new(),
            location_parents: BTreeMap::new(),
            location_tiers: BTreeMap::new(),
            location_icons: BTreeMap::new(),
            spatial_scale: SpatialScale::default(),
            novel_genre_hint: None,
        }
    }
}

impl WorldStructure {
    pub fn has_layer(&self, layer_id: &str) -> bool {
        self.layers.iter().any(|l| l.layer_id == layer_id)
    }

    pub fn layer(&self, layer_id: &str) -> Option<&WorldLayer> {
        self.layers.iter().find(|l| l.layer_id == layer_id)
    }

    pub fn layer_mut(&mut self, layer_id: &str) -> Option<&mut WorldLayer> {
        self.layers.iter_mut().find(|l| l.layer_id == layer_id)
    }

    /// The always-present base layer.
    pub fn overworld(&self) -> &WorldLayer {
        self.layer(OVERWORLD_LAYER)
            .unwrap_or(&self.layers[0])
    }

    /// Add a layer if absent; returns whether it was added.
    pub fn ensure_layer(&mut self, layer_id: &str, name: &str, layer_type: LayerType) -> bool {
        if self.has_layer(layer_id) {
            return false;
        }
        self.layers.push(WorldLayer {
            layer_id: layer_id.to_string(),
            name: name.to_string(),
            layer_type,
            regions: Vec::new(),
        });
        true
    }

    /// Add or update an overworld region by name.
    pub fn upsert_region(&mut self, layer_id: &str, region: Region) {
        let Some(layer) = self.layer_mut(layer_id) else {
            return;
        };
        match layer.regions.iter_mut().find(|r| r.name == region.name) {
            Some(existing) => {
                if existing.cardinal_direction.is_none() {
                    existing.cardinal_direction = region.cardinal_direction;
                }
                if existing.description.is_empty() {
                    existing.description = region.description;
                }
                if existing.region_type.is_empty() {
                    existing.region_type = region.region_type;
                }
            }
            None => layer.regions.push(region),
        }
    }

    /// Insert a portal after checking both endpoints name existing layers.
    pub fn add_portal(&mut self, portal: Portal) -> Result<(), FabulaError> {
        if !self.has_layer(&portal.source_layer) {
            return Err(FabulaError::Validation(format!(
                "portal '{}' references unknown source layer '{}'",
                portal.name, portal.source_layer
            )));
        }
        if !self.has_layer(&portal.target_layer) {
            return Err(FabulaError::Validation(format!(
                "portal '{}' references unknown target layer '{}'",
                portal.name, portal.target_layer
            )));
        }
        if !self.portals.iter().any(|p| p.name == portal.name) {
            self.portals.push(portal);
        }
        Ok(())
    }

    pub fn remove_portal(&mut self, name: &str) -> bool {
        let before = self.portals.len();
        self.portals.retain(|p| p.name != name);
        self.portals.len() != before
    }

    /// Would assigning `parent` to `child` close a cycle?
    pub fn would_cycle(&self, child: &str, parent: &str) -> bool {
        if child == parent {
            return true;
        }
        let mut cursor = parent;
        let mut hops = 0usize;
        while let Some(next) = self.location_parents.get(cursor) {
            if next == child {
                return true;
            }
            cursor = next;
            hops += 1;
            if hops > self.location_parents.len() {
                // Defect in stored data; treat as cyclic rather than loop forever.
                return true;
            }
        }
        false
    }

    /// Assign a parent, rejecting any edge that would create a cycle.
    pub fn set_parent(&mut self, child: &str, parent: &str) -> Result<(), FabulaError> {
        if self.would_cycle(child, parent) {
            return Err(FabulaError::Validation(format!(
                "parent edge {child} -> {parent} would create a cycle"
            )));
        }
        self.location_parents
            .insert(child.to_string(), parent.to_string());
        Ok(())
    }

    /// Full parent chain from root to `name`, e.g. `["越国", "彩霞山", "七玄门"]`.
    pub fn parent_chain(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_string()];
        let mut cursor = name;
        let mut hops = 0usize;
        while let Some(parent) = self.location_parents.get(cursor) {
            chain.push(parent.clone());
            cursor = parent;
            hops += 1;
            if hops > self.location_parents.len() {
                break;
            }
        }
        chain.reverse();
        chain
    }

    /// All location names known to the structure (parents, tiers, layers).
    pub fn known_locations(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .location_tiers
            .keys()
            .chain(self.location_parents.keys())
            .chain(self.location_parents.values())
            .chain(self.location_layer_map.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names.retain(|n| n != UBER_ROOT);
        names
    }

    /// Locations with no parent assignment (excluding the uber-root).
    pub fn orphans(&self) -> Vec<String> {
        self.known_locations()
            .into_iter()
            .filter(|n| !self.location_parents.contains_key(n))
            .collect()
    }

    pub fn tier_of(&self, name: &str) -> LocationTier {
        self.location_tiers.get(name).copied().unwrap_or_default()
    }

    /// Apply user overrides in place. A user value beats any AI-generated
    /// assignment for the same entity-field pair; malformed blobs and
    /// cycle-creating parent edits are skipped.
    pub fn apply_overrides(&mut self, overrides: &[UserOverride]) {
        for user_override in overrides {
            let key = user_override.override_key.as_str();
            let value = &user_override.value;
            match user_override.override_type {
                OverrideType::LocationParent => {
                    if let Some(parent) = string_payload(value, "parent") {
                        self.location_parents.remove(key);
                        let _ = self.set_parent(key, &parent);
                    }
                }
                OverrideType::LocationRegion => {
                    if let Some(region) = string_payload(value, "region") {
                        self.location_region_map.insert(key.to_string(), region);
                    }
                }
                OverrideType::LocationLayer => {
                    if let Some(layer) = string_payload(value, "layer") {
                        self.location_layer_map.insert(key.to_string(), layer);
                    }
                }
                OverrideType::LocationTier => {
                    if let Ok(tier) = serde_json::from_value::<LocationTier>(
                        string_payload(value, "tier")
                            .map(serde_json::Value::String)
                            .unwrap_or_else(|| value.clone()),
                    ) {
                        self.location_tiers.insert(key.to_string(), tier);
                    }
                }
                OverrideType::AddPortal => {
                    if let Ok(portal) = serde_json::from_value::<Portal>(value.clone()) {
                        let _ = self.add_portal(portal);
                    }
                }
                OverrideType::DeletePortal => {
                    self.remove_portal(key);
                }
                // Consumed by the layout solver, not the structure.
                OverrideType::LocationCoordinate => {}
            }
        }
    }
}

/// Accept both a bare string value and a `{field: "..."}` wrapper.
fn string_payload(value: &serde_json::Value, field: &str) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get(field).and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_overworld() {
        let ws = WorldStructure::default();
        assert_eq!(ws.layers.len(), 1);
        assert_eq!(ws.overworld().layer_id, OVERWORLD_LAYER);
        assert_eq!(ws.overworld().layer_type, LayerType::Overworld);
    }

    #[test]
    fn test_portal_requires_existing_layers() {
        let mut ws = WorldStructure::default();
        let portal = Portal {
            name: "登天梯".into(),
            source_layer: OVERWORLD_LAYER.into(),
            source_location: "昆仑山".into(),
            target_layer: "celestial".into(),
            target_location: "南天门".into(),
            is_bidirectional: true,
            first_chapter: 12,
        };
        assert!(ws.add_portal(portal.clone()).is_err());

        ws.ensure_layer("celestial", "天界", LayerType::Celestial);
        assert!(ws.add_portal(portal).is_ok());
        assert_eq!(ws.portals.len(), 1);
    }

    #[test]
    fn test_parent_cycle_rejected() {
        let mut ws = WorldStructure::default();
        ws.set_parent("七玄门", "彩霞山").unwrap();
        ws.set_parent("彩霞山", "越国").unwrap();
        assert!(ws.set_parent("越国", "七玄门").is_err());
        assert!(ws.set_parent("越国", "越国").is_err());
    }

    #[test]
    fn test_parent_chain_renders_root_first() {
        let mut ws = WorldStructure::default();
        ws.set_parent("七玄门", "彩霞山").unwrap();
        ws.set_parent("彩霞山", "越国").unwrap();
        assert_eq!(ws.parent_chain("七玄门"), vec!["越国", "彩霞山", "七玄门"]);
    }

    #[test]
    fn test_roundtrip() {
        let mut ws = WorldStructure::default();
        ws.ensure_layer("celestial", "天界", LayerType::Celestial);
        ws.location_tiers
            .insert("越国".into(), LocationTier::Kingdom);
        let json = serde_json::to_string(&ws).unwrap();
        let back: WorldStructure = serde_json::from_str(&json).unwrap();
        assert_eq!(ws, back);
    }
}
