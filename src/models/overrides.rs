//! User overrides: values that beat any AI-generated value for the same
//! (entity, field) pair and survive re-analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the override applies to; the value blob is interpreted by the
/// consuming layer (layout solver, world reads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideType {
    LocationCoordinate,
    LocationParent,
    LocationRegion,
    LocationLayer,
    LocationTier,
    AddPortal,
    DeletePortal,
}

impl OverrideType {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideType::LocationCoordinate => "location_coordinate",
            OverrideType::LocationParent => "location_parent",
            OverrideType::LocationRegion => "location_region",
            OverrideType::LocationLayer => "location_layer",
            OverrideType::LocationTier => "location_tier",
            OverrideType::AddPortal => "add_portal",
            OverrideType::DeletePortal => "delete_portal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "location_coordinate" => OverrideType::LocationCoordinate,
            "location_parent" => OverrideType::LocationParent,
            "location_region" => OverrideType::LocationRegion,
            "location_layer" => OverrideType::LocationLayer,
            "location_tier" => OverrideType::LocationTier,
            "add_portal" => OverrideType::AddPortal,
            "delete_portal" => OverrideType::DeletePortal,
            _ => return None,
        })
    }
}

/// A stored override row, unique per (novel, type, key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOverride {
    pub novel_id: String,
    pub override_type: OverrideType,
    /// Entity the override applies to (location name, portal name, ...).
    pub override_key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Pinned canvas position decoded from a `location_coordinate` value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateOverride {
    pub x: f64,
    pub y: f64,
}
