//! Property tests for the validator's filters and clamping.

mod common;

use std::collections::HashSet;

use fabula::models::{Confidence, LocationTier};
use fabula::services::{is_generic_location_name, FactValidator};
use proptest::prelude::*;

proptest! {
    /// Clamped enums decode any string without failing the chapter.
    #[test]
    fn prop_enum_clamping_total(tier in "[a-z\\u4e00-\\u62ff]{0,12}", conf in "[a-z]{0,8}") {
        let raw = serde_json::json!({
            "locations": [{"name": "七玄门", "type": "宗门", "tier": tier}],
            "spatial_relationships": [{
                "source": "甲", "target": "乙",
                "relation_type": "direction", "value": "north_of", "confidence": conf
            }]
        });
        let fact = FactValidator::new().validate(raw, &HashSet::new()).unwrap();
        // Unknown values land on the documented defaults.
        let known_tiers = [
            LocationTier::World, LocationTier::Continent, LocationTier::Kingdom,
            LocationTier::Region, LocationTier::City, LocationTier::Site,
            LocationTier::Building, LocationTier::Room,
        ];
        prop_assert!(known_tiers.contains(&fact.locations[0].tier));
        let known_conf = [Confidence::Low, Confidence::Medium, Confidence::High];
        prop_assert!(known_conf.contains(&fact.spatial_relationships[0].confidence));
    }

    /// No validated location is a bare generic single character.
    #[test]
    fn prop_no_generic_singletons_survive(name in "[\\u4e00-\\u9fff]{1,9}") {
        let raw = serde_json::json!({
            "locations": [{"name": name, "type": "地点"}]
        });
        let fact = FactValidator::new().validate(raw, &HashSet::new()).unwrap();
        for location in &fact.locations {
            prop_assert!(!is_generic_location_name(&location.name));
        }
    }

    /// Evidence never exceeds 50 characters after validation.
    #[test]
    fn prop_evidence_bounded(evidence in "[\\u4e00-\\u9fff]{0,120}") {
        let raw = serde_json::json!({
            "relationships": [{
                "person_a": "甲某", "person_b": "乙某",
                "relation_type": "朋友", "evidence": evidence
            }]
        });
        let fact = FactValidator::new().validate(raw, &HashSet::new()).unwrap();
        prop_assert!(fact.relationships[0].evidence.chars().count() <= 50);
    }
}
