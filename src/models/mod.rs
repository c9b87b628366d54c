pub mod dictionary;
pub mod fact;
pub mod novel;
pub mod overrides;
pub mod profile;
pub mod task;
pub mod world;

pub use dictionary::{DictSource, EntityDictEntry, EntityType};
pub use fact::{
    AbilityDimension, AbilityGain, ChapterFact, CharacterFact, ConceptFact, Confidence,
    DeclarationType, EventFact, EventKind, Importance, ItemAction, ItemEvent, LocationFact,
    LocationRole, LocationTier, OrgAction, OrgEvent, OrgRelation, RelationshipFact,
    SpatialRelationType, SpatialRelationship, WorldDeclaration,
};
pub use novel::{AnalysisStatus, Chapter, ChapterImport, ChapterMeta, Novel, PrescanStatus};
pub use overrides::{CoordinateOverride, OverrideType, UserOverride};
pub use profile::{
    AbilityMoment, EdgeCategory, Faction, FactionData, GraphData, GraphEdge, GraphNode,
    HoldingStage, ItemProfile, LocationProfile, Membership, OrgProfile, OrgRelationEntry,
    PersonProfile, Profile, RelationshipEvolution, RelationshipStage, TimelineData, TimelineEvent,
};
pub use task::{
    AnalysisEvent, AnalysisTask, CostEstimate, CostSnapshot, ProgressStats, TaskStatus,
};
pub use world::{
    CardinalDirection, LayerType, Portal, Region, SpatialScale, WorldLayer, WorldStructure,
    OVERWORLD_LAYER, UBER_ROOT,
};
