pub mod aggregator;
pub mod context;
pub mod extractor;
pub mod layout;
pub mod orchestrator;
pub mod prescan;
pub mod progress;
pub mod qa;
pub mod validator;
pub mod world_agent;

pub use aggregator::{Aggregator, MapData};
pub use context::{ContextBuilder, ContextConfig};
pub use extractor::{ExtractionOutcome, FactExtractor, PROMPT_VERSION};
pub use layout::{
    GeoResolver, GeoType, LayoutInput, LayoutMode, LayoutResult, LayoutSolver, NoopGeoResolver,
    PlacedLocation, SpatialConstraint,
};
pub use orchestrator::Orchestrator;
pub use prescan::{statistical_scan, PreScanner};
pub use progress::ProgressHub;
pub use qa::{collect_stream, QaService};
pub use validator::{is_generic_location_name, FactValidator};
pub use world_agent::{scan_signals, suffix_tier, SignalKind, WorldAgent, WorldSignal};
