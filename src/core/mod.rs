pub mod config;
pub mod errors;
pub mod roadmap;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    ArtifactError, LifecycleError, LoadError, PersistenceError, PipelineError, RoadmapError,
    Stage, StageFailure,
};
pub use roadmap::{RoadmapTree, Roadmaps};
pub use types::{
    ClassificationResult, DetectedRegions, ImageRef, LeafCategory, MajorTopic, ProcessRequest,
    ProcessResponse, RecognizedText, RegionSet, ServedModel,
};
