// Library exports for the labelling pipeline
//
// detection -> recognition -> classification, with a hot-swappable detector model

pub mod api;
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use crate::core::{
    config::Config,
    errors::{LifecycleError, PipelineError, Stage, StageFailure},
    types::{ClassificationResult, LeafCategory, MajorTopic, ProcessRequest, ProcessResponse},
};

pub use middleware::{ApiKeyGate, CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::{Collaborators, PipelineOrchestrator, PipelineSettings};

pub use services::{ModelLifecycleManager, ServedModelSource};

pub use utils::Metrics;
