// Request orchestration

pub mod pipeline_orchestrator;

pub use pipeline_orchestrator::{Collaborators, PipelineOrchestrator, PipelineSettings};
