pub mod artifact_store;
pub mod label_store;

pub use artifact_store::{ArtifactStore, LocalArtifactStore, S3ArtifactStore};
pub use label_store::{InMemoryLabelStore, LabelRecord, LabelStore, PostgresLabelStore};
