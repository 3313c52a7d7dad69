// Error taxonomy for the labelling pipeline
//
// Stage collaborators report `StageFailure`; the orchestrator tags it with the
// stage that produced it. Model lifecycle faults live in `LifecycleError` and
// never touch request handling.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline stage, used to tag fatal failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Detection,
    Recognition,
    Classification,
    Persistence,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Recognition => "recognition",
            Stage::Classification => "classification",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single call to an external collaborator
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {}s", after.as_secs_f64())]
    Timeout { after: Duration },

    #[error("service rejected the call with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("circuit breaker open for {service}, failing fast")]
    CircuitOpen { service: String },
}

impl StageFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageFailure::Timeout { .. })
    }
}

impl From<reqwest::Error> for StageFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StageFailure::Malformed(err.to_string())
        } else {
            StageFailure::Unavailable(err.to_string())
        }
    }
}

/// Terminal outcome of one pipeline request
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no text regions detected")]
    NoRegionsDetected,

    #[error("recognized text is empty")]
    EmptyRecognizedText,

    #[error("{stage} stage failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: StageFailure,
    },

    #[error("no file record found for {file_name}")]
    RecordNotFound { file_name: String },
}

impl PipelineError {
    /// Short machine-readable tag for API responses and metrics
    pub fn tag(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::NoRegionsDetected => "no_regions_detected",
            PipelineError::EmptyRecognizedText => "empty_recognized_text",
            PipelineError::StageFailed { source, .. } if source.is_timeout() => "stage_timeout",
            PipelineError::StageFailed { .. } => "stage_unavailable",
            PipelineError::RecordNotFound { .. } => "record_not_found",
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::StageFailed { stage, .. } => Some(*stage),
            PipelineError::RecordNotFound { .. } => Some(Stage::Persistence),
            _ => None,
        }
    }
}

/// Artifact store errors
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("artifact fetch timed out after {}s", after.as_secs_f64())]
    Timeout { after: Duration },

    #[error("artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Model artifact validation errors
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model file missing: {0}")]
    Missing(PathBuf),

    #[error("model file is empty: {0}")]
    Empty(PathBuf),

    #[error("unrecognized model format in {path}")]
    UnknownFormat { path: PathBuf },

    #[error("model rejected by runtime: {0}")]
    Rejected(String),

    #[error("model I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Model lifecycle (hot-swap / rollback) errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("model swap to {remote_key} failed after {attempts} attempts: {last_error}")]
    SwapExhausted {
        remote_key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("model key '{0}' does not name an artifact")]
    InvalidKey(String),

    #[error("no backup model available for rollback")]
    NoBackupAvailable,

    #[error("another model swap or rollback is in progress")]
    SwapInProgress,

    #[error("model at {path} is not loadable: {source}")]
    ModelNotLoadable {
        path: PathBuf,
        #[source]
        source: LoadError,
    },

    #[error("model file operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("model lifecycle task failed: {0}")]
    TaskJoinFailed(String),
}

/// Roadmap loading errors
#[derive(Debug, Error)]
pub enum RoadmapError {
    #[error("failed to read roadmap {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse roadmap {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("roadmap for {topic} contains no leaf categories")]
    NoLeaves { topic: String },
}

/// Label persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("no file record named {0}")]
    RecordNotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<tokio_postgres::Error> for PersistenceError {
    fn from(err: tokio_postgres::Error) -> Self {
        PersistenceError::Database(err.to_string())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid service URL for {name}: {value}")]
    InvalidServiceUrl { name: &'static str, value: String },

    #[error("{name} must be > 0, got {value}")]
    NonPositive { name: &'static str, value: u64 },

    #[error("S3_BUCKET_NAME must be set when ARTIFACT_STORE=s3")]
    MissingBucket,

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("unknown {name}: {value}")]
    UnknownVariant { name: &'static str, value: String },

    #[error("served model path has no file name: {0}")]
    InvalidModelPath(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type StageResult<T> = Result<T, StageFailure>;
pub type LifecycleResult<T> = Result<T, LifecycleError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Attach the failing stage to a collaborator result
pub trait StageContext<T> {
    fn in_stage(self, stage: Stage) -> PipelineResult<T>;
}

impl<T> StageContext<T> for StageResult<T> {
    fn in_stage(self, stage: Stage) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::StageFailed { stage, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_context_tags_stage() {
        let result: StageResult<()> = Err(StageFailure::Unavailable("down".to_string()));
        let err = result.in_stage(Stage::Recognition).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Recognition));
        assert_eq!(err.tag(), "stage_unavailable");
        assert_eq!(err.to_string(), "recognition stage failed: service unavailable: down");
    }

    #[test]
    fn test_timeout_tag() {
        let err = PipelineError::StageFailed {
            stage: Stage::Detection,
            source: StageFailure::Timeout { after: Duration::from_secs(3) },
        };
        assert_eq!(err.tag(), "stage_timeout");
    }
}
