// Pipeline phases: detection -> recognition -> classification

pub mod classification;
pub mod detection;
pub mod recognition;

pub use classification::ClassificationPhase;
pub use detection::{DetectionPhase, StrategyResult};
pub use recognition::RecognitionPhase;

use std::future::Future;
use std::time::Duration;

use crate::core::errors::{StageFailure, StageResult};

/// Bound one collaborator call; an elapsed call is a `Timeout` failure
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> StageResult<T>
where
    F: Future<Output = StageResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StageFailure::Timeout { after: limit }))
}
