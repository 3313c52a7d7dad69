// Detection phase: direct strategy first, two-step fallback at most once

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{PipelineResult, Stage, StageContext, StageFailure};
use crate::core::types::{DetectedRegions, DirectDetection, ImageRef, RegionSet};
use crate::phases::bounded;
use crate::services::detection::DetectionEngine;
use crate::services::model_manager::ServedModelSource;
use crate::utils::Metrics;

/// Why the direct strategy did not settle the request
#[derive(Debug)]
pub enum FallbackReason {
    NoRegions,
    Failed(StageFailure),
}

/// Outcome of the direct-polygon strategy
#[derive(Debug)]
pub enum StrategyResult {
    DirectSuccess {
        regions: RegionSet,
        texts: Option<Vec<String>>,
    },
    NeedsFallback(FallbackReason),
}

impl StrategyResult {
    /// Drop empty polygons, keeping engine-supplied texts aligned with them
    fn from_direct(detection: DirectDetection) -> Self {
        let DirectDetection { polygons, texts } = detection;
        let texts = match texts {
            Some(texts) if texts.len() == polygons.len() => Some(texts),
            Some(texts) => {
                warn!(
                    "Direct detection returned {} texts for {} polygons; ignoring texts",
                    texts.len(),
                    polygons.len()
                );
                None
            }
            None => None,
        };

        let (regions, texts) = match texts {
            Some(texts) => {
                let (polygons, texts): (Vec<_>, Vec<_>) = polygons
                    .into_iter()
                    .zip(texts)
                    .filter(|(polygon, _)| !polygon.is_empty())
                    .unzip();
                (RegionSet::from_polygons(polygons), Some(texts))
            }
            None => (RegionSet::from_polygons(polygons), None),
        };

        if regions.is_empty() {
            StrategyResult::NeedsFallback(FallbackReason::NoRegions)
        } else {
            StrategyResult::DirectSuccess { regions, texts }
        }
    }
}

pub struct DetectionPhase {
    engine: Arc<dyn DetectionEngine>,
    served_model: Arc<dyn ServedModelSource>,
    stage_timeout: Duration,
    metrics: Metrics,
}

impl DetectionPhase {
    pub fn new(
        engine: Arc<dyn DetectionEngine>,
        served_model: Arc<dyn ServedModelSource>,
        stage_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            engine,
            served_model,
            stage_timeout,
            metrics,
        }
    }

    /// Run the direct strategy and classify its outcome
    pub async fn try_direct(&self, image: &ImageRef) -> StrategyResult {
        match bounded(self.stage_timeout, self.engine.detect_direct(image)).await {
            Ok(Some(detection)) => StrategyResult::from_direct(detection),
            Ok(None) => StrategyResult::NeedsFallback(FallbackReason::NoRegions),
            Err(e) => StrategyResult::NeedsFallback(FallbackReason::Failed(e)),
        }
    }

    /// Detect text regions. An empty result is returned as-is; deciding what
    /// that means is up to the caller.
    #[instrument(skip(self), fields(image = %image))]
    pub async fn execute(&self, image: &ImageRef) -> PipelineResult<DetectedRegions> {
        let reason = match self.try_direct(image).await {
            StrategyResult::DirectSuccess { regions, texts } => {
                debug!("Direct strategy found {} regions", regions.len());
                return Ok(DetectedRegions::Direct { regions, texts });
            }
            StrategyResult::NeedsFallback(reason) => reason,
        };

        match &reason {
            FallbackReason::NoRegions => info!("Direct strategy found no regions, falling back"),
            FallbackReason::Failed(e) => warn!("Direct strategy failed ({}), falling back", e),
        }
        self.metrics.record_detection_fallback();

        // one fallback per request, never retried
        let served = self.served_model.served();
        let detection = bounded(
            self.stage_timeout,
            self.engine.detect_two_step(&served.path, image),
        )
        .await
        .in_stage(Stage::Detection)?;

        let failed = detection.failed_boxes.len();
        let regions = detection.into_region_set().in_stage(Stage::Detection)?;
        debug!(
            "Two-step strategy (model generation {}) kept {} regions, {} failed boxes",
            served.generation,
            regions.len(),
            failed
        );
        Ok(DetectedRegions::Cropped(regions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::PipelineError;
    use crate::core::types::TwoStepDetection;
    use crate::testing::{square, FixedModel, StubDetection};

    fn phase(engine: StubDetection) -> (DetectionPhase, Arc<StubDetection>, Metrics) {
        let engine = Arc::new(engine);
        let metrics = Metrics::new();
        let phase = DetectionPhase::new(
            engine.clone(),
            Arc::new(FixedModel::new("models/detector.pt")),
            Duration::from_secs(5),
            metrics.clone(),
        );
        (phase, engine, metrics)
    }

    #[tokio::test]
    async fn test_direct_success_skips_fallback() {
        let (phase, engine, metrics) = phase(StubDetection::direct(vec![square(0), square(1)]));
        let detected = phase.execute(&ImageRef::new("p1.png")).await.unwrap();

        assert_eq!(detected.strategy(), "direct");
        assert_eq!(detected.regions().len(), 2);
        assert!(detected.regions().crops().is_none());
        assert_eq!(engine.two_step_calls(), 0);
        assert_eq!(metrics.snapshot().detection_fallbacks, 0);
    }

    #[tokio::test]
    async fn test_empty_direct_falls_back_once() {
        let (phase, engine, metrics) = phase(StubDetection::two_step(TwoStepDetection {
            boxes: vec![square(0), square(1), square(2)],
            failed_boxes: vec![square(9)],
            crops: vec![
                Some(ImageRef::new("c/0.png")),
                None,
                Some(ImageRef::new("c/2.png")),
            ],
        }));

        let detected = phase.execute(&ImageRef::new("p1.png")).await.unwrap();
        assert_eq!(detected.strategy(), "two_step");
        assert_eq!(detected.regions().polygons(), &[square(0), square(2)]);
        assert_eq!(engine.two_step_calls(), 1);
        assert_eq!(
            engine.last_model_path().as_deref(),
            Some(std::path::Path::new("models/detector.pt"))
        );
        assert_eq!(metrics.snapshot().detection_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_direct_failure_falls_back() {
        let mut engine = StubDetection::two_step(TwoStepDetection::default());
        engine.direct_fails = true;
        let (phase, engine, _) = phase(engine);

        let detected = phase.execute(&ImageRef::new("p1.png")).await.unwrap();
        assert!(detected.regions().is_empty());
        assert_eq!(engine.two_step_calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_fatal_and_not_retried() {
        let mut engine = StubDetection::two_step(TwoStepDetection::default());
        engine.two_step_fails = true;
        let (phase, engine, _) = phase(engine);

        let err = phase.execute(&ImageRef::new("p1.png")).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                stage: Stage::Detection,
                ..
            }
        ));
        assert_eq!(engine.two_step_calls(), 1);
    }

    #[test]
    fn test_direct_texts_stay_aligned() {
        let result = StrategyResult::from_direct(DirectDetection {
            polygons: vec![square(0), vec![], square(2)],
            texts: Some(vec!["a".into(), "ghost".into(), "c".into()]),
        });
        match result {
            StrategyResult::DirectSuccess { regions, texts } => {
                assert_eq!(regions.len(), 2);
                assert_eq!(texts.unwrap(), vec!["a".to_string(), "c".to_string()]);
            }
            other => panic!("expected DirectSuccess, got {:?}", other),
        }
    }
}
