// Pipeline Orchestrator: one request through detection, recognition and classification

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{
    PersistenceError, PipelineError, PipelineResult, Stage, StageFailure,
};
use crate::core::roadmap::Roadmaps;
use crate::core::types::{ClassificationResult, ProcessRequest};
use crate::middleware::CircuitBreakerStats;
use crate::phases::{ClassificationPhase, DetectionPhase, RecognitionPhase};
use crate::services::concept::{ConceptModel, OpenAiConceptModel};
use crate::services::detection::{DetectionEngine, HttpDetectionEngine};
use crate::services::model_manager::ServedModelSource;
use crate::services::ocr::{HttpRecognitionEngine, RecognitionEngine};
use crate::services::storage::{LabelStore, PostgresLabelStore};
use crate::utils::Metrics;

/// Call limits shared by the phases
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub stage_timeout: Duration,
    pub recognition_chunk_size: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            recognition_chunk_size: config.services.recognition_chunk_size,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(60),
            recognition_chunk_size: 8,
        }
    }
}

/// External collaborators the pipeline drives
pub struct Collaborators {
    pub detection: Arc<dyn DetectionEngine>,
    pub recognition: Arc<dyn RecognitionEngine>,
    pub concepts: Arc<dyn ConceptModel>,
    pub served_model: Arc<dyn ServedModelSource>,
    pub roadmaps: Arc<Roadmaps>,
    /// Present when results are persisted
    pub labels: Option<Arc<dyn LabelStore>>,
}

/// Sequences the stages for one request at a time; many requests may run
/// concurrently, each with its own state.
pub struct PipelineOrchestrator {
    detection: DetectionPhase,
    recognition: RecognitionPhase,
    classification: ClassificationPhase,
    labels: Option<Arc<dyn LabelStore>>,
    breakers: Breakers,
    metrics: Metrics,
}

/// Handles kept only to report breaker state
struct Breakers {
    detection: Arc<dyn DetectionEngine>,
    recognition: Arc<dyn RecognitionEngine>,
    concepts: Arc<dyn ConceptModel>,
}

impl PipelineOrchestrator {
    pub fn new(settings: PipelineSettings, collaborators: Collaborators, metrics: Metrics) -> Self {
        let breakers = Breakers {
            detection: collaborators.detection.clone(),
            recognition: collaborators.recognition.clone(),
            concepts: collaborators.concepts.clone(),
        };
        Self {
            detection: DetectionPhase::new(
                collaborators.detection,
                collaborators.served_model,
                settings.stage_timeout,
                metrics.clone(),
            ),
            recognition: RecognitionPhase::new(
                collaborators.recognition,
                settings.recognition_chunk_size,
                settings.stage_timeout,
                metrics.clone(),
            ),
            classification: ClassificationPhase::new(
                collaborators.concepts,
                collaborators.roadmaps,
                settings.stage_timeout,
                metrics.clone(),
            ),
            labels: collaborators.labels,
            breakers,
            metrics,
        }
    }

    /// Circuit breaker state of every stage collaborator that has one
    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        [
            self.breakers.detection.circuit_stats(),
            self.breakers.recognition.circuit_stats(),
            self.breakers.concepts.circuit_stats(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Build the production pipeline from configuration
    #[instrument(skip_all)]
    pub async fn from_config(
        config: Arc<Config>,
        served_model: Arc<dyn ServedModelSource>,
        metrics: Metrics,
    ) -> Result<Self> {
        info!("Initializing services...");

        let roadmaps = Roadmaps::load_dir(&config.classification.roadmap_dir)
            .context("Failed to load roadmaps")?;
        if roadmaps.is_empty() {
            warn!(
                "No roadmaps found in {}; every result will lack a leaf category",
                config.classification.roadmap_dir.display()
            );
        }
        if config.classification.llm_api_key.is_none() {
            warn!("LLM_API_KEY is not set; classification calls are sent unauthenticated");
        }

        let labels: Option<Arc<dyn LabelStore>> = if config.persistence.enabled {
            let store = PostgresLabelStore::connect(&config.persistence)
                .await
                .context("Failed to connect label store")?;
            Some(Arc::new(store))
        } else {
            None
        };

        let collaborators = Collaborators {
            detection: Arc::new(HttpDetectionEngine::new(config.clone())?),
            recognition: Arc::new(HttpRecognitionEngine::new(config.clone())?),
            concepts: Arc::new(OpenAiConceptModel::new(config.clone())?),
            served_model,
            roadmaps: Arc::new(roadmaps),
            labels,
        };

        info!(
            "✓ Ready (roadmaps: {}, persistence: {}, stage timeout: {}s)",
            collaborators.roadmaps.len(),
            collaborators.labels.is_some(),
            config.stage_timeout().as_secs()
        );
        Ok(Self::new(
            PipelineSettings::from_config(&config),
            collaborators,
            metrics,
        ))
    }

    /// Process one request to a terminal result
    #[instrument(skip(self, request), fields(file_name = %request.file_name))]
    pub async fn process(&self, request: &ProcessRequest) -> PipelineResult<ClassificationResult> {
        let start = Instant::now();
        let result = self.run(request).await;

        match &result {
            Ok(classification) => {
                self.metrics.record_request_success();
                info!(
                    "✓ {} labelled in {:.2}s (major: {}, leaf: {})",
                    request.file_name,
                    start.elapsed().as_secs_f64(),
                    classification
                        .major_category
                        .map(|t| t.label())
                        .unwrap_or("-"),
                    classification
                        .leaf_category
                        .as_ref()
                        .map(|l| l.name.as_str())
                        .unwrap_or("-")
                );
            }
            Err(e) => {
                self.metrics.record_request_failure(e.tag());
                error!("✗ {} failed [{}]: {}", request.file_name, e.tag(), e);
            }
        }
        result
    }

    async fn run(&self, request: &ProcessRequest) -> PipelineResult<ClassificationResult> {
        let image = request.validate()?;

        let stage_start = Instant::now();
        let detected = self.detection.execute(&image).await?;
        self.metrics
            .record_stage_duration(Stage::Detection, stage_start.elapsed());
        if detected.regions().is_empty() {
            return Err(PipelineError::NoRegionsDetected);
        }

        let stage_start = Instant::now();
        let recognized = self.recognition.execute(&image, &detected).await?;
        self.metrics
            .record_stage_duration(Stage::Recognition, stage_start.elapsed());
        let text = recognized.get(&image.group_key()).unwrap_or_default();
        if text.trim().is_empty() {
            return Err(PipelineError::EmptyRecognizedText);
        }

        let stage_start = Instant::now();
        let classification = self.classification.classify(text).await?;
        self.metrics
            .record_stage_duration(Stage::Classification, stage_start.elapsed());

        if let Some(labels) = &self.labels {
            let stage_start = Instant::now();
            self.persist(labels.as_ref(), &request.file_name, &classification)
                .await?;
            self.metrics
                .record_stage_duration(Stage::Persistence, stage_start.elapsed());
        }

        Ok(classification)
    }

    async fn persist(
        &self,
        labels: &dyn LabelStore,
        file_name: &str,
        classification: &ClassificationResult,
    ) -> PipelineResult<()> {
        let major = classification.major_category.map(|t| t.label());
        let leaf = classification
            .leaf_category
            .as_ref()
            .map(|l| l.name.as_str());

        labels
            .save(file_name, major, leaf)
            .await
            .map_err(|e| match e {
                PersistenceError::RecordNotFound(file_name) => {
                    PipelineError::RecordNotFound { file_name }
                }
                PersistenceError::Database(detail) => PipelineError::StageFailed {
                    stage: Stage::Persistence,
                    source: StageFailure::Unavailable(detail),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::roadmap::RoadmapTree;
    use crate::core::types::{ImageRef, MajorTopic, TwoStepDetection};
    use crate::services::storage::InMemoryLabelStore;
    use crate::testing::{square, FixedModel, StubConcepts, StubDetection, StubRecognition};
    use serde_json::json;

    struct Harness {
        detection: Arc<StubDetection>,
        recognition: Arc<StubRecognition>,
        concepts: Arc<StubConcepts>,
        metrics: Metrics,
        orchestrator: PipelineOrchestrator,
    }

    fn harness(
        detection: StubDetection,
        recognition: StubRecognition,
        concepts: StubConcepts,
        labels: Option<Arc<dyn LabelStore>>,
    ) -> Harness {
        harness_with_timeout(
            detection,
            recognition,
            concepts,
            labels,
            Duration::from_secs(5),
        )
    }

    fn harness_with_timeout(
        detection: StubDetection,
        recognition: StubRecognition,
        concepts: StubConcepts,
        labels: Option<Arc<dyn LabelStore>>,
        stage_timeout: Duration,
    ) -> Harness {
        let detection = Arc::new(detection);
        let recognition = Arc::new(recognition);
        let concepts = Arc::new(concepts);
        let metrics = Metrics::new();
        let shape = RoadmapTree::from_json(
            MajorTopic::ShapeAndMeasurement,
            &json!({"도형과 측정": {"평면도형의 넓이": ["도형의 넓이", "원의 넓이"]}}),
        )
        .unwrap();

        let orchestrator = PipelineOrchestrator::new(
            PipelineSettings {
                stage_timeout,
                recognition_chunk_size: 2,
            },
            Collaborators {
                detection: detection.clone(),
                recognition: recognition.clone(),
                concepts: concepts.clone(),
                served_model: Arc::new(FixedModel::new("models/detector.pt")),
                roadmaps: Arc::new(Roadmaps::new([shape])),
                labels,
            },
            metrics.clone(),
        );
        Harness {
            detection,
            recognition,
            concepts,
            metrics,
            orchestrator,
        }
    }

    fn request() -> ProcessRequest {
        ProcessRequest {
            file_name: "p1.png".to_string(),
            image_path: "uploads/p1.png".to_string(),
        }
    }

    fn cropped_detection() -> StubDetection {
        StubDetection::two_step(TwoStepDetection {
            boxes: vec![square(0), square(1), square(2)],
            failed_boxes: vec![],
            crops: vec![
                Some(ImageRef::new("crops/p1/0.png")),
                Some(ImageRef::new("crops/p1/1.png")),
                Some(ImageRef::new("crops/p1/2.png")),
            ],
        })
    }

    fn rectangle_recognition() -> StubRecognition {
        StubRecognition::with([
            ("crops/p1/0.png", "A rectangle has width 4"),
            ("crops/p1/1.png", "and height 5;"),
            ("crops/p1/2.png", "find its area"),
        ])
    }

    #[tokio::test]
    async fn test_full_pipeline_with_fallback() {
        let h = harness(
            cropped_detection(),
            rectangle_recognition(),
            StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이")),
            None,
        );

        let result = h.orchestrator.process(&request()).await.unwrap();
        assert_eq!(result.major_category, Some(MajorTopic::ShapeAndMeasurement));
        assert_eq!(result.leaf_category.unwrap().name, "도형의 넓이");
        assert!(result.leaf_latency_seconds >= 0.0);

        assert_eq!(h.detection.direct_calls(), 1);
        assert_eq!(h.detection.two_step_calls(), 1);
        // 3 crops in chunks of 2
        assert_eq!(h.recognition.calls(), 2);

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.detection_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_no_regions_never_calls_downstream() {
        let h = harness(
            StubDetection::two_step(TwoStepDetection::default()),
            rectangle_recognition(),
            StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이")),
            None,
        );

        let err = h.orchestrator.process(&request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoRegionsDetected));
        assert_eq!(h.recognition.calls(), 0);
        assert_eq!(h.concepts.calls(), 0);
        assert_eq!(h.metrics.snapshot().failures_by_tag["no_regions_detected"], 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_terminal() {
        let h = harness(
            cropped_detection(),
            StubRecognition::default(),
            StubConcepts::answering(Some("도형과 측정"), None),
            None,
        );

        let err = h.orchestrator.process(&request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyRecognizedText));
        assert_eq!(h.concepts.calls(), 0);
    }

    #[tokio::test]
    async fn test_unclassifiable_is_success() {
        let h = harness(
            cropped_detection(),
            rectangle_recognition(),
            StubConcepts::answering(None, None),
            None,
        );

        let result = h.orchestrator.process(&request()).await.unwrap();
        assert_eq!(result.major_category, None);
        assert_eq!(result.leaf_category, None);
        assert_eq!(result.leaf_latency_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_validation_error_before_any_stage() {
        let h = harness(
            cropped_detection(),
            rectangle_recognition(),
            StubConcepts::default(),
            None,
        );
        let bad = ProcessRequest {
            file_name: String::new(),
            image_path: "uploads/p1.png".to_string(),
        };

        let err = h.orchestrator.process(&bad).await.unwrap_err();
        assert_eq!(err.tag(), "validation_error");
        assert_eq!(h.detection.direct_calls(), 0);
    }

    #[tokio::test]
    async fn test_recognition_outage_short_circuits() {
        let mut recognition = rectangle_recognition();
        recognition.batch_fails = true;
        let h = harness(cropped_detection(), recognition, StubConcepts::default(), None);

        let err = h.orchestrator.process(&request()).await.unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Recognition));
        assert_eq!(err.tag(), "stage_unavailable");
        assert_eq!(h.concepts.calls(), 0);
    }

    #[tokio::test]
    async fn test_persisted_when_store_configured() {
        let store = Arc::new(InMemoryLabelStore::with_records(["p1.png"]));
        let h = harness(
            cropped_detection(),
            rectangle_recognition(),
            StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이")),
            Some(store.clone()),
        );

        h.orchestrator.process(&request()).await.unwrap();
        let saved = store.results();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].major_category.as_deref(), Some("도형과 측정"));
        assert_eq!(saved[0].leaf_category.as_deref(), Some("도형의 넓이"));
    }

    #[tokio::test]
    async fn test_missing_file_record_is_hard_error() {
        let store = Arc::new(InMemoryLabelStore::default());
        let h = harness(
            cropped_detection(),
            rectangle_recognition(),
            StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이")),
            Some(store.clone()),
        );

        let err = h.orchestrator.process(&request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::RecordNotFound { .. }));
        assert!(store.results().is_empty());
    }

    #[tokio::test]
    async fn test_slow_recognizer_times_out() {
        let mut recognition = rectangle_recognition();
        recognition
            .delays
            .insert("crops/p1/2.png".to_string(), Duration::from_millis(500));
        let h = harness_with_timeout(
            cropped_detection(),
            recognition,
            StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이")),
            None,
            Duration::from_millis(10),
        );

        let err = h.orchestrator.process(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                stage: Stage::Recognition,
                source: StageFailure::Timeout { .. },
            }
        ));
        assert_eq!(err.tag(), "stage_timeout");
        assert_eq!(h.concepts.calls(), 0);
        assert_eq!(h.metrics.snapshot().failures_by_tag["stage_timeout"], 1);
    }

    #[test]
    fn test_stub_collaborators_report_no_breakers() {
        let h = harness(
            cropped_detection(),
            rectangle_recognition(),
            StubConcepts::default(),
            None,
        );
        assert!(h.orchestrator.circuit_stats().is_empty());
    }
}
