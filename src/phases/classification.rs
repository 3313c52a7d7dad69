// Classification phase: major topic, then a leaf within that topic's roadmap
//
// Major-phase failures fail the request. Leaf-phase failures are logged and
// resolve to no leaf.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{PipelineResult, Stage, StageContext};
use crate::core::roadmap::{RoadmapTree, Roadmaps};
use crate::core::types::{ClassificationResult, LeafCategory, MajorTopic};
use crate::phases::bounded;
use crate::services::concept::ConceptModel;
use crate::utils::Metrics;

pub struct ClassificationPhase {
    model: Arc<dyn ConceptModel>,
    roadmaps: Arc<Roadmaps>,
    stage_timeout: Duration,
    metrics: Metrics,
}

impl ClassificationPhase {
    pub fn new(
        model: Arc<dyn ConceptModel>,
        roadmaps: Arc<Roadmaps>,
        stage_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            model,
            roadmaps,
            stage_timeout,
            metrics,
        }
    }

    #[instrument(skip(self, text), fields(text_len = text.len()))]
    pub async fn classify(&self, text: &str) -> PipelineResult<ClassificationResult> {
        let start = Instant::now();
        let concepts = bounded(self.stage_timeout, self.model.extract_concepts(text))
            .await
            .in_stage(Stage::Classification)?;
        let answer = bounded(self.stage_timeout, self.model.determine_major_topic(&concepts))
            .await
            .in_stage(Stage::Classification)?;
        let major = answer.as_deref().and_then(|raw| {
            let topic = MajorTopic::from_label(raw);
            if topic.is_none() {
                warn!("Major topic answer '{}' matches no known topic", raw);
            }
            topic
        });
        let major_latency_seconds = start.elapsed().as_secs_f64();

        let Some(topic) = major else {
            info!("Problem is unclassifiable");
            self.metrics.record_unclassified();
            return Ok(ClassificationResult {
                major_category: None,
                leaf_category: None,
                major_latency_seconds,
                leaf_latency_seconds: 0.0,
            });
        };

        let start = Instant::now();
        let leaf = self.resolve_leaf(&concepts, topic).await;
        let leaf_latency_seconds = start.elapsed().as_secs_f64();

        if leaf.is_none() {
            self.metrics.record_low_confidence_leaf();
        }
        info!(
            "Classified as '{}' / {}",
            topic,
            leaf.as_ref().map(|l| l.name.as_str()).unwrap_or("-")
        );

        Ok(ClassificationResult {
            major_category: Some(topic),
            leaf_category: leaf,
            major_latency_seconds,
            leaf_latency_seconds,
        })
    }

    async fn resolve_leaf(&self, concepts: &str, topic: MajorTopic) -> Option<LeafCategory> {
        let Some(tree) = self.roadmaps.get(topic) else {
            warn!("No roadmap loaded for '{}'", topic);
            return None;
        };

        let answer = bounded(
            self.stage_timeout,
            self.model.select_leaf(concepts, topic, &tree),
        )
        .await;

        match answer {
            Ok(Some(raw)) => resolve_in_tree(&tree, &raw),
            Ok(None) => {
                warn!("No leaf of '{}' matches the problem", topic);
                None
            }
            Err(e) => {
                warn!("Leaf selection for '{}' failed: {}", topic, e);
                None
            }
        }
    }
}

/// Resolve a model answer strictly inside `tree`
fn resolve_in_tree(tree: &RoadmapTree, raw: &str) -> Option<LeafCategory> {
    let leaf = tree.resolve(raw);
    match &leaf {
        Some(leaf) => debug!("Leaf answer '{}' resolved to '{}'", raw, leaf.name),
        None => warn!(
            "Leaf answer '{}' is not a leaf of '{}'",
            raw,
            tree.topic()
        ),
    }
    leaf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::PipelineError;
    use crate::testing::StubConcepts;
    use serde_json::json;

    fn roadmaps() -> Arc<Roadmaps> {
        let shape = RoadmapTree::from_json(
            MajorTopic::ShapeAndMeasurement,
            &json!({"도형과 측정": {"평면도형의 넓이": ["도형의 넓이", "원의 넓이"], "측정": ["길이 재기"]}}),
        )
        .unwrap();
        let number = RoadmapTree::from_json(
            MajorTopic::NumberAndOperation,
            &json!({"수와 연산": {"분수": ["분수의 덧셈"]}}),
        )
        .unwrap();
        Arc::new(Roadmaps::new([shape, number]))
    }

    fn phase(model: StubConcepts) -> (ClassificationPhase, Arc<StubConcepts>, Metrics) {
        let model = Arc::new(model);
        let metrics = Metrics::new();
        let phase = ClassificationPhase::new(
            model.clone(),
            roadmaps(),
            Duration::from_secs(5),
            metrics.clone(),
        );
        (phase, model, metrics)
    }

    const RECTANGLE: &str = "A rectangle has width 4 and height 5; find its area";

    #[tokio::test]
    async fn test_rectangle_area_scenario() {
        let (phase, _, _) = phase(StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이")));
        let result = phase.classify(RECTANGLE).await.unwrap();

        assert_eq!(result.major_category, Some(MajorTopic::ShapeAndMeasurement));
        let leaf = result.leaf_category.unwrap();
        assert_eq!(leaf.name, "도형의 넓이");
        assert_eq!(leaf.path, vec!["도형과 측정".to_string(), "평면도형의 넓이".to_string()]);
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let (phase, _, _) = phase(StubConcepts::answering(Some(" 도형과 측정 "), Some("도형의넓이")));
        let first = phase.classify(RECTANGLE).await.unwrap();
        let second = phase.classify(RECTANGLE).await.unwrap();
        assert_eq!(first.major_category, second.major_category);
        assert_eq!(first.leaf_category, second.leaf_category);
    }

    #[tokio::test]
    async fn test_leaf_from_other_topic_never_returned() {
        let (phase, _, metrics) = phase(StubConcepts::answering(Some("도형과 측정"), Some("분수의 덧셈")));
        let result = phase.classify(RECTANGLE).await.unwrap();

        assert_eq!(result.major_category, Some(MajorTopic::ShapeAndMeasurement));
        assert_eq!(result.leaf_category, None);
        assert_eq!(metrics.snapshot().low_confidence_leaves, 1);
    }

    #[tokio::test]
    async fn test_unclassifiable_skips_leaf_phase() {
        let (phase, model, metrics) = phase(StubConcepts::answering(None, Some("도형의 넓이")));
        let result = phase.classify("hello").await.unwrap();

        assert_eq!(result.major_category, None);
        assert_eq!(result.leaf_category, None);
        assert_eq!(result.leaf_latency_seconds, 0.0);
        assert_eq!(model.leaf_calls(), 0);
        assert_eq!(metrics.snapshot().unclassified_results, 1);
    }

    #[tokio::test]
    async fn test_topic_without_roadmap_has_no_leaf() {
        let (phase, model, _) = phase(StubConcepts::answering(Some("자료와 가능성"), Some("그래프")));
        let result = phase.classify("survey").await.unwrap();

        assert_eq!(result.major_category, Some(MajorTopic::DataAndPossibility));
        assert_eq!(result.leaf_category, None);
        assert_eq!(model.leaf_calls(), 0);
    }

    #[tokio::test]
    async fn test_leaf_failure_swallowed_major_failure_propagates() {
        let mut model = StubConcepts::answering(Some("도형과 측정"), None);
        model.leaf_fails = true;
        let (leaf_phase, _, _) = phase(model);
        let result = leaf_phase.classify(RECTANGLE).await.unwrap();
        assert_eq!(result.major_category, Some(MajorTopic::ShapeAndMeasurement));
        assert_eq!(result.leaf_category, None);

        let mut model = StubConcepts::answering(Some("도형과 측정"), Some("도형의 넓이"));
        model.major_fails = true;
        let (major_phase, _, _) = phase(model);
        let err = major_phase.classify(RECTANGLE).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailed {
                stage: Stage::Classification,
                ..
            }
        ));
    }
}
