// In-process stub collaborators for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::{StageFailure, StageResult};
use crate::core::roadmap::RoadmapTree;
use crate::core::types::{
    DirectDetection, ImageRef, MajorTopic, Polygon, ServedModel, TwoStepDetection,
};
use crate::services::concept::ConceptModel;
use crate::services::detection::DetectionEngine;
use crate::services::model_manager::ServedModelSource;
use crate::services::ocr::RecognitionEngine;

pub fn square(x: i32) -> Polygon {
    vec![[x, 0], [x + 1, 0], [x + 1, 1], [x, 1]]
}

pub struct FixedModel(Arc<ServedModel>);

impl FixedModel {
    pub fn new(path: &str) -> Self {
        Self(Arc::new(ServedModel {
            path: PathBuf::from(path),
            generation: 0,
            remote_key: None,
            format: "pytorch".to_string(),
        }))
    }
}

impl ServedModelSource for FixedModel {
    fn served(&self) -> Arc<ServedModel> {
        self.0.clone()
    }
}

#[derive(Default)]
pub struct StubDetection {
    pub direct: Option<DirectDetection>,
    pub two_step: TwoStepDetection,
    pub direct_fails: bool,
    pub two_step_fails: bool,
    direct_calls: AtomicUsize,
    two_step_calls: AtomicUsize,
    last_model_path: Mutex<Option<PathBuf>>,
}

impl StubDetection {
    pub fn direct(polygons: Vec<Polygon>) -> Self {
        Self {
            direct: Some(DirectDetection {
                polygons,
                texts: None,
            }),
            ..Self::default()
        }
    }

    pub fn two_step(detection: TwoStepDetection) -> Self {
        Self {
            two_step: detection,
            ..Self::default()
        }
    }

    pub fn direct_calls(&self) -> usize {
        self.direct_calls.load(Ordering::SeqCst)
    }

    pub fn two_step_calls(&self) -> usize {
        self.two_step_calls.load(Ordering::SeqCst)
    }

    pub fn last_model_path(&self) -> Option<PathBuf> {
        self.last_model_path.lock().clone()
    }
}

#[async_trait]
impl DetectionEngine for StubDetection {
    async fn detect_direct(&self, _image: &ImageRef) -> StageResult<Option<DirectDetection>> {
        self.direct_calls.fetch_add(1, Ordering::SeqCst);
        if self.direct_fails {
            return Err(StageFailure::Unavailable("direct detector down".to_string()));
        }
        Ok(self.direct.clone())
    }

    async fn detect_two_step(
        &self,
        served_model: &Path,
        _image: &ImageRef,
    ) -> StageResult<TwoStepDetection> {
        self.two_step_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_model_path.lock() = Some(served_model.to_path_buf());
        if self.two_step_fails {
            return Err(StageFailure::Unavailable("refiner down".to_string()));
        }
        Ok(self.two_step.clone())
    }
}

/// Recognizes images from a fixed table; unknown images fail per item
#[derive(Default)]
pub struct StubRecognition {
    pub texts: HashMap<String, String>,
    /// Per-image latency, to shuffle completion order
    pub delays: HashMap<String, Duration>,
    pub batch_fails: bool,
    calls: AtomicUsize,
    items: AtomicUsize,
}

impl StubRecognition {
    pub fn with<const N: usize>(pairs: [(&str, &str); N]) -> Self {
        Self {
            texts: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn items(&self) -> usize {
        self.items.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionEngine for StubRecognition {
    async fn recognize_batch(&self, images: &[ImageRef]) -> StageResult<Vec<Option<String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items.fetch_add(images.len(), Ordering::SeqCst);
        if self.batch_fails {
            return Err(StageFailure::Unavailable("recognizer down".to_string()));
        }
        let slowest = images
            .iter()
            .filter_map(|i| self.delays.get(i.as_str()))
            .max()
            .copied();
        if let Some(delay) = slowest {
            tokio::time::sleep(delay).await;
        }
        Ok(images
            .iter()
            .map(|i| self.texts.get(i.as_str()).cloned())
            .collect())
    }
}

/// Concept model answering from fixed strings
#[derive(Default)]
pub struct StubConcepts {
    pub major: Option<String>,
    pub leaf: Option<String>,
    pub major_fails: bool,
    pub leaf_fails: bool,
    calls: AtomicUsize,
    leaf_calls: AtomicUsize,
}

impl StubConcepts {
    pub fn answering(major: Option<&str>, leaf: Option<&str>) -> Self {
        Self {
            major: major.map(str::to_string),
            leaf: leaf.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn leaf_calls(&self) -> usize {
        self.leaf_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConceptModel for StubConcepts {
    async fn extract_concepts(&self, text: &str) -> StageResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("concepts of: {}", text))
    }

    async fn determine_major_topic(&self, _concepts: &str) -> StageResult<Option<String>> {
        if self.major_fails {
            return Err(StageFailure::Rejected {
                status: 500,
                body: "overloaded".to_string(),
            });
        }
        Ok(self.major.clone())
    }

    async fn select_leaf(
        &self,
        _concepts: &str,
        _topic: MajorTopic,
        _tree: &RoadmapTree,
    ) -> StageResult<Option<String>> {
        self.leaf_calls.fetch_add(1, Ordering::SeqCst);
        if self.leaf_fails {
            return Err(StageFailure::Malformed("garbled answer".to_string()));
        }
        Ok(self.leaf.clone())
    }
}
