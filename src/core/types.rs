// Data model shared by the pipeline stages and the HTTP surface

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::errors::{PipelineError, StageFailure};

/// Polygon of integer image coordinates
pub type Polygon = Vec<[i32; 2]>;

/// Opaque reference to an image (object key or path understood by the stage services)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Grouping key for recognized text: the file stem of the reference
    pub fn group_key(&self) -> String {
        Path::new(&self.0)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.0)
            .to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inbound request: one image to label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub file_name: String,
    pub image_path: String,
}

impl ProcessRequest {
    pub fn validate(&self) -> Result<ImageRef, PipelineError> {
        if self.file_name.trim().is_empty() {
            return Err(PipelineError::Validation("file_name is empty".to_string()));
        }
        if self.image_path.trim().is_empty() {
            return Err(PipelineError::Validation("image_path is empty".to_string()));
        }
        Ok(ImageRef::new(self.image_path.trim()))
    }
}

/// Detected regions, with optional crops kept in lockstep with the polygons
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionSet {
    polygons: Vec<Polygon>,
    crops: Option<Vec<ImageRef>>,
}

impl RegionSet {
    /// Regions without materialized crops (direct mode)
    pub fn from_polygons(polygons: Vec<Polygon>) -> Self {
        let polygons = polygons.into_iter().filter(|p| !p.is_empty()).collect();
        Self { polygons, crops: None }
    }

    /// Regions paired with their crops. A region whose crop is missing is
    /// dropped together with its polygon; order is never changed.
    pub fn from_cropped(candidates: Vec<(Polygon, Option<ImageRef>)>) -> Self {
        let (polygons, crops) = candidates
            .into_iter()
            .filter_map(|(polygon, crop)| match crop {
                Some(crop) if !polygon.is_empty() => Some((polygon, crop)),
                _ => None,
            })
            .unzip();
        Self {
            polygons,
            crops: Some(crops),
        }
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn crops(&self) -> Option<&[ImageRef]> {
        self.crops.as_deref()
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }
}

/// Output of the direct-polygon strategy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectDetection {
    pub polygons: Vec<Polygon>,
    /// Per-polygon transcriptions when the engine produces them itself
    #[serde(default)]
    pub texts: Option<Vec<String>>,
}

/// Output of the detect-then-refine strategy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwoStepDetection {
    pub boxes: Vec<Polygon>,
    #[serde(default)]
    pub failed_boxes: Vec<Polygon>,
    /// One entry per box; `None` where no valid crop could be produced
    pub crops: Vec<Option<ImageRef>>,
}

impl TwoStepDetection {
    pub fn into_region_set(self) -> Result<RegionSet, StageFailure> {
        if self.boxes.len() != self.crops.len() {
            return Err(StageFailure::Malformed(format!(
                "two-step detection returned {} boxes but {} crop entries",
                self.boxes.len(),
                self.crops.len()
            )));
        }
        Ok(RegionSet::from_cropped(
            self.boxes.into_iter().zip(self.crops).collect(),
        ))
    }
}

/// Regions handed from detection to recognition
#[derive(Debug, Clone)]
pub enum DetectedRegions {
    /// Direct strategy succeeded; text may already be attached
    Direct {
        regions: RegionSet,
        texts: Option<Vec<String>>,
    },
    /// Fallback strategy produced cropped regions
    Cropped(RegionSet),
}

impl DetectedRegions {
    pub fn regions(&self) -> &RegionSet {
        match self {
            DetectedRegions::Direct { regions, .. } => regions,
            DetectedRegions::Cropped(regions) => regions,
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            DetectedRegions::Direct { .. } => "direct",
            DetectedRegions::Cropped(_) => "two_step",
        }
    }
}

/// Recognized text per grouping key, joined in region order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognizedText {
    groups: BTreeMap<String, String>,
}

impl RecognizedText {
    /// Join per-region strings with a single space, keeping region order.
    /// Empty strings from recovered failures are skipped.
    pub fn insert_group<I, S>(&mut self, key: impl Into<String>, texts: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = texts
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        self.groups.insert(key.into(), joined);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.groups.get(key).map(String::as_str)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&str, &str)> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The four fixed major topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MajorTopic {
    NumberAndOperation,
    ChangeAndRelationship,
    ShapeAndMeasurement,
    DataAndPossibility,
}

impl MajorTopic {
    pub const ALL: [MajorTopic; 4] = [
        MajorTopic::NumberAndOperation,
        MajorTopic::ChangeAndRelationship,
        MajorTopic::ShapeAndMeasurement,
        MajorTopic::DataAndPossibility,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MajorTopic::NumberAndOperation => "수와 연산",
            MajorTopic::ChangeAndRelationship => "변화와 관계",
            MajorTopic::ShapeAndMeasurement => "도형과 측정",
            MajorTopic::DataAndPossibility => "자료와 가능성",
        }
    }

    pub fn roadmap_file(&self) -> &'static str {
        match self {
            MajorTopic::NumberAndOperation => "01_num_cal.json",
            MajorTopic::ChangeAndRelationship => "02_change_of_relationship.json",
            MajorTopic::ShapeAndMeasurement => "03_shape_meas.json",
            MajorTopic::DataAndPossibility => "04_data_and_possibility.json",
        }
    }

    /// Match a model answer against the topic labels; whitespace and quoting are ignored
    pub fn from_label(raw: &str) -> Option<Self> {
        let wanted = normalize_label(raw);
        if wanted.is_empty() {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|topic| normalize_label(topic.label()) == wanted)
    }
}

impl fmt::Display for MajorTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lowercase, strip whitespace and surrounding punctuation
pub(crate) fn normalize_label(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '.' | '`' | '[' | ']'))
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Resolved leaf subtopic within a major topic's roadmap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCategory {
    pub name: String,
    /// Ancestor node names from the topic root down to (excluding) the leaf
    pub path: Vec<String>,
}

/// Classification outcome; `None` categories are a valid result
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub major_category: Option<MajorTopic>,
    pub leaf_category: Option<LeafCategory>,
    pub major_latency_seconds: f64,
    pub leaf_latency_seconds: f64,
}

/// Successful response body for one request
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub file_name: String,
    pub major_category: Option<String>,
    pub leaf_category: Option<LeafCategory>,
    pub major_latency_seconds: f64,
    pub leaf_latency_seconds: f64,
    pub status: &'static str,
}

impl ProcessResponse {
    pub fn new(file_name: String, result: ClassificationResult) -> Self {
        Self {
            file_name,
            major_category: result.major_category.map(|t| t.label().to_string()),
            leaf_category: result.leaf_category,
            major_latency_seconds: result.major_latency_seconds,
            leaf_latency_seconds: result.leaf_latency_seconds,
            status: "success",
        }
    }
}

/// Credential-gated model update request
#[derive(Debug, Clone, Deserialize)]
pub struct ModelUpdateRequest {
    pub s3_key: String,
}

/// Inbound "model ready" notification from the model registry
#[derive(Debug, Clone, Deserialize)]
pub struct ModelUpdateEvent {
    pub model_name: String,
    pub version: i64,
    pub status: String,
    /// Object key of the new artifact
    pub source: String,
}

impl ModelUpdateEvent {
    pub fn is_ready(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("ready")
    }
}

/// Lifecycle state machine of the model manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Swapping,
    RollingBack,
}

/// Snapshot of the artifact currently served to detection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedModel {
    pub path: PathBuf,
    /// Incremented on every successful swap or rollback
    pub generation: u64,
    pub remote_key: Option<String>,
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: i32) -> Polygon {
        vec![[x, 0], [x + 1, 0], [x + 1, 1], [x, 1]]
    }

    #[test]
    fn test_cropped_regions_drop_in_lockstep() {
        let regions = RegionSet::from_cropped(vec![
            (square(0), Some(ImageRef::new("crop_0.png"))),
            (square(1), None),
            (square(2), Some(ImageRef::new("crop_2.png"))),
        ]);

        assert_eq!(regions.polygons(), &[square(0), square(2)]);
        let crops: Vec<_> = regions.crops().unwrap().iter().map(|c| c.as_str()).collect();
        assert_eq!(crops, vec!["crop_0.png", "crop_2.png"]);
    }

    #[test]
    fn test_two_step_length_mismatch_is_malformed() {
        let detection = TwoStepDetection {
            boxes: vec![square(0), square(1)],
            failed_boxes: vec![],
            crops: vec![Some(ImageRef::new("a.png"))],
        };
        assert!(matches!(
            detection.into_region_set(),
            Err(StageFailure::Malformed(_))
        ));
    }

    #[test]
    fn test_recognized_text_join_order() {
        let mut text = RecognizedText::default();
        text.insert_group("page", ["first", "", " second ", "third"]);
        assert_eq!(text.get("page"), Some("first second third"));
    }

    #[test]
    fn test_major_topic_from_label() {
        assert_eq!(
            MajorTopic::from_label(" \"도형과  측정\" "),
            Some(MajorTopic::ShapeAndMeasurement)
        );
        assert_eq!(MajorTopic::from_label("기하"), None);
        assert_eq!(MajorTopic::from_label(""), None);
    }

    #[test]
    fn test_request_validation() {
        let ok = ProcessRequest {
            file_name: "p1.png".to_string(),
            image_path: "uploads/p1.png".to_string(),
        };
        assert_eq!(ok.validate().unwrap().group_key(), "p1");

        let bad = ProcessRequest {
            file_name: "p1.png".to_string(),
            image_path: "  ".to_string(),
        };
        assert!(matches!(bad.validate(), Err(PipelineError::Validation(_))));
    }
}
