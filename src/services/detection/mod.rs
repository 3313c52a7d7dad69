// Detection engine seam and its HTTP implementation
//
// The engine exposes two strategies: a direct polygon detector and a two-step
// detect-then-refine call that runs the locally served detector model.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::StageResult;
use crate::core::types::{DirectDetection, ImageRef, Polygon, TwoStepDetection};
use crate::middleware::circuit_breaker::CircuitBreakerStats;
use crate::services::http::{endpoint, StageHttpClient};

#[async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Direct-polygon strategy. `Ok(None)` means the strategy produced nothing.
    async fn detect_direct(&self, image: &ImageRef) -> StageResult<Option<DirectDetection>>;

    /// Detect-then-refine strategy using the detector artifact at `served_model`
    async fn detect_two_step(
        &self,
        served_model: &Path,
        image: &ImageRef,
    ) -> StageResult<TwoStepDetection>;

    /// Breaker state of the underlying service, when it has one
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        None
    }
}

#[derive(Debug, Serialize)]
struct DirectRequest<'a> {
    image_path: &'a str,
}

#[derive(Debug, Deserialize)]
struct DirectResponse {
    #[serde(default)]
    polygons: Vec<Polygon>,
    #[serde(default)]
    texts: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct TwoStepRequest<'a> {
    image_path: &'a str,
    model_path: String,
}

#[derive(Debug, Deserialize)]
struct TwoStepResponse {
    #[serde(default)]
    boxes: Vec<Polygon>,
    #[serde(default)]
    failed_boxes: Vec<Polygon>,
    #[serde(default)]
    cropped_image_paths: Vec<Option<String>>,
}

impl From<TwoStepResponse> for TwoStepDetection {
    fn from(response: TwoStepResponse) -> Self {
        TwoStepDetection {
            boxes: response.boxes,
            failed_boxes: response.failed_boxes,
            crops: response
                .cropped_image_paths
                .into_iter()
                .map(|p| p.filter(|p| !p.trim().is_empty()).map(ImageRef::new))
                .collect(),
        }
    }
}

/// Detection engine reached over HTTP
pub struct HttpDetectionEngine {
    client: StageHttpClient,
    base_url: String,
}

impl HttpDetectionEngine {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Self::with_timeout(&config.services.detection_url, config.stage_timeout())
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: StageHttpClient::new("detection", timeout)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl DetectionEngine for HttpDetectionEngine {
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.client.circuit_stats())
    }

    #[instrument(skip(self), fields(image = %image))]
    async fn detect_direct(&self, image: &ImageRef) -> StageResult<Option<DirectDetection>> {
        let response: DirectResponse = self
            .client
            .post_json(
                &endpoint(&self.base_url, "/detect/direct"),
                &DirectRequest {
                    image_path: image.as_str(),
                },
            )
            .await?;

        debug!("Direct detection returned {} polygons", response.polygons.len());
        if response.polygons.is_empty() {
            return Ok(None);
        }
        Ok(Some(DirectDetection {
            polygons: response.polygons,
            texts: response.texts,
        }))
    }

    #[instrument(skip(self), fields(image = %image, model = %served_model.display()))]
    async fn detect_two_step(
        &self,
        served_model: &Path,
        image: &ImageRef,
    ) -> StageResult<TwoStepDetection> {
        let response: TwoStepResponse = self
            .client
            .post_json(
                &endpoint(&self.base_url, "/detect/two-step"),
                &TwoStepRequest {
                    image_path: image.as_str(),
                    model_path: served_model.display().to_string(),
                },
            )
            .await?;

        debug!(
            "Two-step detection returned {} boxes ({} failed)",
            response.boxes.len(),
            response.failed_boxes.len()
        );
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_step_response() {
        let json = r#"{
            "boxes": [[[0,0],[10,0],[10,5],[0,5]], [[0,6],[10,6],[10,9],[0,9]]],
            "failed_boxes": [[[20,20],[30,20],[30,25],[20,25]]],
            "cropped_image_paths": ["crops/p1/0.png", null]
        }"#;

        let response: TwoStepResponse = serde_json::from_str(json).unwrap();
        let detection: TwoStepDetection = response.into();
        assert_eq!(detection.boxes.len(), 2);
        assert_eq!(detection.failed_boxes.len(), 1);
        assert_eq!(detection.crops[0], Some(ImageRef::new("crops/p1/0.png")));
        assert_eq!(detection.crops[1], None);

        let regions = detection.into_region_set().unwrap();
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn test_parse_direct_response_without_texts() {
        let response: DirectResponse =
            serde_json::from_str(r#"{"polygons": [[[1,2],[3,4],[5,6]]]}"#).unwrap();
        assert_eq!(response.polygons.len(), 1);
        assert!(response.texts.is_none());
    }
}
