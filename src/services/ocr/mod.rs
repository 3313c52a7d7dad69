// Recognition engine seam and its HTTP implementation

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::{StageFailure, StageResult};
use crate::core::types::ImageRef;
use crate::middleware::circuit_breaker::CircuitBreakerStats;
use crate::services::http::{endpoint, StageHttpClient};

#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Decode one string per input image, in input order.
    ///
    /// A per-item failure is reported as `None` (or an empty string); only a
    /// failure of the whole batch is an `Err`.
    async fn recognize_batch(&self, images: &[ImageRef]) -> StageResult<Vec<Option<String>>>;

    /// Breaker state of the underlying service, when it has one
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        None
    }
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    image_paths: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    texts: Vec<Option<String>>,
}

/// Recognition engine reached over HTTP
pub struct HttpRecognitionEngine {
    client: StageHttpClient,
    base_url: String,
}

impl HttpRecognitionEngine {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Self::with_timeout(&config.services.recognition_url, config.stage_timeout())
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: StageHttpClient::new("recognition", timeout)?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl RecognitionEngine for HttpRecognitionEngine {
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.client.circuit_stats())
    }

    #[instrument(skip(self, images), fields(batch_size = images.len()))]
    async fn recognize_batch(&self, images: &[ImageRef]) -> StageResult<Vec<Option<String>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let request = RecognizeRequest {
            image_paths: images.iter().map(ImageRef::as_str).collect(),
        };
        let response: RecognizeResponse = self
            .client
            .post_json(&endpoint(&self.base_url, "/recognize"), &request)
            .await?;

        if response.texts.len() != images.len() {
            return Err(StageFailure::Malformed(format!(
                "recognition returned {} texts for {} images",
                response.texts.len(),
                images.len()
            )));
        }

        debug!("Recognized {} regions", response.texts.len());
        Ok(response.texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_failed_items() {
        let response: RecognizeResponse =
            serde_json::from_str(r#"{"texts": ["가로 4", null, "", "넓이"]}"#).unwrap();
        assert_eq!(response.texts.len(), 4);
        assert_eq!(response.texts[1], None);
        assert_eq!(response.texts[2].as_deref(), Some(""));
    }

    #[test]
    fn test_request_preserves_order() {
        let images = [ImageRef::new("c/2.png"), ImageRef::new("c/1.png")];
        let request = RecognizeRequest {
            image_paths: images.iter().map(ImageRef::as_str).collect(),
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"image_paths":["c/2.png","c/1.png"]}"#
        );
    }
}
