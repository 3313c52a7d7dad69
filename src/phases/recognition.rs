// Recognition phase: ordered text per detected region
//
// Cropped regions are recognized in sub-batches that run concurrently; results
// are re-assembled in region order. A region that fails to decode contributes
// an empty string. A failed sub-batch fails the request.

use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::core::errors::{PipelineResult, Stage, StageContext, StageFailure, StageResult};
use crate::core::types::{DetectedRegions, ImageRef, RecognizedText};
use crate::phases::bounded;
use crate::services::ocr::RecognitionEngine;
use crate::utils::Metrics;

pub struct RecognitionPhase {
    engine: Arc<dyn RecognitionEngine>,
    chunk_size: usize,
    stage_timeout: Duration,
    metrics: Metrics,
}

impl RecognitionPhase {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        chunk_size: usize,
        stage_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            engine,
            chunk_size: chunk_size.max(1),
            stage_timeout,
            metrics,
        }
    }

    /// Recognize text for `image`'s regions, grouped under the image's key
    #[instrument(skip(self, detected), fields(image = %image, strategy = detected.strategy()))]
    pub async fn execute(
        &self,
        image: &ImageRef,
        detected: &DetectedRegions,
    ) -> PipelineResult<RecognizedText> {
        let texts = match detected {
            // the direct engine already transcribed its regions
            DetectedRegions::Direct {
                texts: Some(texts), ..
            } => texts.clone(),
            DetectedRegions::Direct { texts: None, .. } => {
                self.recognize_ordered(std::slice::from_ref(image)).await?
            }
            DetectedRegions::Cropped(regions) => {
                let crops = regions
                    .crops()
                    .ok_or_else(|| {
                        StageFailure::Malformed("cropped regions without crop images".to_string())
                    })
                    .in_stage(Stage::Recognition)?;
                self.recognize_ordered(crops).await?
            }
        };

        let mut recognized = RecognizedText::default();
        recognized.insert_group(image.group_key(), texts);
        Ok(recognized)
    }

    async fn recognize_ordered(&self, images: &[ImageRef]) -> PipelineResult<Vec<String>> {
        let chunks = images
            .chunks(self.chunk_size)
            .map(|chunk| self.recognize_chunk(chunk));
        let results = try_join_all(chunks).await.in_stage(Stage::Recognition)?;

        let mut recovered = 0;
        let texts: Vec<String> = results
            .into_iter()
            .flatten()
            .map(|text| {
                text.unwrap_or_else(|| {
                    recovered += 1;
                    String::new()
                })
            })
            .collect();

        if recovered > 0 {
            warn!(
                "{} of {} regions failed recognition, using empty text",
                recovered,
                texts.len()
            );
            self.metrics.record_recovered_recognition_items(recovered);
        }
        debug!("Recognized {} regions", texts.len());
        Ok(texts)
    }

    async fn recognize_chunk(&self, chunk: &[ImageRef]) -> StageResult<Vec<Option<String>>> {
        let texts = bounded(self.stage_timeout, self.engine.recognize_batch(chunk)).await?;
        if texts.len() != chunk.len() {
            return Err(StageFailure::Malformed(format!(
                "recognition returned {} texts for {} regions",
                texts.len(),
                chunk.len()
            )));
        }
        Ok(texts)
    }
}
