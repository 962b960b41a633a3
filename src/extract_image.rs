//! OCR extraction for photographed or scanned pages.

use std::sync::Arc;

use tracing::warn;

use study_harness_core::error::ExtractionError;
use study_harness_core::models::{Locator, Provenance, TextSegment};
use study_harness_core::services::{OcrEngine, OcrImage};

use crate::extract::image_mime;

pub struct ImageOcrExtractor {
    ocr: Arc<dyn OcrEngine>,
    confidence_threshold: f32,
}

impl ImageOcrExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>, confidence_threshold: f32) -> Self {
        Self {
            ocr,
            confidence_threshold,
        }
    }

    /// One segment per non-empty OCR region, in the engine's reading order.
    /// Engines that report no regions yield a single segment for the whole image.
    pub async fn extract(&self, document_id: &str, bytes: &[u8]) -> Result<Vec<TextSegment>, ExtractionError> {
        let mime = image_mime(bytes).ok_or_else(|| {
            ExtractionError::UnsupportedFormat("not a recognised image format".to_string())
        })?;
        let image = OcrImage {
            bytes: bytes.to_vec(),
            mime: mime.to_string(),
        };
        let output = self.ocr.recognize(&image).await.map_err(|e| {
            ExtractionError::ExternalServiceUnavailable(format!("OCR engine: {}", e))
        })?;

        let mut pieces: Vec<(u32, String, f32)> = output
            .regions
            .into_iter()
            .enumerate()
            .filter(|(_, r)| !r.text.trim().is_empty())
            .map(|(i, r)| (i as u32, r.text, r.confidence))
            .collect();
        if pieces.is_empty() && !output.text.trim().is_empty() {
            pieces.push((0, output.text, output.confidence));
        }

        let low = pieces
            .iter()
            .filter(|(_, _, c)| *c < self.confidence_threshold)
            .count();
        if low > 0 {
            warn!(document_id, regions = low, "low-confidence OCR regions");
        }

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(ordinal, (region, text, confidence))| {
                let locator = Locator::Region {
                    image: 0,
                    first: region,
                    last: region,
                };
                TextSegment::new(
                    document_id,
                    ordinal as u32,
                    Provenance::with_confidence(locator, confidence, self.confidence_threshold),
                    text,
                )
            })
            .collect())
    }
}
