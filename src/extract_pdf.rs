//! PDF extraction.
//!
//! Text is pulled page by page with `pdf-extract`. A page without embedded
//! text is treated as scanned: its image XObjects are located with `lopdf`
//! and sent to the OCR engine, and the page's segment carries the OCR
//! confidence. Pages below the confidence threshold are kept and flagged.

use std::sync::Arc;

use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use study_harness_core::error::ExtractionError;
use study_harness_core::models::{Locator, Provenance, TextSegment};
use study_harness_core::services::{OcrEngine, OcrImage};

/// How far up the page tree to look for inherited `/Resources`.
const MAX_PARENT_DEPTH: usize = 16;

pub struct PdfExtractor {
    ocr: Arc<dyn OcrEngine>,
    max_pages: usize,
    confidence_threshold: f32,
}

impl PdfExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>, max_pages: usize, confidence_threshold: f32) -> Self {
        Self {
            ocr,
            max_pages,
            confidence_threshold,
        }
    }

    pub async fn extract(
        &self,
        document_id: &str,
        bytes: Arc<Vec<u8>>,
    ) -> Result<Vec<TextSegment>, ExtractionError> {
        if !bytes.starts_with(b"%PDF") {
            return Err(ExtractionError::CorruptSource(
                "missing %PDF header".to_string(),
            ));
        }

        let pages = page_texts(bytes.clone(), self.max_pages).await?;

        let mut scanned: Option<Option<ScannedPages>> = None;
        let mut segments = Vec::new();
        for (idx, text) in pages.into_iter().enumerate() {
            let page_no = idx as u32 + 1;
            let locator = Locator::Page { page: page_no };
            if !text.trim().is_empty() {
                segments.push((Provenance::new(locator), text));
                continue;
            }

            let parsed = scanned.get_or_insert_with(|| match ScannedPages::load(&bytes) {
                Ok(pages) => Some(pages),
                Err(e) => {
                    warn!(document_id, error = %e, "cannot read page images, skipping OCR");
                    None
                }
            });
            let images = match parsed {
                Some(s) => s.images_on_page(page_no),
                None => Vec::new(),
            };
            if images.is_empty() {
                debug!(document_id, page = page_no, "page has no text and no usable images");
                continue;
            }

            let mut texts = Vec::new();
            let mut confidence: Option<f32> = None;
            for image in &images {
                let output = self.ocr.recognize(image).await.map_err(|e| {
                    ExtractionError::ExternalServiceUnavailable(format!("OCR engine: {}", e))
                })?;
                if output.text.trim().is_empty() {
                    continue;
                }
                texts.push(output.text);
                confidence = Some(confidence.map_or(output.confidence, |c| c.min(output.confidence)));
            }
            let Some(confidence) = confidence else {
                continue;
            };

            let provenance = Provenance::with_confidence(locator, confidence, self.confidence_threshold);
            if provenance.low_confidence {
                warn!(document_id, page = page_no, confidence, "low-confidence OCR page");
            }
            segments.push((provenance, texts.join("\n")));
        }

        Ok(segments
            .into_iter()
            .enumerate()
            .map(|(ordinal, (provenance, text))| {
                TextSegment::new(document_id, ordinal as u32, provenance, text)
            })
            .collect())
    }
}

/// Per-page text of the first `max_pages` pages.
///
/// `pdf-extract` can panic on malformed input, so it runs on the blocking
/// pool where a panic surfaces as a join error instead of unwinding the task.
async fn page_texts(bytes: Arc<Vec<u8>>, max_pages: usize) -> Result<Vec<String>, ExtractionError> {
    let joined = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&bytes))
        .await
        .map_err(|e| ExtractionError::CorruptSource(format!("PDF parser crashed: {}", e)))?;
    let mut pages = joined.map_err(|e| ExtractionError::CorruptSource(e.to_string()))?;
    pages.truncate(max_pages);
    Ok(pages)
}

/// Parsed document used to pull page images for OCR.
struct ScannedPages {
    doc: Document,
}

impl ScannedPages {
    fn load(bytes: &[u8]) -> Result<Self, ExtractionError> {
        let doc = Document::load_mem(bytes)
            .map_err(|e| ExtractionError::CorruptSource(format!("PDF structure: {}", e)))?;
        Ok(Self { doc })
    }

    fn images_on_page(&self, page_no: u32) -> Vec<OcrImage> {
        let Some(page_id) = self.doc.get_pages().get(&page_no).copied() else {
            return Vec::new();
        };
        let Some(resources) = self.resources(page_id) else {
            return Vec::new();
        };
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|o| self.resolve_dict(o))
        else {
            return Vec::new();
        };

        let mut images = Vec::new();
        for (_, obj) in xobjects.iter() {
            let Ok(id) = obj.as_reference() else { continue };
            let Ok(stream) = self.doc.get_object(id).and_then(Object::as_stream) else {
                continue;
            };
            let is_image = stream
                .dict
                .get(b"Subtype")
                .and_then(Object::as_name)
                .map(|n| n == b"Image")
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            match image_mime_for_filter(&stream.dict) {
                Some(mime) => images.push(OcrImage {
                    bytes: stream.content.clone(),
                    mime: mime.to_string(),
                }),
                None => debug!(page = page_no, object = ?id, "skipping image with unsupported encoding"),
            }
        }
        images
    }

    /// The page's `/Resources`, following inheritance through `/Parent`.
    fn resources(&self, page_id: ObjectId) -> Option<&Dictionary> {
        let mut node = self.doc.get_dictionary(page_id).ok()?;
        for _ in 0..MAX_PARENT_DEPTH {
            if let Some(res) = node.get(b"Resources").ok().and_then(|o| self.resolve_dict(o)) {
                return Some(res);
            }
            let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
            node = self.doc.get_dictionary(parent).ok()?;
        }
        None
    }

    fn resolve_dict<'a>(&'a self, obj: &'a Object) -> Option<&'a Dictionary> {
        let (_, resolved) = self.doc.dereference(obj).ok()?;
        resolved.as_dict().ok()
    }
}

/// Encoded image formats the OCR engine can take as-is.
fn image_mime_for_filter(dict: &Dictionary) -> Option<&'static str> {
    let filter = dict.get(b"Filter").ok()?;
    let name = match filter {
        Object::Name(n) => n.as_slice(),
        // A filter chain means the stream is not a plain encoded image.
        Object::Array(items) if items.len() == 1 => items[0].as_name().ok()?,
        _ => return None,
    };
    match name {
        b"DCTDecode" => Some("image/jpeg"),
        b"JPXDecode" => Some("image/jp2"),
        _ => None,
    }
}
