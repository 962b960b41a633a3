//! Source extraction: turns a submitted payload into ordered text segments.
//!
//! [`SourceExtractor`] is a closed set of variants, one per [`SourceKind`],
//! with a single [`extract`](SourceExtractor::extract) capability. Every
//! variant returns segments in reading order with contiguous ordinals, and
//! re-running it on unchanged input yields the same sequence (OCR and fetch
//! results permitting), which is what makes extraction restartable.
//!
//! | Kind | Variant | Notes |
//! |------|---------|-------|
//! | `pdf` | [`PdfExtractor`] | embedded text per page, OCR for scanned pages |
//! | `image` | [`ImageOcrExtractor`] | one segment per OCR region |
//! | `web_page` | [`WebPageExtractor`] | one segment per block element |
//! | `plain_text` | [`PlainTextExtractor`] | one segment per paragraph |
//! | `youtube` | [`TranscriptExtractor`] | one segment per caption snippet |

use std::sync::Arc;
use std::time::Duration;

use study_harness_core::error::ExtractionError;
use study_harness_core::models::{Locator, Provenance, SourceDocument, SourceKind, SourcePayload, TextSegment};
use study_harness_core::services::{HtmlFetcher, OcrEngine, TranscriptApi};

use crate::config::Config;

pub use crate::extract_image::ImageOcrExtractor;
pub use crate::extract_pdf::PdfExtractor;
pub use crate::extract_web::WebPageExtractor;
pub use crate::extract_youtube::TranscriptExtractor;

/// Limits shared by all extractor variants.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub max_source_bytes: usize,
    pub max_pdf_pages: usize,
    pub ocr_confidence_threshold: f32,
    pub fetch_timeout: Duration,
    pub max_transcript_chars: usize,
    pub transcript_timeout: Duration,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ExtractionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_source_bytes: config.extraction.max_source_bytes,
            max_pdf_pages: config.extraction.max_pdf_pages,
            ocr_confidence_threshold: config.ocr.confidence_threshold,
            fetch_timeout: Duration::from_secs(config.extraction.fetch_timeout_secs),
            max_transcript_chars: config.youtube.max_transcript_chars,
            transcript_timeout: Duration::from_secs(config.youtube.timeout_secs),
        }
    }
}

pub enum SourceExtractor {
    Pdf(PdfExtractor),
    Image(ImageOcrExtractor),
    WebPage(WebPageExtractor),
    PlainText(PlainTextExtractor),
    YouTube(TranscriptExtractor),
}

impl SourceExtractor {
    /// Build the variant for `kind`.
    pub fn for_kind(
        kind: SourceKind,
        settings: &ExtractionSettings,
        ocr: Arc<dyn OcrEngine>,
        fetcher: Arc<dyn HtmlFetcher>,
        transcripts: Arc<dyn TranscriptApi>,
    ) -> Self {
        match kind {
            SourceKind::Pdf => SourceExtractor::Pdf(PdfExtractor::new(
                ocr,
                settings.max_pdf_pages,
                settings.ocr_confidence_threshold,
            )),
            SourceKind::Image => SourceExtractor::Image(ImageOcrExtractor::new(
                ocr,
                settings.ocr_confidence_threshold,
            )),
            SourceKind::WebPage => {
                SourceExtractor::WebPage(WebPageExtractor::new(fetcher, settings.fetch_timeout))
            }
            SourceKind::PlainText => SourceExtractor::PlainText(PlainTextExtractor),
            SourceKind::YouTube => SourceExtractor::YouTube(TranscriptExtractor::new(
                transcripts,
                settings.max_transcript_chars,
                settings.transcript_timeout,
            )),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceExtractor::Pdf(_) => SourceKind::Pdf,
            SourceExtractor::Image(_) => SourceKind::Image,
            SourceExtractor::WebPage(_) => SourceKind::WebPage,
            SourceExtractor::PlainText(_) => SourceKind::PlainText,
            SourceExtractor::YouTube(_) => SourceKind::YouTube,
        }
    }

    /// Extract `doc`'s text. An empty result is success.
    pub async fn extract(
        &self,
        doc: &SourceDocument,
        payload: &SourcePayload,
        max_source_bytes: usize,
    ) -> Result<Vec<TextSegment>, ExtractionError> {
        if let SourcePayload::Bytes(bytes) = payload {
            if bytes.len() > max_source_bytes {
                return Err(ExtractionError::TooLarge {
                    size: bytes.len(),
                    limit: max_source_bytes,
                });
            }
        }

        match (self, payload) {
            (SourceExtractor::Pdf(x), SourcePayload::Bytes(bytes)) => {
                x.extract(&doc.id, bytes.clone()).await
            }
            (SourceExtractor::Image(x), SourcePayload::Bytes(bytes)) => x.extract(&doc.id, bytes).await,
            (SourceExtractor::WebPage(x), SourcePayload::Url(url)) => x.extract(&doc.id, url).await,
            // An uploaded .html file: parse it without fetching.
            (SourceExtractor::WebPage(_), SourcePayload::Bytes(bytes)) => {
                Ok(WebPageExtractor::extract_html(&doc.id, &doc.payload_ref, &String::from_utf8_lossy(bytes)))
            }
            (SourceExtractor::PlainText(x), SourcePayload::Bytes(bytes)) => x.extract(&doc.id, bytes),
            (SourceExtractor::YouTube(x), SourcePayload::Url(url)) => x.extract(&doc.id, url).await,
            (SourceExtractor::YouTube(_), SourcePayload::Bytes(_)) => Err(ExtractionError::UnsupportedFormat(
                "youtube sources must be submitted as a video URL".to_string(),
            )),
            (_, SourcePayload::Url(url)) => Err(ExtractionError::UnsupportedFormat(format!(
                "{} sources must be uploaded, got URL {}",
                self.kind(),
                url
            ))),
        }
    }
}

/// UTF-8 text split into paragraphs on blank lines.
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn extract(&self, document_id: &str, bytes: &[u8]) -> Result<Vec<TextSegment>, ExtractionError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ExtractionError::CorruptSource(format!("not valid UTF-8: {}", e)))?;
        Ok(split_paragraphs(document_id, text.trim_start_matches('\u{feff}')))
    }
}

/// One segment per blank-line separated paragraph.
pub fn split_paragraphs(document_id: &str, text: &str) -> Vec<TextSegment> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let i = i as u32;
            TextSegment::new(
                document_id,
                i,
                Provenance::new(Locator::Text { first: i, last: i }),
                p,
            )
        })
        .collect()
}

/// MIME type of an image from its magic bytes.
pub fn image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else if bytes.len() > 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some("image/tiff")
    } else {
        None
    }
}
