//! Core data models used throughout Study Harness.
//!
//! These types describe the documents, segments, requests and artifacts that
//! flow through the generation pipeline. Segments and artifacts are immutable
//! once produced; only [`GenerationRequest`] and [`SyncRecord`] change state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity;

/// Declared kind of a submitted source. Selects the extractor variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pdf,
    Image,
    WebPage,
    PlainText,
    /// A YouTube video, read through its caption transcript.
    #[serde(rename = "youtube")]
    YouTube,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Image => "image",
            SourceKind::WebPage => "web_page",
            SourceKind::PlainText => "plain_text",
            SourceKind::YouTube => "youtube",
        }
    }

    /// Guess the kind from a file name and its leading bytes.
    ///
    /// Magic bytes win over the extension; the extension is only consulted
    /// when the content is not recognisable.
    pub fn detect(name: &str, bytes: &[u8]) -> Option<SourceKind> {
        if bytes.starts_with(b"%PDF") {
            return Some(SourceKind::Pdf);
        }
        if bytes.starts_with(&[0x89, b'P', b'N', b'G'])
            || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
            || bytes.starts_with(b"GIF8")
            || (bytes.len() > 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
        {
            return Some(SourceKind::Image);
        }
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            if identity::youtube_video_id(name).is_some() {
                return Some(SourceKind::YouTube);
            }
            return Some(SourceKind::WebPage);
        }
        match lower.rsplit_once('.').map(|(_, ext)| ext) {
            Some("pdf") => Some(SourceKind::Pdf),
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tif" | "tiff") => {
                Some(SourceKind::Image)
            }
            Some("txt" | "md" | "text") => Some(SourceKind::PlainText),
            Some("html" | "htm") => Some(SourceKind::WebPage),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(SourceKind::Pdf),
            "image" => Ok(SourceKind::Image),
            "web_page" | "web" | "url" => Ok(SourceKind::WebPage),
            "plain_text" | "text" => Ok(SourceKind::PlainText),
            "youtube" | "video" => Ok(SourceKind::YouTube),
            other => Err(format!("unknown source kind: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Extracted,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Extracted => "extracted",
            ExtractionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ExtractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExtractionStatus::Pending),
            "extracted" => Ok(ExtractionStatus::Extracted),
            "failed" => Ok(ExtractionStatus::Failed),
            other => Err(format!("unknown extraction status: '{}'", other)),
        }
    }
}

/// A submitted piece of learning material.
///
/// The id is content-addressed: the SHA-256 of the raw bytes, or of the
/// canonical URL for web pages. Submitting the same file twice therefore
/// resolves to the same document and reuses its extracted segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub kind: SourceKind,
    /// File name, URL, or other human-readable reference to the payload.
    pub payload_ref: String,
    pub extraction_status: ExtractionStatus,
    pub submitted_at: DateTime<Utc>,
}

impl SourceDocument {
    pub fn from_bytes(kind: SourceKind, payload_ref: &str, bytes: &[u8]) -> Self {
        Self {
            id: identity::document_id_from_bytes(bytes),
            kind,
            payload_ref: payload_ref.to_string(),
            extraction_status: ExtractionStatus::Pending,
            submitted_at: Utc::now(),
        }
    }

    /// A web page, or a YouTube video when the URL names one. Every URL
    /// shape of one video maps to the same document.
    pub fn from_url(url: &str) -> Self {
        let (kind, canonical) = match identity::youtube_video_id(url) {
            Some(video_id) => (SourceKind::YouTube, identity::youtube_watch_url(&video_id)),
            None => (SourceKind::WebPage, identity::canonical_url(url)),
        };
        Self {
            id: identity::document_id_from_url(&canonical),
            kind,
            payload_ref: canonical,
            extraction_status: ExtractionStatus::Pending,
            submitted_at: Utc::now(),
        }
    }
}

/// The raw material handed to an extractor. Never persisted.
#[derive(Debug, Clone)]
pub enum SourcePayload {
    Bytes(Arc<Vec<u8>>),
    Url(String),
}

impl SourcePayload {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        SourcePayload::Bytes(Arc::new(bytes))
    }

    pub fn len(&self) -> usize {
        match self {
            SourcePayload::Bytes(b) => b.len(),
            SourcePayload::Url(u) => u.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a segment came from inside its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Locator {
    /// A PDF page (1-based), whether its text was embedded or OCR'd.
    Page { page: u32 },
    /// A span of OCR regions inside one image.
    Region { image: u32, first: u32, last: u32 },
    /// A run of block elements inside one section of a web page.
    Web {
        url: String,
        section: u32,
        path: String,
        blocks: u32,
    },
    /// A span of paragraphs in a plain-text file.
    Text { first: u32, last: u32 },
    /// A span of caption snippets in a video transcript.
    Transcript { video_id: String, first: u32, last: u32 },
}

impl Locator {
    /// True when two locators sit inside the same page/section and may be merged.
    pub fn same_boundary(&self, other: &Locator) -> bool {
        match (self, other) {
            (Locator::Page { page: a }, Locator::Page { page: b }) => a == b,
            (Locator::Region { image: a, .. }, Locator::Region { image: b, .. }) => a == b,
            (
                Locator::Web {
                    url: ua,
                    section: sa,
                    ..
                },
                Locator::Web {
                    url: ub,
                    section: sb,
                    ..
                },
            ) => ua == ub && sa == sb,
            (Locator::Text { .. }, Locator::Text { .. }) => true,
            (
                Locator::Transcript { video_id: a, .. },
                Locator::Transcript { video_id: b, .. },
            ) => a == b,
            _ => false,
        }
    }

    /// Widen `self` to also cover `next`. Callers check [`same_boundary`](Self::same_boundary) first.
    pub fn extend(&self, next: &Locator) -> Locator {
        match (self, next) {
            (
                Locator::Region { image, first, .. },
                Locator::Region { last, .. },
            ) => Locator::Region {
                image: *image,
                first: *first,
                last: *last,
            },
            (
                Locator::Web {
                    url,
                    section,
                    path,
                    blocks,
                },
                Locator::Web { blocks: more, .. },
            ) => Locator::Web {
                url: url.clone(),
                section: *section,
                path: path.clone(),
                blocks: blocks + more,
            },
            (Locator::Text { first, .. }, Locator::Text { last, .. }) => Locator::Text {
                first: *first,
                last: *last,
            },
            (
                Locator::Transcript {
                    video_id, first, ..
                },
                Locator::Transcript { last, .. },
            ) => Locator::Transcript {
                video_id: video_id.clone(),
                first: *first,
                last: *last,
            },
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Page { page } => write!(f, "page {}", page),
            Locator::Region { image, first, last } if first == last => {
                write!(f, "image {} region {}", image, first)
            }
            Locator::Region { image, first, last } => {
                write!(f, "image {} regions {}-{}", image, first, last)
            }
            Locator::Web { url, path, .. } => write!(f, "{} {}", url, path),
            Locator::Text { first, last } if first == last => write!(f, "paragraph {}", first),
            Locator::Text { first, last } => write!(f, "paragraphs {}-{}", first, last),
            Locator::Transcript {
                video_id,
                first,
                last,
            } => write!(f, "video {} captions {}-{}", video_id, first, last),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub locator: Locator,
    /// OCR confidence in `[0, 1]`; `None` for embedded or fetched text.
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub low_confidence: bool,
    /// Index of this piece when an oversized segment was split.
    #[serde(default)]
    pub part: u32,
}

impl Provenance {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            confidence: None,
            low_confidence: false,
            part: 0,
        }
    }

    pub fn with_confidence(locator: Locator, confidence: f32, threshold: f32) -> Self {
        Self {
            locator,
            confidence: Some(confidence),
            low_confidence: confidence < threshold,
            part: 0,
        }
    }
}

/// An ordered unit of text inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSegment {
    pub segment_id: String,
    pub source_document_id: String,
    pub ordinal: u32,
    pub provenance: Provenance,
    pub text: String,
    pub token_count: usize,
}

impl TextSegment {
    /// Build a segment with a deterministic id derived from its position and text.
    pub fn new(source_document_id: &str, ordinal: u32, provenance: Provenance, text: String) -> Self {
        Self {
            segment_id: identity::segment_id(source_document_id, ordinal, &text),
            source_document_id: source_document_id.to_string(),
            ordinal,
            token_count: crate::normalize::estimate_tokens(&text),
            provenance,
            text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Flashcards,
    Quiz,
    Summary,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Flashcards => "flashcards",
            ArtifactType::Quiz => "quiz",
            ArtifactType::Summary => "summary",
        }
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flashcards" | "flashcard" => Ok(ArtifactType::Flashcards),
            "quiz" => Ok(ArtifactType::Quiz),
            "summary" => Ok(ArtifactType::Summary),
            other => Err(format!(
                "unknown artifact type: '{}'. Must be flashcards, quiz, or summary.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty: '{}'", other)),
        }
    }
}

/// Caller-chosen knobs for a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Items requested per AI call (ignored for summaries).
    pub item_count: u32,
    pub difficulty: Difficulty,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            item_count: 10,
            difficulty: Difficulty::Medium,
        }
    }
}

/// Why a request ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Extraction { message: String },
    ExternalService { message: String },
    MalformedResponse { message: String },
    PersistenceError { message: String },
    Cancelled,
    Internal { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Extraction { message } => write!(f, "extraction failed: {}", message),
            FailureReason::ExternalService { message } => {
                write!(f, "external service failed: {}", message)
            }
            FailureReason::MalformedResponse { message } => {
                write!(f, "malformed AI response: {}", message)
            }
            FailureReason::PersistenceError { message } => {
                write!(f, "persistence failed: {}", message)
            }
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

/// Per-request pipeline state. See [`crate::request`] for the transition rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestStatus {
    Created,
    Extracting,
    Normalizing,
    Prompting,
    AwaitingAi,
    Parsing,
    Deduplicating,
    Persisting,
    Completed,
    NoContent,
    Failed { reason: FailureReason },
}

impl RequestStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RequestStatus::Created => "created",
            RequestStatus::Extracting => "extracting",
            RequestStatus::Normalizing => "normalizing",
            RequestStatus::Prompting => "prompting",
            RequestStatus::AwaitingAi => "awaiting_ai",
            RequestStatus::Parsing => "parsing",
            RequestStatus::Deduplicating => "deduplicating",
            RequestStatus::Persisting => "persisting",
            RequestStatus::Completed => "completed",
            RequestStatus::NoContent => "no_content",
            RequestStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::NoContent | RequestStatus::Failed { .. }
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// The last stage whose output is retained, used to resume after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    #[default]
    None,
    Extracted,
    Normalized,
    Parsed,
    Deduplicated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub request_id: String,
    pub source_document_id: String,
    pub artifact_type: ArtifactType,
    pub options: GenerationOptions,
    /// Normalized chunks consumed by this request, in reading order.
    pub chunk_ids: Vec<String>,
    pub status: RequestStatus,
    pub checkpoint: Checkpoint,
    /// Non-fatal notices such as low-confidence OCR pages.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Every artifact this request resolved to, including ones that already existed.
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    /// Artifacts newly created by this request (after deduplication).
    #[serde(default)]
    pub new_artifacts: usize,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub retries: u32,
    /// Quiz items this request re-masters instead of reading the source text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regenerated_from: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A rendered prompt ready for the AI service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiPrompt {
    pub prompt_id: String,
    pub request_id: String,
    pub rendered_text: String,
    pub token_budget: usize,
    pub included_chunk_ids: Vec<String>,
    pub dropped_chunk_ids: Vec<String>,
    /// Set when chunks were dropped to stay within the budget.
    pub truncated: bool,
    /// Set when this prompt asks the model to fix a previous response.
    pub correction: bool,
}

/// Inclusive range of chunk ordinals an artifact was generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpan {
    pub first: u32,
    pub last: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactBody {
    Flashcard {
        front: String,
        back: String,
    },
    QuizItem {
        question: String,
        choices: Vec<String>,
        correct_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    SummaryBlock {
        heading: String,
        body: String,
    },
}

impl ArtifactBody {
    pub fn artifact_type(&self) -> ArtifactType {
        match self {
            ArtifactBody::Flashcard { .. } => ArtifactType::Flashcards,
            ArtifactBody::QuizItem { .. } => ArtifactType::Quiz,
            ArtifactBody::SummaryBlock { .. } => ArtifactType::Summary,
        }
    }
}

/// A generated flashcard, quiz item or summary block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyArtifact {
    /// Content hash; see [`identity::artifact_id`].
    pub artifact_id: String,
    pub request_id: String,
    pub source_document_id: String,
    pub source_span: SegmentSpan,
    pub created_at: DateTime<Utc>,
    pub body: ArtifactBody,
}

impl StudyArtifact {
    pub fn new(
        request_id: &str,
        source_document_id: &str,
        source_span: SegmentSpan,
        created_at: DateTime<Utc>,
        body: ArtifactBody,
    ) -> Self {
        Self {
            artifact_id: identity::artifact_id(source_document_id, &body),
            request_id: request_id.to_string(),
            source_document_id: source_document_id.to_string(),
            source_span,
            created_at,
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unsynced,
    Syncing,
    Synced,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(SyncState::Unsynced),
            "syncing" => Ok(SyncState::Syncing),
            "synced" => Ok(SyncState::Synced),
            "conflict" => Ok(SyncState::Conflict),
            other => Err(format!("unknown sync state: '{}'", other)),
        }
    }
}

/// Remote reconciliation state of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub artifact_id: String,
    pub remote_version: Option<u64>,
    pub local_state: SyncState,
    pub updated_at: DateTime<Utc>,
}

/// An artifact write waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub seq: i64,
    pub artifact_id: String,
    pub source_document_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}
