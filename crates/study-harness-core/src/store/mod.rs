//! Storage abstraction for Study Harness.
//!
//! [`LocalStore`] is the authoritative on-device record of documents,
//! segments, requests, artifacts and the offline write queue. [`RemoteStore`]
//! is the eventually-consistent shared store artifacts are reconciled into.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::models::{
    ExtractionStatus, GenerationRequest, QueuedWrite, SourceDocument, StudyArtifact, SyncRecord,
    TextSegment,
};

/// Result of a create-if-absent write against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { version: u64 },
    AlreadyExists { version: u64 },
}

impl UpsertOutcome {
    pub fn version(&self) -> u64 {
        match self {
            UpsertOutcome::Created { version } | UpsertOutcome::AlreadyExists { version } => {
                *version
            }
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create the artifact unless a record with the same id exists.
    async fn upsert_if_absent(
        &self,
        artifact: &StudyArtifact,
    ) -> Result<UpsertOutcome, PersistenceError>;

    async fn fetch_by_document(
        &self,
        source_document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PersistenceError>;
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    // Documents and segments.
    async fn upsert_document(&self, doc: &SourceDocument) -> Result<(), PersistenceError>;
    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>, PersistenceError>;
    async fn set_extraction_status(
        &self,
        id: &str,
        status: ExtractionStatus,
    ) -> Result<(), PersistenceError>;
    /// Replace every stored segment of a document.
    async fn replace_segments(
        &self,
        document_id: &str,
        segments: &[TextSegment],
    ) -> Result<(), PersistenceError>;
    /// Stored segments in ordinal order.
    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>, PersistenceError>;

    // Requests.
    async fn save_request(&self, request: &GenerationRequest) -> Result<(), PersistenceError>;
    async fn get_request(&self, id: &str) -> Result<Option<GenerationRequest>, PersistenceError>;
    /// Most recently updated first.
    async fn list_requests(&self, limit: usize) -> Result<Vec<GenerationRequest>, PersistenceError>;

    // Artifacts.
    /// Insert artifacts whose id is not yet stored. Returns how many were new.
    async fn insert_artifacts(&self, artifacts: &[StudyArtifact]) -> Result<usize, PersistenceError>;
    async fn artifact_ids(&self, document_id: &str) -> Result<Vec<String>, PersistenceError>;
    async fn get_artifact(&self, id: &str) -> Result<Option<StudyArtifact>, PersistenceError>;
    /// A document's artifacts in insertion order.
    async fn list_artifacts(&self, document_id: &str)
        -> Result<Vec<StudyArtifact>, PersistenceError>;

    // Sync bookkeeping.
    async fn put_sync_record(&self, record: &SyncRecord) -> Result<(), PersistenceError>;
    async fn sync_record(&self, artifact_id: &str) -> Result<Option<SyncRecord>, PersistenceError>;
    async fn enqueue(
        &self,
        artifact_id: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedWrite, PersistenceError>;
    async fn has_pending(&self, document_id: &str) -> Result<bool, PersistenceError>;
    /// Every queued write in FIFO (`seq`) order.
    async fn pending(&self) -> Result<Vec<QueuedWrite>, PersistenceError>;
    async fn dequeue(&self, seq: i64) -> Result<(), PersistenceError>;
    async fn mark_attempt(&self, seq: i64) -> Result<(), PersistenceError>;
}
