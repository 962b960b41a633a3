//! In-memory store implementations for tests and ephemeral runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! [`InMemoryRemoteStore`] can be switched offline or into a failing mode to
//! exercise reconciliation paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::models::{
    ExtractionStatus, GenerationRequest, QueuedWrite, SourceDocument, StudyArtifact, SyncRecord,
    TextSegment,
};

use super::{LocalStore, RemoteStore, UpsertOutcome};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct LocalState {
    documents: HashMap<String, SourceDocument>,
    segments: HashMap<String, Vec<TextSegment>>,
    requests: HashMap<String, GenerationRequest>,
    /// Insertion order is preserved by the Vec.
    artifacts: Vec<StudyArtifact>,
    sync_records: HashMap<String, SyncRecord>,
    queue: Vec<QueuedWrite>,
    next_seq: i64,
}

/// In-memory [`LocalStore`].
#[derive(Default)]
pub struct InMemoryLocalStore {
    state: RwLock<LocalState>,
    fail_artifact_writes: AtomicBool,
    fail_sync_writes: AtomicBool,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make artifact inserts fail until switched back.
    pub fn set_fail_artifact_writes(&self, fail: bool) {
        self.fail_artifact_writes.store(fail, Ordering::SeqCst);
    }

    /// Make sync record writes fail until switched back.
    pub fn set_fail_sync_writes(&self, fail: bool) {
        self.fail_sync_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn upsert_document(&self, doc: &SourceDocument) -> Result<(), PersistenceError> {
        let mut state = write(&self.state);
        match state.documents.get_mut(&doc.id) {
            // Keep the original submission time and extraction status.
            Some(existing) => existing.payload_ref = doc.payload_ref.clone(),
            None => {
                state.documents.insert(doc.id.clone(), doc.clone());
            }
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>, PersistenceError> {
        Ok(read(&self.state).documents.get(id).cloned())
    }

    async fn set_extraction_status(
        &self,
        id: &str,
        status: ExtractionStatus,
    ) -> Result<(), PersistenceError> {
        let mut state = write(&self.state);
        let doc = state
            .documents
            .get_mut(id)
            .ok_or_else(|| PersistenceError::Write(format!("unknown document {}", id)))?;
        doc.extraction_status = status;
        Ok(())
    }

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: &[TextSegment],
    ) -> Result<(), PersistenceError> {
        write(&self.state)
            .segments
            .insert(document_id.to_string(), segments.to_vec());
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>, PersistenceError> {
        let mut segs = read(&self.state)
            .segments
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        segs.sort_by_key(|s| s.ordinal);
        Ok(segs)
    }

    async fn save_request(&self, request: &GenerationRequest) -> Result<(), PersistenceError> {
        write(&self.state)
            .requests
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<GenerationRequest>, PersistenceError> {
        Ok(read(&self.state).requests.get(id).cloned())
    }

    async fn list_requests(&self, limit: usize) -> Result<Vec<GenerationRequest>, PersistenceError> {
        let mut all: Vec<GenerationRequest> = read(&self.state).requests.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn insert_artifacts(&self, artifacts: &[StudyArtifact]) -> Result<usize, PersistenceError> {
        if self.fail_artifact_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write("artifact table is read-only".into()));
        }
        let mut state = write(&self.state);
        let mut inserted = 0;
        for artifact in artifacts {
            if state
                .artifacts
                .iter()
                .any(|a| a.artifact_id == artifact.artifact_id)
            {
                continue;
            }
            state.artifacts.push(artifact.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn artifact_ids(&self, document_id: &str) -> Result<Vec<String>, PersistenceError> {
        Ok(read(&self.state)
            .artifacts
            .iter()
            .filter(|a| a.source_document_id == document_id)
            .map(|a| a.artifact_id.clone())
            .collect())
    }

    async fn get_artifact(&self, id: &str) -> Result<Option<StudyArtifact>, PersistenceError> {
        Ok(read(&self.state)
            .artifacts
            .iter()
            .find(|a| a.artifact_id == id)
            .cloned())
    }

    async fn list_artifacts(
        &self,
        document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PersistenceError> {
        Ok(read(&self.state)
            .artifacts
            .iter()
            .filter(|a| a.source_document_id == document_id)
            .cloned()
            .collect())
    }

    async fn put_sync_record(&self, record: &SyncRecord) -> Result<(), PersistenceError> {
        if self.fail_sync_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write("sync record writes disabled".into()));
        }
        write(&self.state)
            .sync_records
            .insert(record.artifact_id.clone(), record.clone());
        Ok(())
    }

    async fn sync_record(&self, artifact_id: &str) -> Result<Option<SyncRecord>, PersistenceError> {
        Ok(read(&self.state).sync_records.get(artifact_id).cloned())
    }

    async fn enqueue(
        &self,
        artifact_id: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedWrite, PersistenceError> {
        let mut state = write(&self.state);
        if let Some(existing) = state.queue.iter().find(|q| q.artifact_id == artifact_id) {
            return Ok(existing.clone());
        }
        state.next_seq += 1;
        let entry = QueuedWrite {
            seq: state.next_seq,
            artifact_id: artifact_id.to_string(),
            source_document_id: document_id.to_string(),
            enqueued_at: now,
            attempts: 0,
        };
        state.queue.push(entry.clone());
        Ok(entry)
    }

    async fn has_pending(&self, document_id: &str) -> Result<bool, PersistenceError> {
        Ok(read(&self.state)
            .queue
            .iter()
            .any(|q| q.source_document_id == document_id))
    }

    async fn pending(&self) -> Result<Vec<QueuedWrite>, PersistenceError> {
        Ok(read(&self.state).queue.clone())
    }

    async fn dequeue(&self, seq: i64) -> Result<(), PersistenceError> {
        write(&self.state).queue.retain(|q| q.seq != seq);
        Ok(())
    }

    async fn mark_attempt(&self, seq: i64) -> Result<(), PersistenceError> {
        let mut state = write(&self.state);
        if let Some(entry) = state.queue.iter_mut().find(|q| q.seq == seq) {
            entry.attempts += 1;
        }
        Ok(())
    }
}

/// Behaviour of [`InMemoryRemoteStore`] for subsequent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    Online,
    Offline,
    /// Reachable but rejecting writes.
    Failing,
}

struct RemoteState {
    mode: RemoteMode,
    records: HashMap<String, (u64, StudyArtifact)>,
    next_version: u64,
    /// Artifact ids in the order creates were accepted.
    write_log: Vec<String>,
}

/// In-memory [`RemoteStore`] with a switchable connectivity mode.
pub struct InMemoryRemoteStore {
    state: RwLock<RemoteState>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RemoteState {
                mode: RemoteMode::Online,
                records: HashMap::new(),
                next_version: 0,
                write_log: Vec::new(),
            }),
        }
    }

    pub fn set_mode(&self, mode: RemoteMode) {
        write(&self.state).mode = mode;
    }

    pub fn write_log(&self) -> Vec<String> {
        read(&self.state).write_log.clone()
    }

    pub fn len(&self) -> usize {
        read(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a record directly, as if another device had written it.
    pub fn seed(&self, artifact: StudyArtifact) {
        let mut state = write(&self.state);
        state.next_version += 1;
        let version = state.next_version;
        state
            .records
            .insert(artifact.artifact_id.clone(), (version, artifact));
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_mode(mode: RemoteMode) -> Result<(), PersistenceError> {
    match mode {
        RemoteMode::Online => Ok(()),
        RemoteMode::Offline => Err(PersistenceError::Unavailable("remote offline".into())),
        RemoteMode::Failing => Err(PersistenceError::Write("remote rejected write".into())),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn upsert_if_absent(
        &self,
        artifact: &StudyArtifact,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut state = write(&self.state);
        check_mode(state.mode)?;
        if let Some((version, _)) = state.records.get(&artifact.artifact_id) {
            return Ok(UpsertOutcome::AlreadyExists { version: *version });
        }
        state.next_version += 1;
        let version = state.next_version;
        state
            .records
            .insert(artifact.artifact_id.clone(), (version, artifact.clone()));
        state.write_log.push(artifact.artifact_id.clone());
        Ok(UpsertOutcome::Created { version })
    }

    async fn fetch_by_document(
        &self,
        source_document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PersistenceError> {
        let state = read(&self.state);
        if state.mode == RemoteMode::Offline {
            return Err(PersistenceError::Unavailable("remote offline".into()));
        }
        let mut found: Vec<(u64, StudyArtifact)> = state
            .records
            .values()
            .filter(|(_, a)| a.source_document_id == source_document_id)
            .cloned()
            .collect();
        found.sort_by_key(|(v, _)| *v);
        Ok(found.into_iter().map(|(_, a)| a).collect())
    }
}
