//! Reconciliation of local artifacts with the remote store.
//!
//! Writes are create-if-absent keyed by the content-addressed artifact id, so
//! replaying a write is always safe. When the remote is unreachable or rejects
//! the write, it is queued locally and the artifact stays `Unsynced`; [`ArtifactStore::drain`]
//! replays the queue in FIFO order once connectivity returns. A document with
//! queued writes keeps queueing new ones behind them, so its artifacts reach
//! the remote in the order they were produced.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::PersistenceError;
use crate::models::{StudyArtifact, SyncRecord, SyncState};
use crate::store::{LocalStore, RemoteStore, UpsertOutcome};

/// Outcome of one pass over the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub synced: usize,
    pub conflicts: usize,
    pub still_pending: usize,
    /// Documents whose replay stopped at a still-failing write.
    pub blocked_documents: Vec<String>,
}

#[derive(Clone)]
pub struct ArtifactStore {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
}

impl ArtifactStore {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self { local, remote }
    }

    fn record(artifact_id: &str, state: SyncState, version: Option<u64>, now: DateTime<Utc>) -> SyncRecord {
        SyncRecord {
            artifact_id: artifact_id.to_string(),
            remote_version: version,
            local_state: state,
            updated_at: now,
        }
    }

    /// Reconcile one locally stored artifact with the remote store.
    ///
    /// Returns the artifact's sync record. A remote that is unreachable or
    /// rejects the write is not an error: the write is queued and the record
    /// is `Unsynced`. Only local store failures are returned.
    pub async fn reconcile(
        &self,
        artifact: &StudyArtifact,
        now: DateTime<Utc>,
    ) -> Result<SyncRecord, PersistenceError> {
        let id = &artifact.artifact_id;
        if let Some(existing) = self.local.sync_record(id).await? {
            if matches!(existing.local_state, SyncState::Synced | SyncState::Conflict) {
                return Ok(existing);
            }
        }

        if self.local.has_pending(&artifact.source_document_id).await? {
            debug!(artifact_id = %id, "document has queued writes, queueing behind them");
            return self.queue(artifact, now).await;
        }

        let syncing = Self::record(id, SyncState::Syncing, None, now);
        self.local.put_sync_record(&syncing).await?;

        match self.remote.upsert_if_absent(artifact).await {
            Ok(outcome) => {
                if matches!(outcome, UpsertOutcome::AlreadyExists { .. }) {
                    debug!(artifact_id = %id, "artifact already on remote");
                }
                let synced = Self::record(id, SyncState::Synced, Some(outcome.version()), now);
                self.local.put_sync_record(&synced).await?;
                Ok(synced)
            }
            Err(e) if e.is_offline() => {
                info!(artifact_id = %id, error = %e, "remote unavailable, queueing write");
                self.queue(artifact, now).await
            }
            Err(PersistenceError::Conflict(msg)) => {
                warn!(artifact_id = %id, conflict = %msg, "remote holds a conflicting record");
                let conflict = Self::record(id, SyncState::Conflict, None, now);
                self.local.put_sync_record(&conflict).await?;
                Ok(conflict)
            }
            Err(e) => {
                warn!(artifact_id = %id, error = %e, "remote write failed, queueing for replay");
                self.queue(artifact, now).await
            }
        }
    }

    async fn queue(
        &self,
        artifact: &StudyArtifact,
        now: DateTime<Utc>,
    ) -> Result<SyncRecord, PersistenceError> {
        self.local
            .enqueue(&artifact.artifact_id, &artifact.source_document_id, now)
            .await?;
        let unsynced = Self::record(&artifact.artifact_id, SyncState::Unsynced, None, now);
        self.local.put_sync_record(&unsynced).await?;
        Ok(unsynced)
    }

    /// Replay queued writes in FIFO order. A document stops at its first
    /// write that still fails; other documents continue.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<DrainReport, PersistenceError> {
        let pending = self.local.pending().await?;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in pending {
            if blocked.contains(&entry.source_document_id) {
                report.still_pending += 1;
                continue;
            }
            let Some(artifact) = self.local.get_artifact(&entry.artifact_id).await? else {
                warn!(artifact_id = %entry.artifact_id, "queued artifact missing locally, dropping");
                self.local.dequeue(entry.seq).await?;
                continue;
            };

            match self.remote.upsert_if_absent(&artifact).await {
                Ok(outcome) => {
                    let synced = Self::record(
                        &entry.artifact_id,
                        SyncState::Synced,
                        Some(outcome.version()),
                        now,
                    );
                    self.local.put_sync_record(&synced).await?;
                    self.local.dequeue(entry.seq).await?;
                    report.synced += 1;
                }
                Err(PersistenceError::Conflict(msg)) => {
                    warn!(artifact_id = %entry.artifact_id, conflict = %msg, "conflict while draining");
                    let conflict = Self::record(&entry.artifact_id, SyncState::Conflict, None, now);
                    self.local.put_sync_record(&conflict).await?;
                    self.local.dequeue(entry.seq).await?;
                    report.conflicts += 1;
                }
                Err(e) => {
                    debug!(
                        document_id = %entry.source_document_id,
                        seq = entry.seq,
                        error = %e,
                        "queued write still failing"
                    );
                    self.local.mark_attempt(entry.seq).await?;
                    blocked.insert(entry.source_document_id.clone());
                    report.blocked_documents.push(entry.source_document_id.clone());
                    report.still_pending += 1;
                }
            }
        }

        if report.synced > 0 || report.still_pending > 0 {
            info!(
                synced = report.synced,
                still_pending = report.still_pending,
                conflicts = report.conflicts,
                "drained offline queue"
            );
        }
        Ok(report)
    }

    /// Merge remote artifacts for `document_id` that are unknown locally.
    /// Returns how many were added.
    pub async fn pull(
        &self,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, PersistenceError> {
        let remote = self.remote.fetch_by_document(document_id).await?;
        let known: HashSet<String> = self.local.artifact_ids(document_id).await?.into_iter().collect();
        let fresh: Vec<StudyArtifact> = remote
            .into_iter()
            .filter(|a| !known.contains(&a.artifact_id))
            .collect();
        let added = self.local.insert_artifacts(&fresh).await?;
        for artifact in &fresh {
            let synced = Self::record(&artifact.artifact_id, SyncState::Synced, None, now);
            self.local.put_sync_record(&synced).await?;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactBody, SegmentSpan};
    use crate::store::memory::{InMemoryLocalStore, InMemoryRemoteStore, RemoteMode};

    fn artifact(doc: &str, front: &str) -> StudyArtifact {
        StudyArtifact::new(
            "req",
            doc,
            SegmentSpan { first: 0, last: 0 },
            Utc::now(),
            ArtifactBody::Flashcard {
                front: front.into(),
                back: "back".into(),
            },
        )
    }

    async fn setup() -> (Arc<InMemoryLocalStore>, Arc<InMemoryRemoteStore>, ArtifactStore) {
        let local = Arc::new(InMemoryLocalStore::new());
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = ArtifactStore::new(local.clone(), remote.clone());
        (local, remote, store)
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (local, remote, store) = setup().await;
        let a = artifact("d", "one");
        local.insert_artifacts(&[a.clone()]).await.unwrap();
        let first = store.reconcile(&a, Utc::now()).await.unwrap();
        let second = store.reconcile(&a, Utc::now()).await.unwrap();
        assert_eq!(first.local_state, SyncState::Synced);
        assert_eq!(second.remote_version, first.remote_version);
        assert_eq!(remote.write_log().len(), 1);
    }

    #[tokio::test]
    async fn offline_writes_queue_and_drain_in_order() {
        let (local, remote, store) = setup().await;
        remote.set_mode(RemoteMode::Offline);
        let batch: Vec<StudyArtifact> = ["a", "b", "c"].iter().map(|f| artifact("d", f)).collect();
        local.insert_artifacts(&batch).await.unwrap();
        for a in &batch {
            let rec = store.reconcile(a, Utc::now()).await.unwrap();
            assert_eq!(rec.local_state, SyncState::Unsynced);
        }

        let report = store.drain(Utc::now()).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.still_pending, 3);
        assert_eq!(report.blocked_documents, vec!["d".to_string()]);

        remote.set_mode(RemoteMode::Online);
        let report = store.drain(Utc::now()).await.unwrap();
        assert_eq!(report.synced, 3);
        let order: Vec<String> = batch.iter().map(|a| a.artifact_id.clone()).collect();
        assert_eq!(remote.write_log(), order);
        assert!(local.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_writes_queue_behind_pending_ones() {
        let (local, remote, store) = setup().await;
        remote.set_mode(RemoteMode::Offline);
        let first = artifact("d", "first");
        local.insert_artifacts(&[first.clone()]).await.unwrap();
        store.reconcile(&first, Utc::now()).await.unwrap();

        remote.set_mode(RemoteMode::Online);
        let second = artifact("d", "second");
        local.insert_artifacts(&[second.clone()]).await.unwrap();
        let rec = store.reconcile(&second, Utc::now()).await.unwrap();
        assert_eq!(rec.local_state, SyncState::Unsynced);
        assert!(remote.is_empty());

        store.drain(Utc::now()).await.unwrap();
        assert_eq!(
            remote.write_log(),
            vec![first.artifact_id.clone(), second.artifact_id.clone()]
        );
    }

    #[tokio::test]
    async fn rejected_write_is_queued_for_replay() {
        let (local, remote, store) = setup().await;
        remote.set_mode(RemoteMode::Failing);
        let a = artifact("d", "x");
        local.insert_artifacts(&[a.clone()]).await.unwrap();
        let rec = store.reconcile(&a, Utc::now()).await.unwrap();
        assert_eq!(rec.local_state, SyncState::Unsynced);
        let pending = local.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].artifact_id, a.artifact_id);

        // Reconciling again does not queue a second write.
        store.reconcile(&a, Utc::now()).await.unwrap();
        assert_eq!(local.pending().await.unwrap().len(), 1);

        remote.set_mode(RemoteMode::Online);
        let report = store.drain(Utc::now()).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(remote.write_log(), vec![a.artifact_id.clone()]);
    }

    #[tokio::test]
    async fn unqueued_unsynced_artifact_is_written_on_reconcile() {
        let (local, remote, store) = setup().await;
        let a = artifact("d", "stranded");
        local.insert_artifacts(&[a.clone()]).await.unwrap();
        local
            .put_sync_record(&SyncRecord {
                artifact_id: a.artifact_id.clone(),
                remote_version: None,
                local_state: SyncState::Unsynced,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let rec = store.reconcile(&a, Utc::now()).await.unwrap();
        assert_eq!(rec.local_state, SyncState::Synced);
        assert_eq!(remote.write_log(), vec![a.artifact_id.clone()]);
    }

    #[tokio::test]
    async fn pull_merges_unknown_remote_artifacts() {
        let (local, remote, store) = setup().await;
        let mine = artifact("d", "mine");
        let theirs = artifact("d", "theirs");
        local.insert_artifacts(&[mine.clone()]).await.unwrap();
        remote.seed(mine.clone());
        remote.seed(theirs.clone());
        assert_eq!(store.pull("d", Utc::now()).await.unwrap(), 1);
        assert_eq!(local.list_artifacts("d").await.unwrap().len(), 2);
        assert_eq!(store.pull("d", Utc::now()).await.unwrap(), 0);
    }
}
