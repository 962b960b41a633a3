//! SQLite-backed [`LocalStore`].
//!
//! Requests are stored as JSON snapshots alongside a few indexed columns;
//! artifacts keep their full JSON so a round trip through the database is
//! lossless. Timestamps are RFC 3339 strings with nanosecond precision,
//! which also sort correctly as text.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use study_harness_core::error::PersistenceError;
use study_harness_core::models::{
    ExtractionStatus, GenerationRequest, QueuedWrite, SourceDocument, StudyArtifact, SyncRecord,
    TextSegment,
};
use study_harness_core::store::LocalStore;

pub struct SqliteLocalStore {
    pool: SqlitePool,
}

impl SqliteLocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Write(e.to_string())
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| db_err(format!("bad timestamp '{}': {}", s, e)))
}

fn document_from_row(row: &SqliteRow) -> Result<SourceDocument, PersistenceError> {
    let kind: String = row.get("kind");
    let status: String = row.get("extraction_status");
    let submitted_at: String = row.get("submitted_at");
    Ok(SourceDocument {
        id: row.get("id"),
        kind: kind.parse().map_err(db_err)?,
        payload_ref: row.get("payload_ref"),
        extraction_status: status.parse().map_err(db_err)?,
        submitted_at: parse_ts(&submitted_at)?,
    })
}

fn queued_from_row(row: &SqliteRow) -> Result<QueuedWrite, PersistenceError> {
    let enqueued_at: String = row.get("enqueued_at");
    let attempts: i64 = row.get("attempts");
    Ok(QueuedWrite {
        seq: row.get("seq"),
        artifact_id: row.get("artifact_id"),
        source_document_id: row.get("document_id"),
        enqueued_at: parse_ts(&enqueued_at)?,
        attempts: attempts as u32,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<StudyArtifact, PersistenceError> {
    let json: String = row.get("artifact_json");
    serde_json::from_str(&json).map_err(db_err)
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn upsert_document(&self, doc: &SourceDocument) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, kind, payload_ref, extraction_status, submitted_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET payload_ref = excluded.payload_ref
            "#,
        )
        .bind(&doc.id)
        .bind(doc.kind.as_str())
        .bind(&doc.payload_ref)
        .bind(doc.extraction_status.as_str())
        .bind(ts(&doc.submitted_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>, PersistenceError> {
        let row = sqlx::query(
            "SELECT id, kind, payload_ref, extraction_status, submitted_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn set_extraction_status(
        &self,
        id: &str,
        status: ExtractionStatus,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query("UPDATE documents SET extraction_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(db_err(format!("unknown document {}", id)));
        }
        Ok(())
    }

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: &[TextSegment],
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM segments WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for seg in segments {
            let provenance = serde_json::to_string(&seg.provenance).map_err(db_err)?;
            sqlx::query(
                r#"
                INSERT INTO segments (id, document_id, ordinal, provenance_json, text, token_count)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&seg.segment_id)
            .bind(document_id)
            .bind(seg.ordinal as i64)
            .bind(provenance)
            .bind(&seg.text)
            .bind(seg.token_count as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<TextSegment>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, ordinal, provenance_json, text, token_count
            FROM segments WHERE document_id = ? ORDER BY ordinal ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let provenance: String = row.get("provenance_json");
                let ordinal: i64 = row.get("ordinal");
                let token_count: i64 = row.get("token_count");
                Ok(TextSegment {
                    segment_id: row.get("id"),
                    source_document_id: row.get("document_id"),
                    ordinal: ordinal as u32,
                    provenance: serde_json::from_str(&provenance).map_err(db_err)?,
                    text: row.get("text"),
                    token_count: token_count as usize,
                })
            })
            .collect()
    }

    async fn save_request(&self, request: &GenerationRequest) -> Result<(), PersistenceError> {
        let snapshot = serde_json::to_string(request).map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO requests (id, document_id, status, snapshot_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&request.request_id)
        .bind(&request.source_document_id)
        .bind(request.status.name())
        .bind(snapshot)
        .bind(ts(&request.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<GenerationRequest>, PersistenceError> {
        let snapshot: Option<String> =
            sqlx::query_scalar("SELECT snapshot_json FROM requests WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        snapshot
            .map(|s| serde_json::from_str(&s).map_err(db_err))
            .transpose()
    }

    async fn list_requests(&self, limit: usize) -> Result<Vec<GenerationRequest>, PersistenceError> {
        let snapshots: Vec<String> = sqlx::query_scalar(
            "SELECT snapshot_json FROM requests ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        snapshots
            .iter()
            .map(|s| serde_json::from_str(s).map_err(db_err))
            .collect()
    }

    async fn insert_artifacts(&self, artifacts: &[StudyArtifact]) -> Result<usize, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut inserted = 0usize;
        for artifact in artifacts {
            let json = serde_json::to_string(artifact).map_err(db_err)?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO artifacts
                    (id, document_id, request_id, artifact_type, span_first, span_last, artifact_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&artifact.artifact_id)
            .bind(&artifact.source_document_id)
            .bind(&artifact.request_id)
            .bind(artifact.body.artifact_type().as_str())
            .bind(artifact.source_span.first as i64)
            .bind(artifact.source_span.last as i64)
            .bind(json)
            .bind(ts(&artifact.created_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn artifact_ids(&self, document_id: &str) -> Result<Vec<String>, PersistenceError> {
        sqlx::query_scalar("SELECT id FROM artifacts WHERE document_id = ? ORDER BY seq ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_artifact(&self, id: &str) -> Result<Option<StudyArtifact>, PersistenceError> {
        let row = sqlx::query("SELECT artifact_json FROM artifacts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    async fn list_artifacts(
        &self,
        document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT artifact_json FROM artifacts WHERE document_id = ? ORDER BY seq ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn put_sync_record(&self, record: &SyncRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (artifact_id, remote_version, local_state, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(artifact_id) DO UPDATE SET
                remote_version = excluded.remote_version,
                local_state = excluded.local_state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.artifact_id)
        .bind(record.remote_version.map(|v| v as i64))
        .bind(record.local_state.as_str())
        .bind(ts(&record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn sync_record(&self, artifact_id: &str) -> Result<Option<SyncRecord>, PersistenceError> {
        let row = sqlx::query(
            "SELECT artifact_id, remote_version, local_state, updated_at FROM sync_records WHERE artifact_id = ?",
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let version: Option<i64> = row.get("remote_version");
        let state: String = row.get("local_state");
        let updated_at: String = row.get("updated_at");
        Ok(Some(SyncRecord {
            artifact_id: row.get("artifact_id"),
            remote_version: version.map(|v| v as u64),
            local_state: state.parse().map_err(db_err)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    async fn enqueue(
        &self,
        artifact_id: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueuedWrite, PersistenceError> {
        sqlx::query(
            "INSERT OR IGNORE INTO sync_queue (artifact_id, document_id, enqueued_at) VALUES (?, ?, ?)",
        )
        .bind(artifact_id)
        .bind(document_id)
        .bind(ts(&now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            "SELECT seq, artifact_id, document_id, enqueued_at, attempts FROM sync_queue WHERE artifact_id = ?",
        )
        .bind(artifact_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        queued_from_row(&row)
    }

    async fn has_pending(&self, document_id: &str) -> Result<bool, PersistenceError> {
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sync_queue WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn pending(&self) -> Result<Vec<QueuedWrite>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT seq, artifact_id, document_id, enqueued_at, attempts FROM sync_queue ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(queued_from_row).collect()
    }

    async fn dequeue(&self, seq: i64) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM sync_queue WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_attempt(&self, seq: i64) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE sync_queue SET attempts = attempts + 1 WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use study_harness_core::models::{
        ArtifactBody, Locator, Provenance, SegmentSpan, SourceKind, SyncState,
    };

    async fn store() -> (tempfile::TempDir, SqliteLocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.sqlite"))
            .await
            .unwrap();
        crate::migrate::migrate(&pool).await.unwrap();
        (dir, SqliteLocalStore::new(pool))
    }

    fn artifact(front: &str) -> StudyArtifact {
        StudyArtifact::new(
            "req",
            "doc",
            SegmentSpan { first: 0, last: 2 },
            Utc::now(),
            ArtifactBody::Flashcard {
                front: front.into(),
                back: "b".into(),
            },
        )
    }

    #[tokio::test]
    async fn documents_and_segments_round_trip() {
        let (_dir, store) = store().await;
        let doc = SourceDocument::from_bytes(SourceKind::PlainText, "notes.txt", b"hello");
        store.upsert_document(&doc).await.unwrap();
        store
            .set_extraction_status(&doc.id, ExtractionStatus::Extracted)
            .await
            .unwrap();
        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.extraction_status, ExtractionStatus::Extracted);
        assert_eq!(loaded.submitted_at, doc.submitted_at);

        let segs = vec![
            TextSegment::new(&doc.id, 0, Provenance::new(Locator::Text { first: 0, last: 0 }), "a".into()),
            TextSegment::new(&doc.id, 1, Provenance::with_confidence(Locator::Page { page: 2 }, 0.4, 0.6), "b".into()),
        ];
        store.replace_segments(&doc.id, &segs).await.unwrap();
        store.replace_segments(&doc.id, &segs).await.unwrap();
        assert_eq!(store.segments(&doc.id).await.unwrap(), segs);
    }

    #[tokio::test]
    async fn artifacts_keep_insertion_order_and_dedup() {
        let (_dir, store) = store().await;
        let (a, b) = (artifact("z"), artifact("a"));
        assert_eq!(store.insert_artifacts(&[a.clone(), b.clone()]).await.unwrap(), 2);
        assert_eq!(store.insert_artifacts(&[a.clone()]).await.unwrap(), 0);
        let listed = store.list_artifacts("doc").await.unwrap();
        assert_eq!(listed, vec![a.clone(), b]);
        assert_eq!(store.get_artifact(&a.artifact_id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn queue_and_sync_records() {
        let (_dir, store) = store().await;
        let first = store.enqueue("a1", "doc", Utc::now()).await.unwrap();
        let second = store.enqueue("a2", "doc", Utc::now()).await.unwrap();
        assert_eq!(store.enqueue("a1", "doc", Utc::now()).await.unwrap().seq, first.seq);
        store.mark_attempt(first.seq).await.unwrap();
        let pending = store.pending().await.unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[1].seq, second.seq);
        store.dequeue(first.seq).await.unwrap();
        store.dequeue(second.seq).await.unwrap();
        assert!(!store.has_pending("doc").await.unwrap());

        let record = SyncRecord {
            artifact_id: "a1".into(),
            remote_version: Some(7),
            local_state: SyncState::Synced,
            updated_at: Utc::now(),
        };
        store.put_sync_record(&record).await.unwrap();
        assert_eq!(store.sync_record("a1").await.unwrap(), Some(record));
    }
}
