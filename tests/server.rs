//! HTTP API and SQLite persistence tests.
//!
//! The orchestrator runs on a real SQLite database in a temp dir with a
//! scripted AI model; the router is served on an ephemeral port and driven
//! with `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use tempfile::TempDir;

use study_harness::extract_youtube::DisabledTranscripts;
use study_harness::orchestrator::{Orchestrator, PipelineSettings, Services};
use study_harness::sqlite_store::SqliteLocalStore;
use study_harness::{db, intake, migrate, server};
use study_harness_core::error::{ExternalServiceError, ExtractionError};
use study_harness_core::models::{
    AiPrompt, ArtifactType, GenerationOptions, RequestStatus, SyncState,
};
use study_harness_core::services::{
    AiService, FetchedPage, HtmlFetcher, ModelConfig, OcrEngine, OcrImage, OcrOutput,
    RecordingClock,
};
use study_harness_core::store::memory::{InMemoryRemoteStore, RemoteMode};
use study_harness_core::store::LocalStore;

const QUIZ: &str = r#"```json
{"topic":"Photosynthesis","questions":[
  {"question":"Where does photosynthesis happen?","choices":["Roots","Leaves","Stem"],"correctIndex":1,
   "explanation":"Chloroplasts are concentrated in leaves."}
]}
```"#;

const NOTES: &str = "Photosynthesis happens in the leaves.\n\nChloroplasts capture light.";

struct FixedAi;

#[async_trait]
impl AiService for FixedAi {
    async fn generate(
        &self,
        _prompt: &AiPrompt,
        _config: &ModelConfig,
    ) -> Result<String, ExternalServiceError> {
        Ok(QUIZ.to_string())
    }
}

struct NoOcr;

#[async_trait]
impl OcrEngine for NoOcr {
    async fn recognize(&self, _image: &OcrImage) -> Result<OcrOutput, ExternalServiceError> {
        Err(ExternalServiceError::Unavailable("no OCR".into()))
    }
}

struct NoFetch;

#[async_trait]
impl HtmlFetcher for NoFetch {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, ExtractionError> {
        Err(ExtractionError::ExternalServiceUnavailable(format!(
            "no network in tests: {}",
            url
        )))
    }
}

async fn orchestrator_at(dir: &TempDir, remote: Arc<InMemoryRemoteStore>) -> Orchestrator {
    let pool = db::connect_path(&dir.path().join("data/study.sqlite"))
        .await
        .unwrap();
    migrate::migrate(&pool).await.unwrap();
    let services = Services {
        local: Arc::new(SqliteLocalStore::new(pool)),
        remote,
        ai: Arc::new(FixedAi),
        ocr: Arc::new(NoOcr),
        fetcher: Arc::new(NoFetch),
        transcripts: Arc::new(DisabledTranscripts),
        clock: Arc::new(RecordingClock::default()),
    };
    Orchestrator::new(services, PipelineSettings::default())
}

async fn serve(orchestrator: Orchestrator) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(orchestrator))
            .await
            .unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn requests_and_artifacts_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.set_mode(RemoteMode::Offline);

    let first = orchestrator_at(&dir, remote.clone()).await;
    let (doc, payload) = intake::from_upload("notes.txt", NOTES.as_bytes().to_vec(), None).unwrap();
    let request = first
        .generate(doc, payload, ArtifactType::Quiz, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.topic.as_deref(), Some("Photosynthesis"));
    assert_eq!(request.artifact_ids.len(), 1);
    drop(first);

    // A fresh orchestrator over the same file sees everything, queue included.
    let second = orchestrator_at(&dir, remote.clone()).await;
    let stored = second.request_status(&request.request_id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
    assert_eq!(stored.artifact_ids, request.artifact_ids);
    let artifacts = second.list_artifacts(&request.source_document_id).await.unwrap();
    assert_eq!(artifacts.len(), 1);

    remote.set_mode(RemoteMode::Online);
    let report = second.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    let record = second
        .local()
        .sync_record(&request.artifact_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.local_state, SyncState::Synced);
}

#[tokio::test]
async fn health_and_error_shape() {
    let dir = TempDir::new().unwrap();
    let base = serve(orchestrator_at(&dir, Arc::new(InMemoryRemoteStore::new())).await).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));

    let resp = client
        .get(format!("{}/requests/does-not-exist", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("does-not-exist"));

    let resp = client
        .post(format!("{}/sources", base))
        .json(&json!({"url": "https://example.org", "artifact_type": "poems"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn submitted_upload_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let base = serve(orchestrator_at(&dir, Arc::new(InMemoryRemoteStore::new())).await).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/sources", base))
        .json(&json!({
            "filename": "notes.txt",
            "content_base64": base64::engine::general_purpose::STANDARD.encode(NOTES),
            "artifact_type": "quiz",
            "item_count": 5,
            "difficulty": "hard",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let accepted: Value = resp.json().await.unwrap();
    let request_id = accepted["request_id"].as_str().unwrap().to_string();
    let document_id = accepted["document_id"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..500 {
        status = client
            .get(format!("{}/requests/{}", base, request_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["status"]["state"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status["status"]["state"], "completed", "{}", status);
    assert_eq!(status["options"]["difficulty"], "hard");

    let artifacts: Value = client
        .get(format!("{}/documents/{}/artifacts", base, document_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let artifacts = artifacts.as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["body"]["type"], "quiz_item");
    assert_eq!(artifacts[0]["body"]["correct_index"], 1);

    // Completed requests cannot be cancelled or retried.
    let resp = client
        .post(format!("{}/requests/{}/cancel", base, request_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);
    let resp = client
        .post(format!("{}/requests/{}/retry", base, request_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 409);

    let listed: Value = client
        .get(format!("{}/requests?limit=5", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let sync: Value = client
        .post(format!("{}/sync", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sync["still_pending"], 0);
}

#[tokio::test]
async fn regenerate_endpoint_remasters_a_stored_quiz() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_at(&dir, Arc::new(InMemoryRemoteStore::new())).await;
    let (doc, payload) = intake::from_upload("notes.txt", NOTES.as_bytes().to_vec(), None).unwrap();
    let original = orchestrator
        .generate(doc, payload, ArtifactType::Quiz, GenerationOptions::default())
        .await
        .unwrap();
    let base = serve(orchestrator).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/documents/unknown-doc/regenerate", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client
        .post(format!("{}/documents/{}/regenerate", base, original.source_document_id))
        .json(&json!({"item_count": 3, "difficulty": "easy"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let accepted: Value = resp.json().await.unwrap();
    let request_id = accepted["request_id"].as_str().unwrap().to_string();
    assert_eq!(accepted["document_id"], original.source_document_id.as_str());

    let mut status = Value::Null;
    for _ in 0..500 {
        status = client
            .get(format!("{}/requests/{}", base, request_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["status"]["state"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status["status"]["state"], "completed", "{}", status);
    assert_eq!(status["artifact_type"], "quiz");
    assert_eq!(status["options"]["item_count"], 3);
    assert_eq!(status["regenerated_from"], json!(original.artifact_ids));
}
