//! End-to-end tests for the generation pipeline.
//!
//! Every external collaborator is a scripted fake: the AI model replays a
//! queue of responses, OCR answers per image, the fetcher serves a fixed
//! page, the transcript service replays canned replies, and the clock
//! records sleeps instead of waiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use study_harness::extract_youtube::DisabledTranscripts;
use study_harness::intake;
use study_harness::orchestrator::{Orchestrator, PipelineError, PipelineSettings, Services};
use study_harness_core::error::{ExternalServiceError, ExtractionError};
use study_harness_core::models::{
    AiPrompt, ArtifactType, Difficulty, FailureReason, GenerationOptions, GenerationRequest,
    Locator, RequestStatus, SourceKind, SyncState,
};
use study_harness_core::services::{
    AiService, FetchedPage, HtmlFetcher, ModelConfig, OcrEngine, OcrImage, OcrOutput,
    RecordingClock, TranscriptApi,
};
use study_harness_core::store::memory::{InMemoryLocalStore, InMemoryRemoteStore, RemoteMode};
use study_harness_core::store::LocalStore;

const FLASHCARDS: &str = r#"{"topic":"Cell biology","flashcards":[
    {"front":"What do mitochondria produce?","back":"ATP"},
    {"front":"Where is DNA stored?","back":"In the nucleus"}
]}"#;

const NOTES: &str = "Mitochondria are the powerhouse of the cell. They produce ATP.\n\n\
                     The nucleus stores DNA and controls the cell.";

// ─── Fakes ──────────────────────────────────────────────────────────

/// Replays scripted results, then answers with `fallback` forever.
struct ScriptedAi {
    script: Mutex<VecDeque<Result<String, ExternalServiceError>>>,
    fallback: String,
    prompts: Mutex<Vec<AiPrompt>>,
}

impl ScriptedAi {
    fn new(script: Vec<Result<String, ExternalServiceError>>, fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: fallback.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn always(response: &str) -> Arc<Self> {
        Self::new(Vec::new(), response)
    }

    fn prompts(&self) -> Vec<AiPrompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiService for ScriptedAi {
    async fn generate(
        &self,
        prompt: &AiPrompt,
        _config: &ModelConfig,
    ) -> Result<String, ExternalServiceError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Blocks inside the AI call until released.
struct GatedAi {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl AiService for GatedAi {
    async fn generate(
        &self,
        _prompt: &AiPrompt,
        _config: &ModelConfig,
    ) -> Result<String, ExternalServiceError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(FLASHCARDS.to_string())
    }
}

/// Answers by image content: `page-one` reads cleanly, anything else is blurry.
struct PageOcr;

#[async_trait]
impl OcrEngine for PageOcr {
    async fn recognize(&self, image: &OcrImage) -> Result<OcrOutput, ExternalServiceError> {
        let (text, confidence) = if image.bytes == b"page-one" {
            ("Mitochondria produce ATP.", 0.95)
        } else {
            ("Ribosomes bu1ld pr0teins.", 0.40)
        };
        Ok(OcrOutput {
            text: text.to_string(),
            confidence,
            regions: Vec::new(),
        })
    }
}

struct NoOcr;

#[async_trait]
impl OcrEngine for NoOcr {
    async fn recognize(&self, _image: &OcrImage) -> Result<OcrOutput, ExternalServiceError> {
        Err(ExternalServiceError::Unavailable("no OCR in this test".into()))
    }
}

/// Serves one HTML page and counts fetches.
struct StaticFetcher {
    html: String,
    fetches: AtomicUsize,
}

impl StaticFetcher {
    fn new(html: &str) -> Arc<Self> {
        Arc::new(Self {
            html: html.to_string(),
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HtmlFetcher for StaticFetcher {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<FetchedPage, ExtractionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(FetchedPage {
            final_url: url.to_string(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            body: self.html.clone().into_bytes(),
        })
    }
}

/// Replays transcript replies in order and records the requested tracks.
struct CannedTranscripts {
    replies: Mutex<VecDeque<String>>,
    tracks: Mutex<Vec<Option<String>>>,
}

impl CannedTranscripts {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            tracks: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TranscriptApi for CannedTranscripts {
    async fn transcript(
        &self,
        _video_id: &str,
        track: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, ExtractionError> {
        self.tracks.lock().unwrap().push(track.map(str::to_string));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ExtractionError::NotAvailable("no more replies".into()))
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    orchestrator: Orchestrator,
    local: Arc<InMemoryLocalStore>,
    remote: Arc<InMemoryRemoteStore>,
    clock: Arc<RecordingClock>,
}

fn harness_with(
    ai: Arc<dyn AiService>,
    ocr: Arc<dyn OcrEngine>,
    fetcher: Arc<dyn HtmlFetcher>,
) -> Harness {
    build_harness(ai, ocr, fetcher, Arc::new(DisabledTranscripts))
}

fn build_harness(
    ai: Arc<dyn AiService>,
    ocr: Arc<dyn OcrEngine>,
    fetcher: Arc<dyn HtmlFetcher>,
    transcripts: Arc<dyn TranscriptApi>,
) -> Harness {
    let local = Arc::new(InMemoryLocalStore::new());
    let remote = Arc::new(InMemoryRemoteStore::new());
    let clock = Arc::new(RecordingClock::new(Utc::now()));
    let services = Services {
        local: local.clone(),
        remote: remote.clone(),
        ai,
        ocr,
        fetcher,
        transcripts,
        clock: clock.clone(),
    };
    Harness {
        orchestrator: Orchestrator::new(services, PipelineSettings::default()),
        local,
        remote,
        clock,
    }
}

fn harness(ai: Arc<dyn AiService>) -> Harness {
    harness_with(ai, Arc::new(NoOcr), StaticFetcher::new("<p>unused</p>"))
}

/// A fresh orchestrator over the harness's stores, as after a process restart.
fn restarted(h: &Harness, ai: Arc<dyn AiService>) -> Orchestrator {
    let services = Services {
        local: h.local.clone(),
        remote: h.remote.clone(),
        ai,
        ocr: Arc::new(NoOcr),
        fetcher: StaticFetcher::new("<p>unused</p>"),
        transcripts: Arc::new(DisabledTranscripts),
        clock: h.clock.clone(),
    };
    Orchestrator::new(services, PipelineSettings::default())
}

async fn generate_notes(h: &Harness, text: &str) -> GenerationRequest {
    let (doc, payload) = intake::from_upload("notes.txt", text.as_bytes().to_vec(), None).unwrap();
    h.orchestrator
        .generate(doc, payload, ArtifactType::Flashcards, GenerationOptions::default())
        .await
        .unwrap()
}

async fn wait_terminal(orchestrator: &Orchestrator, request_id: &str) -> GenerationRequest {
    for _ in 0..500 {
        let request = orchestrator.request_status(request_id).await.unwrap();
        if request.status.is_terminal() {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {} never reached a terminal state", request_id);
}

/// A PDF whose pages carry only a JPEG image XObject, no text.
fn scanned_pdf(page_images: &[&[u8]]) -> Vec<u8> {
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    for bytes in page_images {
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            bytes.to_vec(),
        ));
        let content_id = doc.add_object(Stream::new(dictionary! {}, Vec::new()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_text_generates_flashcards() {
    let ai = ScriptedAi::always(FLASHCARDS);
    let h = harness(ai.clone());

    let request = generate_notes(&h, NOTES).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.artifact_ids.len(), 2);
    assert_eq!(request.new_artifacts, 2);
    assert_eq!(request.topic.as_deref(), Some("Cell biology"));
    assert!(!request.chunk_ids.is_empty());

    let artifacts = h
        .orchestrator
        .list_artifacts(&request.source_document_id)
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|a| a.request_id == request.request_id));
    assert_eq!(h.remote.len(), 2);
    assert_eq!(ai.prompts().len(), 1);

    let stored = h.orchestrator.request_status(&request.request_id).await.unwrap();
    assert_eq!(stored, request);
}

#[tokio::test]
async fn scanned_pdf_is_ocrd_and_low_confidence_page_is_flagged() {
    let h = harness_with(
        ScriptedAi::always(FLASHCARDS),
        Arc::new(PageOcr),
        StaticFetcher::new(""),
    );
    let pdf = scanned_pdf(&[b"page-one", b"page-two"]);
    let (doc, payload) = intake::from_upload("lecture.pdf", pdf, None).unwrap();
    let doc_id = doc.id.clone();

    let request = h
        .orchestrator
        .generate(doc, payload, ArtifactType::Flashcards, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed, "{:?}", request.status);

    let segments = h.local.segments(&doc_id).await.unwrap();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].provenance.locator, Locator::Page { page: 1 });
    assert!(!segments[0].provenance.low_confidence);
    assert_eq!(segments[1].provenance.locator, Locator::Page { page: 2 });
    assert!(segments[1].provenance.low_confidence);
    assert_eq!(segments[1].text, "Ribosomes bu1ld pr0teins.");

    assert_eq!(
        request.warnings,
        vec!["low-confidence OCR text at page 2 (confidence 0.40)".to_string()]
    );
}

#[tokio::test]
async fn rate_limit_waits_follow_retry_after() {
    let limited = || {
        Err(ExternalServiceError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        })
    };
    let ai = ScriptedAi::new(vec![limited(), limited()], FLASHCARDS);
    let h = harness(ai.clone());

    let request = generate_notes(&h, NOTES).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(
        h.clock.sleeps(),
        vec![Duration::from_secs(30), Duration::from_secs(30)]
    );
    assert_eq!(ai.prompts().len(), 3);
}

#[tokio::test]
async fn transient_failures_back_off_then_give_up() {
    let down = || Err(ExternalServiceError::Unavailable("503".into()));
    let ai = ScriptedAi::new(vec![down(), down(), down(), down()], FLASHCARDS);
    let h = harness(ai.clone());

    let request = generate_notes(&h, NOTES).await;
    assert!(matches!(
        request.status,
        RequestStatus::Failed {
            reason: FailureReason::ExternalService { .. }
        }
    ));
    assert_eq!(
        h.clock.sleeps(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(ai.prompts().len(), 4);
}

#[tokio::test]
async fn rejected_call_is_not_retried() {
    let ai = ScriptedAi::new(
        vec![Err(ExternalServiceError::Rejected("400 bad key".into()))],
        FLASHCARDS,
    );
    let h = harness(ai.clone());

    let request = generate_notes(&h, NOTES).await;
    assert!(matches!(request.status, RequestStatus::Failed { .. }));
    assert!(h.clock.sleeps().is_empty());
    assert_eq!(ai.prompts().len(), 1);
}

#[tokio::test]
async fn malformed_response_gets_a_correction_prompt() {
    let ai = ScriptedAi::new(
        vec![Ok("Sure! Here are some flashcards about cells.".to_string())],
        FLASHCARDS,
    );
    let h = harness(ai.clone());

    let request = generate_notes(&h, NOTES).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.artifact_ids.len(), 2);

    let prompts = ai.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].correction);
    assert!(prompts[1].correction);
    assert_eq!(prompts[0].included_chunk_ids, prompts[1].included_chunk_ids);
}

#[tokio::test]
async fn persistent_malformed_responses_fail_the_request() {
    let ai = ScriptedAi::always("not json at all");
    let h = harness(ai.clone());

    let request = generate_notes(&h, NOTES).await;
    assert!(matches!(
        request.status,
        RequestStatus::Failed {
            reason: FailureReason::MalformedResponse { .. }
        }
    ));
    // First attempt plus the configured correction prompts.
    assert_eq!(ai.prompts().len(), 3);
    assert!(h
        .orchestrator
        .list_artifacts(&request.source_document_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn regeneration_does_not_duplicate_artifacts() {
    let h = harness(ScriptedAi::always(FLASHCARDS));

    let first = generate_notes(&h, NOTES).await;
    let second = generate_notes(&h, NOTES).await;

    assert_eq!(first.source_document_id, second.source_document_id);
    assert_eq!(second.status, RequestStatus::Completed);
    assert_eq!(second.artifact_ids, first.artifact_ids);
    assert_eq!(second.new_artifacts, 0);

    let artifacts = h
        .orchestrator
        .list_artifacts(&first.source_document_id)
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(h.remote.write_log().len(), 2);
}

#[tokio::test]
async fn empty_source_ends_with_no_content() {
    let ai = ScriptedAi::always(FLASHCARDS);
    let h = harness(ai.clone());

    let request = generate_notes(&h, "   \n\n   \n").await;
    assert_eq!(request.status, RequestStatus::NoContent);
    assert!(request.artifact_ids.is_empty());
    assert!(ai.prompts().is_empty());
}

#[tokio::test]
async fn offline_remote_queues_writes_and_drains_in_order() {
    let h = harness(ScriptedAi::always(FLASHCARDS));
    h.remote.set_mode(RemoteMode::Offline);

    let request = generate_notes(&h, NOTES).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(h.remote.is_empty());
    for id in &request.artifact_ids {
        let record = h.local.sync_record(id).await.unwrap().unwrap();
        assert_eq!(record.local_state, SyncState::Unsynced);
    }
    assert_eq!(h.local.pending().await.unwrap().len(), 2);

    // Still offline: nothing moves.
    let report = h.orchestrator.drain().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.still_pending, 2);
    assert_eq!(report.blocked_documents, vec![request.source_document_id.clone()]);

    h.remote.set_mode(RemoteMode::Online);
    let report = h.orchestrator.drain().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.still_pending, 0);
    assert_eq!(h.remote.write_log(), request.artifact_ids);
    for id in &request.artifact_ids {
        let record = h.local.sync_record(id).await.unwrap().unwrap();
        assert_eq!(record.local_state, SyncState::Synced);
        assert!(record.remote_version.is_some());
    }
    assert!(h.local.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn persistence_failure_resumes_at_persisting() {
    let ai = ScriptedAi::always(FLASHCARDS);
    let h = harness(ai.clone());
    h.local.set_fail_artifact_writes(true);

    let failed = generate_notes(&h, NOTES).await;
    assert!(matches!(
        failed.status,
        RequestStatus::Failed {
            reason: FailureReason::PersistenceError { .. }
        }
    ));

    h.local.set_fail_artifact_writes(false);
    let retried = h.orchestrator.retry(&failed.request_id).await.unwrap();
    assert_eq!(retried.status, RequestStatus::Completed);
    assert_eq!(retried.retries, 1);
    assert_eq!(retried.new_artifacts, 2);
    // The model was not asked again.
    assert_eq!(ai.prompts().len(), 1);
}

#[tokio::test]
async fn only_failed_requests_can_be_retried() {
    let h = harness(ScriptedAi::always(FLASHCARDS));
    let done = generate_notes(&h, NOTES).await;

    let err = h.orchestrator.retry(&done.request_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));

    let err = h.orchestrator.retry("missing").await.unwrap_err();
    assert!(matches!(err, PipelineError::RequestNotFound(_)));
}

#[tokio::test]
async fn cancellation_is_observed_after_the_ai_call() {
    let ai = Arc::new(GatedAi {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let h = harness(ai.clone());
    let (doc, payload) = intake::from_upload("notes.txt", NOTES.as_bytes().to_vec(), None).unwrap();

    let request_id = h
        .orchestrator
        .submit_source(doc, payload, ArtifactType::Flashcards, GenerationOptions::default())
        .await
        .unwrap();
    ai.entered.notified().await;

    let snapshot = h.orchestrator.cancel(&request_id).await.unwrap();
    assert!(!snapshot.status.is_terminal());
    ai.release.notify_one();

    let done = wait_terminal(&h.orchestrator, &request_id).await;
    assert_eq!(
        done.status,
        RequestStatus::Failed {
            reason: FailureReason::Cancelled
        }
    );
    assert!(done.artifact_ids.is_empty());

    let err = h.orchestrator.cancel(&request_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));
}

const PAGE: &str = r#"<html><head><title>Cells</title><script>track()</script></head>
<body>
  <nav><a href="/">Home</a></nav>
  <main>
    <h1>The cell</h1>
    <p>Cells are the basic unit of life.</p>
    <h2>Organelles</h2>
    <p>Mitochondria produce ATP.</p>
  </main>
  <footer>Copyright</footer>
</body></html>"#;

const SUMMARY: &str = r#"{"topic":"Cells","sections":[
    {"heading":"The cell","body":"Cells are the basic unit of life."},
    {"heading":"Organelles","body":"Mitochondria produce ATP."}
]}"#;

#[tokio::test]
async fn web_page_is_fetched_and_summarized() {
    let fetcher = StaticFetcher::new(PAGE);
    let h = harness_with(ScriptedAi::always(SUMMARY), Arc::new(NoOcr), fetcher.clone());
    let (doc, payload) = intake::from_url("https://example.org/cells").unwrap();
    let doc_id = doc.id.clone();

    let request = h
        .orchestrator
        .generate(doc, payload, ArtifactType::Summary, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.artifact_ids.len(), 2);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    let segments = h.local.segments(&doc_id).await.unwrap();
    let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
    assert!(texts.contains(&"Mitochondria produce ATP."));
    assert!(!texts.iter().any(|t| t.contains("Home") || t.contains("Copyright") || t.contains("track")));
    assert!(segments
        .iter()
        .all(|s| matches!(s.provenance.locator, Locator::Web { .. })));
}

#[tokio::test]
async fn concurrent_requests_for_one_document_extract_once() {
    let fetcher = StaticFetcher::new(PAGE);
    let h = harness_with(ScriptedAi::always(SUMMARY), Arc::new(NoOcr), fetcher.clone());

    let run = |o: Orchestrator| async move {
        let (doc, payload) = intake::from_url("https://example.org/cells").unwrap();
        o.generate(doc, payload, ArtifactType::Summary, GenerationOptions::default())
            .await
            .unwrap()
    };
    let (a, b) = tokio::join!(
        run(h.orchestrator.clone()),
        run(h.orchestrator.clone())
    );

    assert_eq!(a.status, RequestStatus::Completed);
    assert_eq!(b.status, RequestStatus::Completed);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(a.artifact_ids, b.artifact_ids);
    let artifacts = h
        .orchestrator
        .list_artifacts(&a.source_document_id)
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 2);
}

#[tokio::test]
async fn pull_merges_remote_artifacts() {
    let h = harness(ScriptedAi::always(FLASHCARDS));
    let request = generate_notes(&h, NOTES).await;

    // Another device produced a card for the same document.
    let other = study_harness_core::models::StudyArtifact::new(
        "elsewhere",
        &request.source_document_id,
        study_harness_core::models::SegmentSpan { first: 0, last: 0 },
        Utc::now(),
        study_harness_core::models::ArtifactBody::Flashcard {
            front: "What is a ribosome?".into(),
            back: "A protein factory".into(),
        },
    );
    h.remote.seed(other.clone());

    let added = h.orchestrator.pull(&request.source_document_id).await.unwrap();
    assert_eq!(added, 1);
    let local = h
        .orchestrator
        .list_artifacts(&request.source_document_id)
        .await
        .unwrap();
    assert_eq!(local.len(), 3);
    assert_eq!(h.orchestrator.pull(&request.source_document_id).await.unwrap(), 0);
}

#[tokio::test]
async fn rejected_remote_writes_are_queued_and_replayed() {
    let h = harness(ScriptedAi::always(FLASHCARDS));
    h.remote.set_mode(RemoteMode::Failing);

    let request = generate_notes(&h, NOTES).await;
    assert_eq!(request.status, RequestStatus::Completed);
    for id in &request.artifact_ids {
        let record = h.local.sync_record(id).await.unwrap().unwrap();
        assert_eq!(record.local_state, SyncState::Unsynced);
    }
    assert_eq!(h.local.pending().await.unwrap().len(), 2);

    // The queue outlives the process that filled it.
    let after = restarted(&h, ScriptedAi::always(FLASHCARDS));
    h.remote.set_mode(RemoteMode::Online);
    let report = after.drain().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.still_pending, 0);
    assert_eq!(h.remote.write_log(), request.artifact_ids);
}

#[tokio::test]
async fn retry_after_restart_syncs_stored_artifacts() {
    let ai = ScriptedAi::always(FLASHCARDS);
    let h = harness(ai.clone());
    h.local.set_fail_sync_writes(true);

    let failed = generate_notes(&h, NOTES).await;
    assert!(matches!(
        failed.status,
        RequestStatus::Failed {
            reason: FailureReason::PersistenceError { .. }
        }
    ));
    let stored = h
        .local
        .list_artifacts(&failed.source_document_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert!(h.remote.is_empty());

    h.local.set_fail_sync_writes(false);
    let after = restarted(&h, ai.clone());
    let retried = after.retry(&failed.request_id).await.unwrap();
    assert_eq!(retried.status, RequestStatus::Completed);
    assert_eq!(retried.new_artifacts, 2);
    assert_eq!(ai.prompts().len(), 1);
    assert_eq!(h.remote.write_log(), failed.artifact_ids);
    for id in &failed.artifact_ids {
        let record = h.local.sync_record(id).await.unwrap().unwrap();
        assert_eq!(record.local_state, SyncState::Synced);
    }
}

#[tokio::test]
async fn concurrent_retries_drive_the_request_once() {
    let ai = ScriptedAi::always(FLASHCARDS);
    let h = harness(ai.clone());
    h.local.set_fail_artifact_writes(true);
    let failed = generate_notes(&h, NOTES).await;
    assert!(matches!(failed.status, RequestStatus::Failed { .. }));
    h.local.set_fail_artifact_writes(false);

    let (a, b) = tokio::join!(
        h.orchestrator.retry(&failed.request_id),
        h.orchestrator.retry(&failed.request_id)
    );
    let (done, refused) = match (a, b) {
        (Ok(done), Err(refused)) | (Err(refused), Ok(done)) => (done, refused),
        (a, b) => panic!("expected exactly one retry to run: {:?} / {:?}", a, b),
    };
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.retries, 1);
    assert!(matches!(refused, PipelineError::InvalidState(_)));
    assert_eq!(ai.prompts().len(), 1);
}

#[tokio::test]
async fn cancel_right_after_submit_is_not_lost() {
    let ai = ScriptedAi::always(FLASHCARDS);
    let h = harness(ai.clone());
    let (doc, payload) = intake::from_upload("notes.txt", NOTES.as_bytes().to_vec(), None).unwrap();

    let request_id = h
        .orchestrator
        .submit_source(doc, payload, ArtifactType::Flashcards, GenerationOptions::default())
        .await
        .unwrap();
    h.orchestrator.cancel(&request_id).await.unwrap();

    let done = wait_terminal(&h.orchestrator, &request_id).await;
    assert_eq!(
        done.status,
        RequestStatus::Failed {
            reason: FailureReason::Cancelled
        }
    );
    assert!(ai.prompts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_never_overwrites_a_finished_request() {
    let h = harness(ScriptedAi::always(FLASHCARDS));

    for i in 0..25 {
        let text = format!("{}\n\nRevision {}.", NOTES, i);
        let (doc, payload) = intake::from_upload("notes.txt", text.into_bytes(), None).unwrap();
        let doc_id = doc.id.clone();
        let request_id = h
            .orchestrator
            .submit_source(doc, payload, ArtifactType::Flashcards, GenerationOptions::default())
            .await
            .unwrap();
        if i % 2 == 1 {
            tokio::task::yield_now().await;
        }
        match h.orchestrator.cancel(&request_id).await {
            Ok(_) => {}
            Err(PipelineError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected cancel error: {}", e),
        }

        let done = wait_terminal(&h.orchestrator, &request_id).await;
        let artifacts = h.orchestrator.list_artifacts(&doc_id).await.unwrap();
        match &done.status {
            RequestStatus::Completed => assert_eq!(artifacts.len(), 2),
            RequestStatus::Failed {
                reason: FailureReason::Cancelled,
            } => assert!(artifacts.is_empty()),
            other => panic!("unexpected final state {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = h.orchestrator.request_status(&request_id).await.unwrap();
        assert_eq!(again.status, done.status);
    }
}

const TRANSCRIPT_MENU: &str = r#"{"languageMenu": [
    {"title": "Español", "params": "es-track"},
    {"title": "English (auto-generated)", "params": "en-track"}
]}"#;

const TRANSCRIPT: &str = r#"{"transcript": [
    {"text": "Today we look at the cell.", "start": 0.0},
    {"text": "Mitochondria produce ATP.", "start": 2.5},
    {"text": "The nucleus stores DNA.", "start": 5.1}
]}"#;

#[tokio::test]
async fn youtube_video_is_read_from_its_transcript() {
    let transcripts = CannedTranscripts::new(&[TRANSCRIPT_MENU, TRANSCRIPT]);
    let ai = ScriptedAi::always(SUMMARY);
    let h = build_harness(
        ai.clone(),
        Arc::new(NoOcr),
        StaticFetcher::new(""),
        transcripts.clone(),
    );
    let (doc, payload) = intake::from_url("https://www.youtube.com/watch?v=abc123XYZ_-&t=12").unwrap();
    assert_eq!(doc.kind, SourceKind::YouTube);
    let doc_id = doc.id.clone();

    let request = h
        .orchestrator
        .generate(doc, payload, ArtifactType::Summary, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed, "{:?}", request.status);
    assert_eq!(request.artifact_ids.len(), 2);
    assert_eq!(
        *transcripts.tracks.lock().unwrap(),
        vec![None, Some("en-track".to_string())]
    );

    let segments = h.local.segments(&doc_id).await.unwrap();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[1].text, "Mitochondria produce ATP.");
    assert!(segments
        .iter()
        .all(|s| matches!(&s.provenance.locator, Locator::Transcript { video_id, .. } if video_id == "abc123XYZ_-")));
    assert!(ai.prompts()[0].rendered_text.contains("video abc123XYZ_- captions 0-2"));
}

#[tokio::test]
async fn youtube_video_without_captions_fails_extraction() {
    let transcripts = CannedTranscripts::new(&[r#"{"message": "Transcript is disabled on this video"}"#]);
    let ai = ScriptedAi::always(SUMMARY);
    let h = build_harness(ai.clone(), Arc::new(NoOcr), StaticFetcher::new(""), transcripts);
    let (doc, payload) = intake::from_url("https://youtu.be/abc123XYZ_-").unwrap();

    let request = h
        .orchestrator
        .generate(doc, payload, ArtifactType::Summary, GenerationOptions::default())
        .await
        .unwrap();
    match &request.status {
        RequestStatus::Failed {
            reason: FailureReason::Extraction { message },
        } => assert!(message.contains("Transcript is disabled"), "{}", message),
        other => panic!("unexpected state {:?}", other),
    }
    assert!(ai.prompts().is_empty());
    assert!(h.clock.sleeps().is_empty());
}

const QUIZ: &str = r#"{"topic":"Cell energy","questions":[
    {"question":"What do mitochondria produce?","choices":["ATP","DNA","RNA","Lipids"],
     "correctIndex":0,"explanation":"Mitochondria run cellular respiration."},
    {"question":"Where is DNA stored?","choices":["Ribosome","Nucleus","Membrane","Vacuole"],
     "correctIndex":1,"explanation":"The nucleus holds the genome."}
]}"#;

const REMASTERED_QUIZ: &str = r#"{"topic":"Cell energy","questions":[
    {"question":"A cell's mitochondria stop working. Which molecule runs short first?",
     "choices":["ATP","Glucose","Water","Oxygen"],"correctIndex":0,
     "explanation":"ATP comes from respiration in the mitochondria."}
]}"#;

#[tokio::test]
async fn quiz_is_regenerated_from_its_prior_questions() {
    let ai = ScriptedAi::new(vec![Ok(QUIZ.to_string())], REMASTERED_QUIZ);
    let h = harness(ai.clone());
    let (doc, payload) = intake::from_upload("notes.txt", NOTES.as_bytes().to_vec(), None).unwrap();
    let first = h
        .orchestrator
        .generate(doc, payload, ArtifactType::Quiz, GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, RequestStatus::Completed);
    assert_eq!(first.artifact_ids.len(), 2);

    let options = GenerationOptions {
        item_count: 1,
        difficulty: Difficulty::Hard,
    };
    let again = h
        .orchestrator
        .regenerate_quiz(&first.source_document_id, options)
        .await
        .unwrap();
    assert_eq!(again.status, RequestStatus::Completed, "{:?}", again.status);
    assert_eq!(again.artifact_type, ArtifactType::Quiz);
    assert_eq!(again.regenerated_from, first.artifact_ids);
    assert_eq!(again.artifact_ids.len(), 1);
    assert_eq!(again.new_artifacts, 1);
    assert_eq!(again.topic.as_deref(), Some("Cell energy"));
    assert!(again.chunk_ids.is_empty());

    let prompts = ai.prompts();
    assert_eq!(prompts.len(), 2);
    let remaster = &prompts[1].rendered_text;
    assert!(remaster.contains("What do mitochondria produce?"));
    assert!(remaster.contains("Where is DNA stored?"));
    assert!(remaster.contains("Keep the topic title \"Cell energy\""));
    assert!(remaster.contains("1 multiple-choice questions at hard difficulty"));
    assert!(!remaster.contains("SOURCE TEXT"));

    let artifacts = h
        .orchestrator
        .list_artifacts(&first.source_document_id)
        .await
        .unwrap();
    assert_eq!(artifacts.len(), 3);
    let regenerated = artifacts
        .iter()
        .find(|a| a.artifact_id == again.artifact_ids[0])
        .unwrap();
    assert_eq!(regenerated.request_id, again.request_id);
    assert_eq!(regenerated.source_span, first_span(&artifacts, &first));
}

/// Span covered by the artifacts of `request`.
fn first_span(
    artifacts: &[study_harness_core::models::StudyArtifact],
    request: &GenerationRequest,
) -> study_harness_core::models::SegmentSpan {
    artifacts
        .iter()
        .filter(|a| request.artifact_ids.contains(&a.artifact_id))
        .map(|a| a.source_span)
        .reduce(|a, b| study_harness_core::models::SegmentSpan {
            first: a.first.min(b.first),
            last: a.last.max(b.last),
        })
        .unwrap()
}

#[tokio::test]
async fn regeneration_needs_an_existing_quiz() {
    let h = harness(ScriptedAi::always(FLASHCARDS));
    let cards = generate_notes(&h, NOTES).await;

    let err = h
        .orchestrator
        .regenerate_quiz(&cards.source_document_id, GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));

    let err = h
        .orchestrator
        .regenerate_quiz("unknown", GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::DocumentNotFound(_)));
}
