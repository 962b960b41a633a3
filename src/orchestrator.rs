//! Generation orchestrator.
//!
//! Drives each [`GenerationRequest`] through its lifecycle:
//!
//! ```text
//! Created → Extracting → Normalizing → Prompting → AwaitingAi → Parsing
//!         → Deduplicating → Persisting → Completed
//! ```
//!
//! Every transition is saved to the local store, so `request_status` always
//! reflects the latest state. Side effects happen only while `Extracting`
//! (OCR, fetch), `AwaitingAi` and `Persisting`; the other stages are pure
//! computations over data already in hand.
//!
//! # Quiz regeneration
//!
//! [`Orchestrator::regenerate_quiz`] runs a quiz request whose prompt is
//! built from a document's existing quiz items instead of its text. It goes
//! through the same states; extraction and normalization pass straight
//! through because no source text is sent.
//!
//! # Concurrency
//!
//! Requests run independently. A per-document async mutex is held during
//! extraction and around each AI call (retries included), so two requests
//! for the same document queue instead of extracting twice or spending
//! two model calls at once. Cancellation is observed at transitions only:
//! an AI call already in flight completes and its result is discarded.
//!
//! # Retry
//!
//! A failed request keeps its stage outputs in memory. [`Orchestrator::retry`]
//! resumes at the stage after the last checkpoint whose output is still
//! available, never at `Created`. After a restart the in-memory outputs are
//! gone; a request whose artifacts all reached the local store still resumes
//! at `Persisting`, anything else recomputes from the stored segments.
//!
//! At most one run per request is registered at a time. Retry and cancel
//! claim the registration before touching the stored snapshot, so they never
//! interleave with a live run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use study_harness_core::error::{ExternalServiceError, ExtractionError, ParseError, PersistenceError};
use study_harness_core::models::{
    AiPrompt, ArtifactType, Checkpoint, ExtractionStatus, FailureReason, GenerationOptions,
    GenerationRequest, RequestStatus, SegmentSpan, SourceDocument, SourceKind, SourcePayload,
    StudyArtifact, SyncState, TextSegment,
};
use study_harness_core::normalize::TextNormalizer;
use study_harness_core::parse::{parse, ParseContext, ParsedArtifacts};
use study_harness_core::prompt::PromptBuilder;
use study_harness_core::retry::{RetryDecision, RetryKind, RetryPolicy, RetryState};
use study_harness_core::services::{AiService, Clock, HtmlFetcher, ModelConfig, OcrEngine, TranscriptApi};
use study_harness_core::store::{LocalStore, RemoteStore};
use study_harness_core::sync::{ArtifactStore, DrainReport};

use crate::ai::create_ai_service;
use crate::clock::TokioClock;
use crate::config::Config;
use crate::extract::{ExtractionSettings, SourceExtractor};
use crate::extract_web::ReqwestFetcher;
use crate::extract_youtube::create_transcript_api;
use crate::ocr::create_ocr_engine;
use crate::remote::create_remote_store;

/// Errors returned by the orchestrator's public operations. Pipeline
/// failures are not errors here: they are recorded on the request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request not found: {0}")]
    RequestNotFound(String),
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// External collaborators the pipeline talks to.
#[derive(Clone)]
pub struct Services {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub ai: Arc<dyn AiService>,
    pub ocr: Arc<dyn OcrEngine>,
    pub fetcher: Arc<dyn HtmlFetcher>,
    pub transcripts: Arc<dyn TranscriptApi>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Build the configured network clients around `local`.
    pub fn from_config(config: &Config, local: Arc<dyn LocalStore>) -> anyhow::Result<Self> {
        Ok(Self {
            local,
            remote: create_remote_store(&config.remote)?,
            ai: create_ai_service(&config.ai)?,
            ocr: create_ocr_engine(&config.ocr)?,
            fetcher: Arc::new(ReqwestFetcher::new(&config.extraction)?),
            transcripts: create_transcript_api(&config.youtube)?,
            clock: Arc::new(TokioClock),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub extraction: ExtractionSettings,
    /// Upper bound on a single extraction attempt.
    pub extraction_timeout: Duration,
    pub max_chunk_tokens: usize,
    pub token_budget: usize,
    /// Upper bound on a single AI call attempt.
    pub ai_timeout: Duration,
    pub retry: RetryPolicy,
    /// Correction prompts allowed per batch after malformed responses.
    pub parse_retries: u32,
    pub model: ModelConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extraction: ExtractionSettings::from_config(config),
            extraction_timeout: Duration::from_secs(config.extraction.timeout_secs),
            max_chunk_tokens: config.chunking.max_tokens,
            token_budget: config.ai.token_budget,
            ai_timeout: Duration::from_secs(config.ai.timeout_secs),
            retry: config.ai.retry_policy(),
            parse_retries: config.ai.parse_retries,
            model: config.ai.model_config(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One async mutex per document id.
///
/// Guards are owned, so they can be held across `.await` and are released
/// on every exit path when dropped.
#[derive(Clone, Default)]
pub struct DocumentLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub async fn acquire(&self, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(document_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Stage outputs kept for retry. Lost on restart, in which case retry
/// falls back to recomputing from stored segments.
#[derive(Default)]
struct RequestWork {
    payload: Option<SourcePayload>,
    candidates: Option<Vec<StudyArtifact>>,
    survivors: Option<Vec<StudyArtifact>>,
}

/// In-flight state of one run over a request.
struct Run {
    request: GenerationRequest,
    token: CancellationToken,
    segments: Vec<TextSegment>,
    chunks: Vec<TextSegment>,
    /// Index of the first chunk not yet sent to the model.
    next_chunk: usize,
    /// Chunks covered by the current prompt.
    batch: Vec<TextSegment>,
    prompt: Option<AiPrompt>,
    response: Option<String>,
    /// Validation error to quote in the next correction prompt.
    correction: Option<String>,
    parse_failures: u32,
    candidates: Vec<StudyArtifact>,
    survivors: Vec<StudyArtifact>,
    /// Source span of the quiz items a regeneration prompt was built from.
    prior_span: Option<SegmentSpan>,
}

impl Run {
    fn new(request: GenerationRequest, token: CancellationToken) -> Self {
        Self {
            request,
            token,
            segments: Vec::new(),
            chunks: Vec::new(),
            next_chunk: 0,
            batch: Vec::new(),
            prompt: None,
            response: None,
            correction: None,
            parse_failures: 0,
            candidates: Vec::new(),
            survivors: Vec::new(),
            prior_span: None,
        }
    }

    fn regenerating(&self) -> bool {
        !self.request.regenerated_from.is_empty()
    }
}

struct Inner {
    services: Services,
    settings: PipelineSettings,
    store: ArtifactStore,
    locks: DocumentLocks,
    work: DashMap<String, RequestWork>,
    running: DashMap<String, CancellationToken>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn persistence(e: PersistenceError) -> FailureReason {
    FailureReason::PersistenceError {
        message: e.to_string(),
    }
}

fn internal(message: &str) -> FailureReason {
    FailureReason::Internal {
        message: message.to_string(),
    }
}

impl Orchestrator {
    pub fn new(services: Services, settings: PipelineSettings) -> Self {
        let store = ArtifactStore::new(services.local.clone(), services.remote.clone());
        Self {
            inner: Arc::new(Inner {
                services,
                settings,
                store,
                locks: DocumentLocks::default(),
                work: DashMap::new(),
                running: DashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.inner.services.local
    }

    /// Register the document and a new request in `Created`. The run is
    /// registered before the snapshot is saved, so a cancel that sees the
    /// request always finds its token.
    async fn start(
        &self,
        document: SourceDocument,
        payload: SourcePayload,
        artifact_type: ArtifactType,
        options: GenerationOptions,
    ) -> Result<Run, PipelineError> {
        let services = &self.inner.services;
        services.local.upsert_document(&document).await?;
        let request = GenerationRequest::new(
            Uuid::new_v4().to_string(),
            document.id.clone(),
            artifact_type,
            options,
            services.clock.now(),
        );
        let token = self.register(&request.request_id);
        if let Err(e) = services.local.save_request(&request).await {
            self.inner.running.remove(&request.request_id);
            return Err(e.into());
        }
        self.inner.work.insert(
            request.request_id.clone(),
            RequestWork {
                payload: Some(payload),
                ..RequestWork::default()
            },
        );
        info!(
            request_id = %request.request_id,
            document_id = %document.id,
            kind = %document.kind,
            artifact_type = %artifact_type,
            "request created"
        );
        Ok(Run::new(request, token))
    }

    /// Start a request in the background and return its id immediately.
    pub async fn submit_source(
        &self,
        document: SourceDocument,
        payload: SourcePayload,
        artifact_type: ArtifactType,
        options: GenerationOptions,
    ) -> Result<String, PipelineError> {
        let run = self
            .start(document, payload, artifact_type, options)
            .await?;
        let request_id = run.request.request_id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run).await;
        });
        Ok(request_id)
    }

    /// Run a request to a terminal state and return it.
    pub async fn generate(
        &self,
        document: SourceDocument,
        payload: SourcePayload,
        artifact_type: ArtifactType,
        options: GenerationOptions,
    ) -> Result<GenerationRequest, PipelineError> {
        let run = self
            .start(document, payload, artifact_type, options)
            .await?;
        Ok(self.drive(run).await)
    }

    /// Regenerate a document's quiz from its existing quiz items and run the
    /// request to a terminal state.
    pub async fn regenerate_quiz(
        &self,
        source_document_id: &str,
        options: GenerationOptions,
    ) -> Result<GenerationRequest, PipelineError> {
        let run = self.start_regeneration(source_document_id, options).await?;
        Ok(self.drive(run).await)
    }

    /// Start a quiz regeneration in the background and return its request id.
    pub async fn submit_regeneration(
        &self,
        source_document_id: &str,
        options: GenerationOptions,
    ) -> Result<String, PipelineError> {
        let run = self.start_regeneration(source_document_id, options).await?;
        let request_id = run.request.request_id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run).await;
        });
        Ok(request_id)
    }

    async fn start_regeneration(
        &self,
        source_document_id: &str,
        options: GenerationOptions,
    ) -> Result<Run, PipelineError> {
        let local = &self.inner.services.local;
        if local.get_document(source_document_id).await?.is_none() {
            return Err(PipelineError::DocumentNotFound(source_document_id.to_string()));
        }
        let prior: Vec<String> = local
            .list_artifacts(source_document_id)
            .await?
            .into_iter()
            .filter(|a| a.body.artifact_type() == ArtifactType::Quiz)
            .map(|a| a.artifact_id)
            .collect();
        if prior.is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "document {} has no quiz items to regenerate",
                source_document_id
            )));
        }

        let mut request = GenerationRequest::new(
            Uuid::new_v4().to_string(),
            source_document_id.to_string(),
            ArtifactType::Quiz,
            options,
            self.inner.services.clock.now(),
        );
        request.regenerated_from = prior;
        let token = self.register(&request.request_id);
        if let Err(e) = local.save_request(&request).await {
            self.inner.running.remove(&request.request_id);
            return Err(e.into());
        }
        info!(
            request_id = %request.request_id,
            document_id = source_document_id,
            prior_items = request.regenerated_from.len(),
            "quiz regeneration created"
        );
        Ok(Run::new(request, token))
    }

    pub async fn request_status(&self, request_id: &str) -> Result<GenerationRequest, PipelineError> {
        self.inner
            .services
            .local
            .get_request(request_id)
            .await?
            .ok_or_else(|| PipelineError::RequestNotFound(request_id.to_string()))
    }

    pub async fn list_requests(&self, limit: usize) -> Result<Vec<GenerationRequest>, PipelineError> {
        Ok(self.inner.services.local.list_requests(limit).await?)
    }

    pub async fn list_artifacts(
        &self,
        source_document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PipelineError> {
        Ok(self
            .inner
            .services
            .local
            .list_artifacts(source_document_id)
            .await?)
    }

    /// Resume a failed request and run it to a terminal state.
    pub async fn retry(&self, request_id: &str) -> Result<GenerationRequest, PipelineError> {
        let run = self.prepare_retry(request_id).await?;
        Ok(self.drive(run).await)
    }

    /// Resume a failed request in the background. Returns the resumed snapshot.
    pub async fn spawn_retry(&self, request_id: &str) -> Result<GenerationRequest, PipelineError> {
        let run = self.prepare_retry(request_id).await?;
        let snapshot = run.request.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run).await;
        });
        Ok(snapshot)
    }

    /// Ask a request to stop. A running request fails with `Cancelled` at its
    /// next transition; one that is not running here fails immediately.
    pub async fn cancel(&self, request_id: &str) -> Result<GenerationRequest, PipelineError> {
        let request = self.request_status(request_id).await?;
        if request.status.is_terminal() {
            return Err(already_finished(&request));
        }
        if self.signal(request_id) {
            info!(request_id, state = request.status.name(), "cancellation requested");
            return Ok(request);
        }

        // Nothing drives it here. Claim it so no run starts while it is
        // failed, then re-read: a run that finished in between has already
        // saved its terminal state.
        let Some(_token) = self.claim(request_id) else {
            self.signal(request_id);
            info!(request_id, "cancellation requested");
            return Ok(request);
        };
        let result = self.cancel_idle(request_id).await;
        self.inner.running.remove(request_id);
        result
    }

    async fn cancel_idle(&self, request_id: &str) -> Result<GenerationRequest, PipelineError> {
        let mut request = self.request_status(request_id).await?;
        if request.status.is_terminal() {
            return Err(already_finished(&request));
        }
        request
            .fail(FailureReason::Cancelled, self.inner.services.clock.now())
            .map_err(|e| PipelineError::InvalidState(e.to_string()))?;
        self.inner.services.local.save_request(&request).await?;
        info!(request_id, "cancelled request that was not running");
        Ok(request)
    }

    /// Cancel the registered run, if any.
    fn signal(&self, request_id: &str) -> bool {
        match self.inner.running.get(request_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Replay the offline write queue.
    pub async fn drain(&self) -> Result<DrainReport, PipelineError> {
        let report = self
            .inner
            .store
            .drain(self.inner.services.clock.now())
            .await?;
        Ok(report)
    }

    /// Merge a document's remote artifacts into the local store.
    pub async fn pull(&self, source_document_id: &str) -> Result<usize, PipelineError> {
        let merged = self
            .inner
            .store
            .pull(source_document_id, self.inner.services.clock.now())
            .await?;
        Ok(merged)
    }

    fn register(&self, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .running
            .insert(request_id.to_string(), token.clone());
        token
    }

    /// Register a run for `request_id` unless one is already registered.
    fn claim(&self, request_id: &str) -> Option<CancellationToken> {
        match self.inner.running.entry(request_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(token)
            }
        }
    }

    async fn prepare_retry(&self, request_id: &str) -> Result<Run, PipelineError> {
        let token = self.claim(request_id).ok_or_else(|| {
            PipelineError::InvalidState(format!("request {} is still running", request_id))
        })?;
        match self.resume(request_id, token).await {
            Ok(run) => Ok(run),
            Err(e) => {
                self.inner.running.remove(request_id);
                Err(e)
            }
        }
    }

    async fn resume(&self, request_id: &str, token: CancellationToken) -> Result<Run, PipelineError> {
        let mut request = self.request_status(request_id).await?;
        if !matches!(request.status, RequestStatus::Failed { .. }) {
            return Err(PipelineError::InvalidState(format!(
                "only failed requests can be retried; {} is {}",
                request_id,
                request.status.name()
            )));
        }

        let (candidates, mut survivors) = match self.inner.work.get(request_id) {
            Some(work) => (work.candidates.clone(), work.survivors.clone()),
            None => (None, None),
        };
        let fallback = if survivors.is_some() {
            Checkpoint::Deduplicated
        } else if candidates.is_some() {
            Checkpoint::Parsed
        } else if request.checkpoint >= Checkpoint::Deduplicated
            && self.all_stored(&request.artifact_ids).await?
        {
            // Every resolved artifact is already local; only syncing is left.
            survivors = Some(Vec::new());
            Checkpoint::Deduplicated
        } else {
            let document = self
                .inner
                .services
                .local
                .get_document(&request.source_document_id)
                .await?;
            match document {
                // Chunks are a pure function of the stored segments.
                Some(d) if d.extraction_status == ExtractionStatus::Extracted => Checkpoint::Normalized,
                _ => Checkpoint::None,
            }
        };

        let failed_with = request.failure().map(|r| r.to_string()).unwrap_or_default();
        let resumed = request
            .resume(fallback, self.inner.services.clock.now())
            .map_err(|e| PipelineError::InvalidState(e.to_string()))?;
        info!(
            request_id,
            previous_failure = %failed_with,
            resume_at = resumed.name(),
            attempt = request.retries,
            "retrying request"
        );
        self.inner.services.local.save_request(&request).await?;

        let mut run = Run::new(request, token);
        run.candidates = candidates.unwrap_or_default();
        run.survivors = survivors.unwrap_or_default();
        Ok(run)
    }

    async fn all_stored(&self, artifact_ids: &[String]) -> Result<bool, PipelineError> {
        for id in artifact_ids {
            if self.inner.services.local.get_artifact(id).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn drive(&self, mut run: Run) -> GenerationRequest {
        while !run.request.status.is_terminal() {
            if run.token.is_cancelled() {
                self.transition(
                    &mut run.request,
                    RequestStatus::Failed {
                        reason: FailureReason::Cancelled,
                    },
                )
                .await;
                break;
            }

            let step = match run.request.status {
                RequestStatus::Created => Ok(RequestStatus::Extracting),
                RequestStatus::Extracting => self.extracting(&mut run).await,
                RequestStatus::Normalizing => self.normalizing(&mut run).await,
                RequestStatus::Prompting => self.prompting(&mut run).await,
                RequestStatus::AwaitingAi => self.awaiting_ai(&mut run).await,
                RequestStatus::Parsing => self.parsing(&mut run),
                RequestStatus::Deduplicating => self.deduplicating(&mut run).await,
                RequestStatus::Persisting => self.persisting(&mut run).await,
                RequestStatus::Completed | RequestStatus::NoContent | RequestStatus::Failed { .. } => {
                    break
                }
            };
            let next = step.unwrap_or_else(|reason| RequestStatus::Failed { reason });
            self.transition(&mut run.request, next).await;
        }

        let request_id = run.request.request_id.clone();
        self.inner.running.remove(&request_id);
        if matches!(
            run.request.status,
            RequestStatus::Completed | RequestStatus::NoContent
        ) {
            self.inner.work.remove(&request_id);
        }
        run.request
    }

    async fn transition(&self, request: &mut GenerationRequest, next: RequestStatus) {
        let from = request.status.name();
        let now = self.inner.services.clock.now();
        if let Err(e) = request.advance(next, now) {
            error!(request_id = %request.request_id, error = %e, "illegal transition");
            let _ = request.fail(internal(&e.to_string()), now);
        }

        match &request.status {
            RequestStatus::Failed { reason } => {
                warn!(request_id = %request.request_id, from, reason = %reason, "request failed")
            }
            RequestStatus::Completed => info!(
                request_id = %request.request_id,
                artifacts = request.artifact_ids.len(),
                new = request.new_artifacts,
                "request completed"
            ),
            status => debug!(request_id = %request.request_id, from, to = status.name(), "transition"),
        }

        if let Err(e) = self.inner.services.local.save_request(request).await {
            warn!(request_id = %request.request_id, error = %e, "failed to save request snapshot");
        }
    }

    async fn extracting(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        if run.regenerating() {
            run.request.reach_checkpoint(Checkpoint::Extracted);
            return Ok(RequestStatus::Normalizing);
        }
        let local = &self.inner.services.local;
        let document_id = run.request.source_document_id.clone();

        let guard = self.inner.locks.acquire(&document_id).await;
        let document = local
            .get_document(&document_id)
            .await
            .map_err(persistence)?
            .ok_or_else(|| internal(&format!("document {} is not registered", document_id)))?;

        let segments = if document.extraction_status == ExtractionStatus::Extracted {
            debug!(document_id = %document_id, "reusing extracted segments");
            local.segments(&document_id).await.map_err(persistence)?
        } else {
            let payload = self.payload_for(&run.request.request_id, &document)?;
            match self.extract_with_retry(&document, &payload).await {
                Ok(segments) => {
                    local
                        .replace_segments(&document_id, &segments)
                        .await
                        .map_err(persistence)?;
                    local
                        .set_extraction_status(&document_id, ExtractionStatus::Extracted)
                        .await
                        .map_err(persistence)?;
                    info!(document_id = %document_id, segments = segments.len(), "extracted");
                    segments
                }
                Err(e) => {
                    if let Err(pe) = local
                        .set_extraction_status(&document_id, ExtractionStatus::Failed)
                        .await
                    {
                        warn!(document_id = %document_id, error = %pe, "failed to record extraction failure");
                    }
                    return Err(FailureReason::Extraction {
                        message: e.to_string(),
                    });
                }
            }
        };
        drop(guard);

        note_low_confidence(&mut run.request, &segments);
        run.request.reach_checkpoint(Checkpoint::Extracted);
        if segments.is_empty() {
            info!(document_id = %document_id, "document has no text");
            return Ok(RequestStatus::NoContent);
        }
        run.segments = segments;
        Ok(RequestStatus::Normalizing)
    }

    fn payload_for(
        &self,
        request_id: &str,
        document: &SourceDocument,
    ) -> Result<SourcePayload, FailureReason> {
        if let Some(payload) = self
            .inner
            .work
            .get(request_id)
            .and_then(|work| work.payload.clone())
        {
            return Ok(payload);
        }
        if matches!(document.kind, SourceKind::WebPage | SourceKind::YouTube)
            && (document.payload_ref.starts_with("http://")
                || document.payload_ref.starts_with("https://"))
        {
            return Ok(SourcePayload::Url(document.payload_ref.clone()));
        }
        Err(FailureReason::Extraction {
            message: "source payload is no longer available; submit the source again".to_string(),
        })
    }

    async fn extract_with_retry(
        &self,
        document: &SourceDocument,
        payload: &SourcePayload,
    ) -> Result<Vec<TextSegment>, ExtractionError> {
        let services = &self.inner.services;
        let settings = &self.inner.settings;
        let extractor = SourceExtractor::for_kind(
            document.kind,
            &settings.extraction,
            services.ocr.clone(),
            services.fetcher.clone(),
            services.transcripts.clone(),
        );

        let mut retry = RetryState::new(settings.retry);
        loop {
            let attempt = tokio::time::timeout(
                settings.extraction_timeout,
                extractor.extract(document, payload, settings.extraction.max_source_bytes),
            )
            .await;
            let err = match attempt {
                Ok(Ok(segments)) => return Ok(segments),
                Ok(Err(e)) if e.is_retryable() => e,
                Ok(Err(e)) => return Err(e),
                Err(_) => ExtractionError::ExternalServiceUnavailable(format!(
                    "extraction timed out after {:?}",
                    settings.extraction_timeout
                )),
            };
            match retry.decide(&ExternalServiceError::Unavailable(err.to_string())) {
                RetryDecision::Retry { delay, .. } => {
                    warn!(
                        document_id = %document.id,
                        error = %err,
                        attempt = retry.retries(),
                        delay_ms = delay.as_millis() as u64,
                        "extraction failed, backing off"
                    );
                    services.clock.sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }

    async fn normalizing(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        if run.regenerating() {
            run.request.reach_checkpoint(Checkpoint::Normalized);
            return Ok(RequestStatus::Prompting);
        }
        if run.segments.is_empty() {
            run.segments = self
                .inner
                .services
                .local
                .segments(&run.request.source_document_id)
                .await
                .map_err(persistence)?;
        }
        let chunks = TextNormalizer::new(self.inner.settings.max_chunk_tokens).normalize(&run.segments);
        if chunks.is_empty() {
            return Ok(RequestStatus::NoContent);
        }
        debug!(
            request_id = %run.request.request_id,
            segments = run.segments.len(),
            chunks = chunks.len(),
            "normalized"
        );
        run.request.chunk_ids = chunks.iter().map(|c| c.segment_id.clone()).collect();
        run.request.reach_checkpoint(Checkpoint::Normalized);
        run.chunks = chunks;
        run.next_chunk = 0;
        Ok(RequestStatus::Prompting)
    }

    async fn prompting(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        if run.regenerating() {
            return self.regeneration_prompt(run).await;
        }
        if run.chunks.is_empty() {
            let segments = self
                .inner
                .services
                .local
                .segments(&run.request.source_document_id)
                .await
                .map_err(persistence)?;
            run.chunks = TextNormalizer::new(self.inner.settings.max_chunk_tokens).normalize(&segments);
            run.next_chunk = 0;
            if run.chunks.is_empty() {
                return Err(internal("no stored text to build a prompt from"));
            }
        }

        let builder = PromptBuilder::new(self.inner.settings.token_budget);
        let request = &run.request;
        let prompt = match run.correction.take() {
            Some(validation_error) => builder.build_correction(
                &request.request_id,
                &run.batch,
                request.artifact_type,
                &request.options,
                &validation_error,
            ),
            None => {
                run.batch = run.chunks[run.next_chunk..].to_vec();
                builder.build(
                    &request.request_id,
                    &run.batch,
                    request.artifact_type,
                    &request.options,
                )
            }
        };
        // Included chunks are always a prefix; the rest go to the next batch.
        run.batch.truncate(prompt.included_chunk_ids.len());
        if prompt.truncated {
            debug!(
                request_id = %request.request_id,
                included = prompt.included_chunk_ids.len(),
                dropped = prompt.dropped_chunk_ids.len(),
                "prompt over budget, remaining chunks go to the next batch"
            );
        }
        run.prompt = Some(prompt);
        Ok(RequestStatus::AwaitingAi)
    }

    async fn regeneration_prompt(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        let local = &self.inner.services.local;
        let mut prior = Vec::with_capacity(run.request.regenerated_from.len());
        for id in &run.request.regenerated_from {
            let artifact = local
                .get_artifact(id)
                .await
                .map_err(persistence)?
                .ok_or_else(|| internal(&format!("quiz item {} is not stored locally", id)))?;
            prior.push(artifact);
        }

        // The topic of the quiz being re-mastered, when its request is known.
        let mut topic = None;
        for artifact in &prior {
            if let Some(request) = local.get_request(&artifact.request_id).await.map_err(persistence)? {
                if request.topic.is_some() {
                    topic = request.topic;
                    break;
                }
            }
        }

        run.prior_span = prior
            .iter()
            .map(|a| a.source_span)
            .reduce(|a, b| SegmentSpan {
                first: a.first.min(b.first),
                last: a.last.max(b.last),
            });
        run.batch.clear();
        run.chunks.clear();
        run.next_chunk = 0;

        let correction = run.correction.take();
        let prompt = PromptBuilder::new(self.inner.settings.token_budget).build_regeneration(
            &run.request.request_id,
            &prior,
            topic.as_deref(),
            &run.request.options,
            correction.as_deref(),
        );
        if prompt.truncated {
            warn!(
                request_id = %run.request.request_id,
                prior_items = prior.len(),
                "prior quiz does not fit the prompt budget; trailing items left out"
            );
        }
        run.prompt = Some(prompt);
        Ok(RequestStatus::AwaitingAi)
    }

    async fn awaiting_ai(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        let prompt = run
            .prompt
            .take()
            .ok_or_else(|| internal("no prompt to send"))?;

        let guard = self
            .inner
            .locks
            .acquire(&run.request.source_document_id)
            .await;
        let result = self.call_ai(&run.request.request_id, &prompt).await;
        drop(guard);

        match result {
            Ok(raw) => {
                run.response = Some(raw);
                Ok(RequestStatus::Parsing)
            }
            Err(e) => Err(FailureReason::ExternalService {
                message: e.to_string(),
            }),
        }
    }

    /// One logical AI call: transient failures and rate limits are retried
    /// on separate budgets, with every wait going through the clock.
    async fn call_ai(
        &self,
        request_id: &str,
        prompt: &AiPrompt,
    ) -> Result<String, ExternalServiceError> {
        let services = &self.inner.services;
        let settings = &self.inner.settings;
        let mut retry = RetryState::new(settings.retry);

        loop {
            let result = match tokio::time::timeout(
                settings.ai_timeout,
                services.ai.generate(prompt, &settings.model),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ExternalServiceError::Timeout(settings.ai_timeout)),
            };

            let err = match result {
                Ok(raw) => {
                    debug!(
                        request_id,
                        prompt_id = %prompt.prompt_id,
                        bytes = raw.len(),
                        retries = retry.retries(),
                        rate_limit_waits = retry.rate_limit_waits(),
                        "AI response received"
                    );
                    return Ok(raw);
                }
                Err(e) => e,
            };

            match retry.decide(&err) {
                RetryDecision::Retry {
                    delay,
                    kind: RetryKind::RateLimited,
                } => {
                    warn!(
                        request_id,
                        wait = retry.rate_limit_waits(),
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, waiting"
                    );
                    services.clock.sleep(delay).await;
                }
                RetryDecision::Retry {
                    delay,
                    kind: RetryKind::Transient,
                } => {
                    warn!(
                        request_id,
                        error = %err,
                        attempt = retry.retries(),
                        delay_ms = delay.as_millis() as u64,
                        "AI call failed, backing off"
                    );
                    services.clock.sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }

    fn parsing(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        let raw = run
            .response
            .take()
            .ok_or_else(|| internal("no AI response to parse"))?;
        let span = run.prior_span.unwrap_or(SegmentSpan {
            first: run.batch.first().map(|c| c.ordinal).unwrap_or(0),
            last: run.batch.last().map(|c| c.ordinal).unwrap_or(0),
        });
        let ctx = ParseContext {
            request_id: &run.request.request_id,
            source_document_id: &run.request.source_document_id,
            span,
            created_at: self.inner.services.clock.now(),
        };

        let parsed = match parse(&raw, run.request.artifact_type, &ctx) {
            Ok(parsed) => parsed,
            Err(ParseError::EmptyResult) => {
                info!(request_id = %run.request.request_id, "model returned no items for this batch");
                ParsedArtifacts {
                    artifacts: Vec::new(),
                    topic: None,
                }
            }
            Err(e) if run.parse_failures < self.inner.settings.parse_retries => {
                run.parse_failures += 1;
                warn!(
                    request_id = %run.request.request_id,
                    error = %e,
                    attempt = run.parse_failures,
                    "malformed AI response, sending correction prompt"
                );
                run.correction = Some(e.to_string());
                return Ok(RequestStatus::Prompting);
            }
            Err(e) => {
                return Err(FailureReason::MalformedResponse {
                    message: e.to_string(),
                })
            }
        };

        run.parse_failures = 0;
        if run.request.topic.is_none() {
            run.request.topic = parsed.topic;
        }
        run.candidates.extend(parsed.artifacts);
        run.next_chunk += run.batch.len();
        if run.next_chunk < run.chunks.len() {
            return Ok(RequestStatus::Prompting);
        }

        run.request.reach_checkpoint(Checkpoint::Parsed);
        self.inner
            .work
            .entry(run.request.request_id.clone())
            .or_default()
            .candidates = Some(run.candidates.clone());
        Ok(RequestStatus::Deduplicating)
    }

    async fn deduplicating(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        let existing: HashSet<String> = self
            .inner
            .services
            .local
            .artifact_ids(&run.request.source_document_id)
            .await
            .map_err(persistence)?
            .into_iter()
            .collect();

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let mut survivors = Vec::new();
        for artifact in &run.candidates {
            if !seen.insert(artifact.artifact_id.clone()) {
                continue;
            }
            resolved.push(artifact.artifact_id.clone());
            if !existing.contains(&artifact.artifact_id) {
                survivors.push(artifact.clone());
            }
        }
        info!(
            request_id = %run.request.request_id,
            candidates = run.candidates.len(),
            survivors = survivors.len(),
            "deduplicated"
        );

        run.request.artifact_ids = resolved;
        run.request.reach_checkpoint(Checkpoint::Deduplicated);
        self.inner
            .work
            .entry(run.request.request_id.clone())
            .or_default()
            .survivors = Some(survivors.clone());
        run.survivors = survivors;
        Ok(RequestStatus::Persisting)
    }

    async fn persisting(&self, run: &mut Run) -> Result<RequestStatus, FailureReason> {
        let now = self.inner.services.clock.now();
        let local = &self.inner.services.local;
        local
            .insert_artifacts(&run.survivors)
            .await
            .map_err(persistence)?;

        // Every resolved artifact is reconciled, not only the new ones: an
        // earlier attempt may have stored some locally without syncing them.
        let fresh: HashMap<&str, &StudyArtifact> = run
            .survivors
            .iter()
            .map(|a| (a.artifact_id.as_str(), a))
            .collect();
        let mut unsynced = 0;
        let mut owned = 0;
        for id in &run.request.artifact_ids {
            let stored;
            let artifact = match fresh.get(id.as_str()) {
                Some(artifact) => *artifact,
                None => {
                    stored = local
                        .get_artifact(id)
                        .await
                        .map_err(persistence)?
                        .ok_or_else(|| internal(&format!("artifact {} is not stored locally", id)))?;
                    &stored
                }
            };
            if artifact.request_id == run.request.request_id {
                owned += 1;
            }
            let record = self
                .inner
                .store
                .reconcile(artifact, now)
                .await
                .map_err(persistence)?;
            if record.local_state == SyncState::Unsynced {
                unsynced += 1;
            }
        }
        if unsynced > 0 {
            info!(
                request_id = %run.request.request_id,
                unsynced,
                "artifacts queued for remote sync"
            );
        }
        run.request.new_artifacts = owned;
        Ok(RequestStatus::Completed)
    }
}

fn already_finished(request: &GenerationRequest) -> PipelineError {
    PipelineError::InvalidState(format!(
        "request {} already {}",
        request.request_id,
        request.status.name()
    ))
}

/// Surface low-confidence OCR text as request warnings.
fn note_low_confidence(request: &mut GenerationRequest, segments: &[TextSegment]) {
    for segment in segments.iter().filter(|s| s.provenance.low_confidence) {
        let warning = format!(
            "low-confidence OCR text at {} (confidence {:.2})",
            segment.provenance.locator,
            segment.provenance.confidence.unwrap_or(0.0)
        );
        if !request.warnings.contains(&warning) {
            warn!(request_id = %request.request_id, "{}", warning);
            request.warnings.push(warning);
        }
    }
}
