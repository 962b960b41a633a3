//! Generation request lifecycle.
//!
//! ```text
//! Created → Extracting → Normalizing → Prompting → AwaitingAi → Parsing
//!                                          ↑                       │
//!                                          └── next batch / fix ───┤
//!                                                                  ↓
//!                                   Completed ← Persisting ← Deduplicating
//! ```
//!
//! Any non-terminal state may fail. `NoContent` is reachable only while the
//! document's text is being produced. Terminal states are final except for
//! [`GenerationRequest::resume`], which restarts a failed request at the
//! stage after its last checkpoint.

use chrono::{DateTime, Utc};

use crate::error::TransitionError;
use crate::models::{
    ArtifactType, Checkpoint, FailureReason, GenerationOptions, GenerationRequest, RequestStatus,
};

fn rank(status: &RequestStatus) -> u8 {
    match status {
        RequestStatus::Created => 0,
        RequestStatus::Extracting => 1,
        RequestStatus::Normalizing => 2,
        RequestStatus::Prompting => 3,
        RequestStatus::AwaitingAi => 4,
        RequestStatus::Parsing => 5,
        RequestStatus::Deduplicating => 6,
        RequestStatus::Persisting => 7,
        RequestStatus::Completed => 8,
        RequestStatus::NoContent | RequestStatus::Failed { .. } => u8::MAX,
    }
}

/// Whether `from → to` is a legal forward transition.
pub fn can_transition(from: &RequestStatus, to: &RequestStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    match to {
        RequestStatus::Failed { .. } => true,
        RequestStatus::NoContent => matches!(
            from,
            RequestStatus::Extracting | RequestStatus::Normalizing
        ),
        RequestStatus::Prompting if *from == RequestStatus::Parsing => true,
        _ => rank(to) == rank(from) + 1,
    }
}

/// State a failed request restarts in, given its checkpoint.
pub fn resume_state(checkpoint: Checkpoint) -> RequestStatus {
    match checkpoint {
        Checkpoint::None => RequestStatus::Extracting,
        Checkpoint::Extracted => RequestStatus::Normalizing,
        Checkpoint::Normalized => RequestStatus::Prompting,
        Checkpoint::Parsed => RequestStatus::Deduplicating,
        Checkpoint::Deduplicated => RequestStatus::Persisting,
    }
}

impl GenerationRequest {
    pub fn new(
        request_id: String,
        source_document_id: String,
        artifact_type: ArtifactType,
        options: GenerationOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            source_document_id,
            artifact_type,
            options,
            chunk_ids: Vec::new(),
            status: RequestStatus::Created,
            checkpoint: Checkpoint::None,
            warnings: Vec::new(),
            artifact_ids: Vec::new(),
            new_artifacts: 0,
            topic: None,
            retries: 0,
            regenerated_from: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, rejecting anything the lifecycle does not allow.
    pub fn advance(&mut self, to: RequestStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !can_transition(&self.status, &to) {
            return Err(TransitionError {
                from: self.status.name().to_string(),
                to: to.name().to_string(),
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.advance(RequestStatus::Failed { reason }, now)
    }

    /// Record that a stage's output is now retained. Checkpoints never move back.
    pub fn reach_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = self.checkpoint.max(checkpoint);
    }

    /// Restart a failed request at the stage after its checkpoint, or at
    /// `fallback` if that is earlier (when retained work was lost).
    pub fn resume(
        &mut self,
        fallback: Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<RequestStatus, TransitionError> {
        if !matches!(self.status, RequestStatus::Failed { .. }) {
            return Err(TransitionError {
                from: self.status.name().to_string(),
                to: "retry".to_string(),
            });
        }
        self.checkpoint = self.checkpoint.min(fallback);
        let next = resume_state(self.checkpoint);
        self.status = next.clone();
        self.retries += 1;
        self.updated_at = now;
        Ok(next)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            RequestStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}
