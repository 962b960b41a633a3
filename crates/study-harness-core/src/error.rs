//! Error taxonomy shared by every pipeline stage.
//!
//! Each external boundary has its own enum so the orchestrator can decide
//! locally whether a failure is retryable. Anything that is not retried ends
//! up as a [`FailureReason`](crate::models::FailureReason) on the request.

use std::time::Duration;

use thiserror::Error;

/// Failure while turning a raw source into text segments.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupt source: {0}")]
    CorruptSource(String),
    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),
    #[error("source is too large ({size} bytes, limit {limit})")]
    TooLarge { size: usize, limit: usize },
    /// The source exists but offers nothing to extract, e.g. a video
    /// without captions.
    #[error("content not available: {0}")]
    NotAvailable(String),
}

impl ExtractionError {
    /// Only engine/fetch outages are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractionError::ExternalServiceUnavailable(_))
    }
}

/// Failure while decoding an AI response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("response is not well-formed JSON: {0}")]
    NotWellFormed(String),
    #[error("response does not match the schema: {0}")]
    SchemaMismatch(String),
    #[error("response contains no items")]
    EmptyResult,
}

impl ParseError {
    /// Empty results are legitimate and never trigger a correction prompt.
    pub fn counts_as_malformed(&self) -> bool {
        !matches!(self, ParseError::EmptyResult)
    }
}

/// Failure reported by an external service (AI model, OCR engine, fetcher).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalServiceError {
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request rejected: {0}")]
    Rejected(String),
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {:.1}s", d.as_secs_f64()),
        None => String::new(),
    }
}

impl ExternalServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExternalServiceError::Unavailable(_) | ExternalServiceError::Timeout(_)
        )
    }
}

/// Failure writing to local or remote persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("remote store unreachable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("conflicting record for {0}")]
    Conflict(String),
}

impl PersistenceError {
    /// Connectivity loss is not a failure for reconciliation: the write is queued.
    pub fn is_offline(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_))
    }
}

/// Raised when a request is asked to move to a state it cannot reach.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}
