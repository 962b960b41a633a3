//! Collaborator traits for the external services the pipeline depends on.
//!
//! The core never talks to a network itself. The native crate supplies HTTP
//! implementations; tests supply scripted fakes.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExternalServiceError, ExtractionError};
use crate::models::AiPrompt;

/// An image handed to the OCR engine.
#[derive(Debug, Clone)]
pub struct OcrImage {
    pub bytes: Vec<u8>,
    /// MIME type, e.g. `image/png`, `image/jpeg`.
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrRegion {
    pub text: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels, when the engine reports it.
    #[serde(default)]
    pub bounds: Option<[u32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    /// Aggregate confidence for the whole image in `[0, 1]`.
    pub confidence: f32,
    #[serde(default)]
    pub regions: Vec<OcrRegion>,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &OcrImage) -> Result<OcrOutput, ExternalServiceError>;
}

/// Model selection and sampling parameters for one AI call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.2,
            max_output_tokens: 4096,
        }
    }
}

#[async_trait]
pub trait AiService: Send + Sync {
    /// Send the prompt and return the model's raw text response.
    async fn generate(
        &self,
        prompt: &AiPrompt,
        config: &ModelConfig,
    ) -> Result<String, ExternalServiceError>;
}

/// Caption transcripts of online videos.
#[async_trait]
pub trait TranscriptApi: Send + Sync {
    /// Raw JSON reply for `video_id`. `track` selects a caption track
    /// offered by an earlier reply's language menu.
    async fn transcript(
        &self,
        video_id: &str,
        track: Option<&str>,
        timeout: Duration,
    ) -> Result<String, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    /// Fetch `url`, following a bounded number of redirects and refusing
    /// bodies over the configured size limit.
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedPage, ExtractionError>;
}

/// Source of time for timestamps and backoff sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// A clock that never blocks: sleeps are recorded and advance a virtual now.
pub struct RecordingClock {
    state: Mutex<(DateTime<Utc>, Vec<Duration>)>,
}

impl RecordingClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((start, Vec::new())),
        }
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        match self.state.lock() {
            Ok(guard) => guard.1.clone(),
            Err(poisoned) => poisoned.into_inner().1.clone(),
        }
    }
}

impl Default for RecordingClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for RecordingClock {
    fn now(&self) -> DateTime<Utc> {
        match self.state.lock() {
            Ok(guard) => guard.0,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    async fn sleep(&self, duration: Duration) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.0 += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        guard.1.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_clock_advances_without_waiting() {
        let start = DateTime::from_timestamp(0, 0).unwrap();
        let clock = RecordingClock::new(start);
        clock.sleep(Duration::from_secs(30)).await;
        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(30), Duration::from_secs(2)]
        );
        assert_eq!((clock.now() - start).num_seconds(), 32);
    }
}
