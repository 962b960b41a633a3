//! YouTube sources, read through their caption transcripts.
//!
//! Transcripts come from a RapidAPI host (`GET /get_transcript?id=..`). Its
//! reply is either the captions (a bare array of snippets, or an object with
//! a `transcript` array) or a `languageMenu` listing caption tracks. On a
//! menu the English track is requested once, falling back to the first
//! track listed. Any other reply carries a `msg`/`message` explaining why the
//! video has no captions.
//!
//! Each caption snippet becomes one segment located by video id and snippet
//! index. The transcript is cut at `max_transcript_chars`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use study_harness_core::error::ExtractionError;
use study_harness_core::identity::youtube_video_id;
use study_harness_core::models::{Locator, Provenance, TextSegment};
use study_harness_core::services::TranscriptApi;

use crate::config::YouTubeConfig;

pub fn create_transcript_api(config: &YouTubeConfig) -> Result<Arc<dyn TranscriptApi>> {
    match config.api_host.as_deref() {
        None => Ok(Arc::new(DisabledTranscripts)),
        Some(host) => {
            let key = std::env::var(&config.api_key_env).ok();
            if key.is_none() {
                warn!(env = %config.api_key_env, "no transcript API key set; video sources will fail");
            }
            Ok(Arc::new(RapidApiTranscripts::new(host, key)?))
        }
    }
}

pub struct TranscriptExtractor {
    api: Arc<dyn TranscriptApi>,
    max_chars: usize,
    timeout: Duration,
}

enum Reply {
    Snippets(Vec<String>),
    /// Caption track to ask for instead.
    Menu(String),
    Message(String),
}

impl TranscriptExtractor {
    pub fn new(api: Arc<dyn TranscriptApi>, max_chars: usize, timeout: Duration) -> Self {
        Self {
            api,
            max_chars,
            timeout,
        }
    }

    pub async fn extract(&self, document_id: &str, url: &str) -> Result<Vec<TextSegment>, ExtractionError> {
        let video_id = youtube_video_id(url)
            .ok_or_else(|| ExtractionError::UnsupportedFormat(format!("not a YouTube video URL: {}", url)))?;

        let mut track: Option<String> = None;
        loop {
            let body = self.api.transcript(&video_id, track.as_deref(), self.timeout).await?;
            match parse_reply(&body)? {
                Reply::Snippets(snippets) => return Ok(self.segments(document_id, &video_id, snippets)),
                Reply::Menu(params) if track.is_none() => {
                    debug!(video_id = %video_id, "requesting caption track from language menu");
                    track = Some(params);
                }
                Reply::Menu(_) => {
                    return Err(ExtractionError::NotAvailable(format!(
                        "no caption track could be selected for video {}",
                        video_id
                    )))
                }
                Reply::Message(message) => return Err(ExtractionError::NotAvailable(message)),
            }
        }
    }

    fn segments(&self, document_id: &str, video_id: &str, snippets: Vec<String>) -> Vec<TextSegment> {
        let mut remaining = self.max_chars;
        let mut segments = Vec::new();
        for (index, text) in snippets.into_iter().enumerate() {
            if remaining == 0 {
                warn!(video_id, limit = self.max_chars, "transcript truncated");
                break;
            }
            let len = text.chars().count();
            let text = if len > remaining {
                text.chars().take(remaining).collect()
            } else {
                text
            };
            remaining = remaining.saturating_sub(len + 1);

            let index = index as u32;
            let locator = Locator::Transcript {
                video_id: video_id.to_string(),
                first: index,
                last: index,
            };
            segments.push(TextSegment::new(
                document_id,
                segments.len() as u32,
                Provenance::new(locator),
                text,
            ));
        }
        debug!(document_id, video_id, snippets = segments.len(), "read transcript");
        segments
    }
}

fn parse_reply(body: &str) -> Result<Reply, ExtractionError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ExtractionError::CorruptSource(format!("transcript reply is not JSON: {}", e)))?;

    if let Some(items) = value.as_array() {
        return Ok(Reply::Snippets(snippet_texts(items)));
    }
    if let Some(items) = value.get("transcript").and_then(Value::as_array) {
        return Ok(Reply::Snippets(snippet_texts(items)));
    }
    if let Some(menu) = value.get("languageMenu").and_then(Value::as_array) {
        let params = |item: &Value| {
            item.get("params")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
        };
        let english = menu.iter().find(|item| {
            item.get("title")
                .and_then(Value::as_str)
                .is_some_and(|title| title.contains("English"))
        });
        if let Some(track) = english.and_then(params).or_else(|| menu.first().and_then(params)) {
            return Ok(Reply::Menu(track));
        }
    }

    let message = ["msg", "message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("no speech text found in this video");
    Ok(Reply::Message(message.to_string()))
}

fn snippet_texts(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get("text").or_else(|| item.get("snippet")).and_then(Value::as_str))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
        .collect()
}

/// [`TranscriptApi`] over a RapidAPI transcript host.
pub struct RapidApiTranscripts {
    client: reqwest::Client,
    host: String,
    key: Option<String>,
}

impl RapidApiTranscripts {
    pub fn new(host: &str, key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            key,
        })
    }
}

#[async_trait]
impl TranscriptApi for RapidApiTranscripts {
    async fn transcript(
        &self,
        video_id: &str,
        track: Option<&str>,
        timeout: Duration,
    ) -> Result<String, ExtractionError> {
        let key = self
            .key
            .as_deref()
            .ok_or_else(|| ExtractionError::NotAvailable("no transcript API key configured".into()))?;

        let mut query = vec![("id", video_id)];
        if let Some(track) = track {
            query.push(("params", track));
        }
        let response = self
            .client
            .get(format!("https://{}/get_transcript", self.host))
            .query(&query)
            .header("x-rapidapi-key", key)
            .header("x-rapidapi-host", &self.host)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                ExtractionError::ExternalServiceUnavailable(format!("transcript for {}: {}", video_id, e))
            })?;

        let status = response.status();
        if status.is_server_error() || matches!(status.as_u16(), 403 | 429) {
            return Err(ExtractionError::ExternalServiceUnavailable(format!(
                "transcript service returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(ExtractionError::NotAvailable(format!(
                "captions unavailable for video {} (HTTP {})",
                video_id, status
            )));
        }
        response.text().await.map_err(|e| {
            ExtractionError::ExternalServiceUnavailable(format!("reading transcript for {}: {}", video_id, e))
        })
    }
}

/// Used when no transcript host is configured.
pub struct DisabledTranscripts;

#[async_trait]
impl TranscriptApi for DisabledTranscripts {
    async fn transcript(
        &self,
        _video_id: &str,
        _track: Option<&str>,
        _timeout: Duration,
    ) -> Result<String, ExtractionError> {
        Err(ExtractionError::NotAvailable(
            "no transcript service configured; set [youtube] api_host".into(),
        ))
    }
}
