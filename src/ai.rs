//! AI model clients.
//!
//! Two providers are supported:
//!
//! - **`gemini`**: `POST {base}/v1beta/models/{model}:generateContent`,
//!   key from `GEMINI_API_KEY`.
//! - **`openai`**: `POST {base}/v1/chat/completions`, key from
//!   `OPENAI_API_KEY`.
//!
//! Each call is a single attempt. Retry, backoff and rate-limit waits belong
//! to the orchestrator; this module only classifies failures:
//!
//! | Response | Error |
//! |----------|-------|
//! | HTTP 429 | `RateLimited` with `Retry-After`, if sent |
//! | HTTP 5xx, network error | `Unavailable` |
//! | client timeout | `Timeout` |
//! | other HTTP 4xx, missing key | `Rejected` |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use study_harness_core::error::ExternalServiceError;
use study_harness_core::models::AiPrompt;
use study_harness_core::services::{AiService, ModelConfig};

use crate::config::AiConfig;

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";
const OPENAI_BASE: &str = "https://api.openai.com";

/// Build the AI service selected by `config.provider`.
pub fn create_ai_service(config: &AiConfig) -> Result<Arc<dyn AiService>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiService::new(
            config.base_url.as_deref().unwrap_or(GEMINI_BASE),
            timeout,
        )?)),
        "openai" => Ok(Arc::new(OpenAiService::new(
            config.base_url.as_deref().unwrap_or(OPENAI_BASE),
            timeout,
        )?)),
        "disabled" => Ok(Arc::new(DisabledAiService)),
        other => anyhow::bail!("Unknown AI provider: '{}'", other),
    }
}

/// Parse a `Retry-After` header value: delay seconds or an HTTP-date.
/// A date in the past means no wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

fn client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn api_key(var: &str) -> Result<String, ExternalServiceError> {
    std::env::var(var).map_err(|_| ExternalServiceError::Rejected(format!("{} not set", var)))
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ExternalServiceError {
    if e.is_timeout() {
        ExternalServiceError::Timeout(timeout)
    } else {
        ExternalServiceError::Unavailable(e.to_string())
    }
}

/// Send `request` and return the JSON body of a successful response.
async fn send_json(
    request: reqwest::RequestBuilder,
    provider: &str,
    timeout: Duration,
) -> Result<Value, ExternalServiceError> {
    let response = request.send().await.map_err(|e| transport_error(e, timeout))?;
    let status = response.status();

    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|e| transport_error(e, timeout));
    }

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        return Err(ExternalServiceError::RateLimited { retry_after });
    }

    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", provider, status, truncate(&body_text, 300));
    if status.is_server_error() {
        Err(ExternalServiceError::Unavailable(message))
    } else {
        Err(ExternalServiceError::Rejected(message))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub struct GeminiService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl AiService for GeminiService {
    async fn generate(
        &self,
        prompt: &AiPrompt,
        config: &ModelConfig,
    ) -> Result<String, ExternalServiceError> {
        let key = api_key("GEMINI_API_KEY")?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, config.model
        );
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt.rendered_text }] }],
            "generationConfig": {
                "temperature": config.temperature,
                "maxOutputTokens": config.max_output_tokens,
                "responseMimeType": "application/json",
            },
        });

        let json = send_json(
            self.client
                .post(&url)
                .header("x-goog-api-key", key)
                .json(&body),
            "Gemini",
            self.timeout,
        )
        .await?;
        gemini_text(&json)
    }
}

/// Concatenated text parts of the first candidate.
fn gemini_text(json: &Value) -> Result<String, ExternalServiceError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let reason = json
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            ExternalServiceError::Rejected(format!("Gemini returned no content: {}", reason))
        })?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

pub struct OpenAiService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OpenAiService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl AiService for OpenAiService {
    async fn generate(
        &self,
        prompt: &AiPrompt,
        config: &ModelConfig,
    ) -> Result<String, ExternalServiceError> {
        let key = api_key("OPENAI_API_KEY")?;
        let body = json!({
            "model": config.model,
            "messages": [{ "role": "user", "content": prompt.rendered_text }],
            "temperature": config.temperature,
            "max_tokens": config.max_output_tokens,
            "response_format": { "type": "json_object" },
        });

        let json = send_json(
            self.client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", key))
                .json(&body),
            "OpenAI",
            self.timeout,
        )
        .await?;

        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ExternalServiceError::Rejected("OpenAI response missing message content".into())
            })
    }
}

/// Used when `ai.provider = "disabled"`; every call is rejected.
pub struct DisabledAiService;

#[async_trait]
impl AiService for DisabledAiService {
    async fn generate(
        &self,
        _prompt: &AiPrompt,
        _config: &ModelConfig,
    ) -> Result<String, ExternalServiceError> {
        Err(ExternalServiceError::Rejected(
            "AI provider is disabled; set [ai] provider in the config".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds_and_dates() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:27:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_retry_after("30", now), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 7 ", now), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn gemini_parts_are_joined() {
        let json = json!({
            "candidates": [{ "content": { "parts": [{ "text": "{\"flash" }, { "text": "cards\":[]}" }] } }]
        });
        assert_eq!(gemini_text(&json).unwrap(), "{\"flashcards\":[]}");
    }

    #[test]
    fn gemini_block_is_rejected() {
        let json = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = gemini_text(&json).unwrap_err();
        assert!(matches!(err, ExternalServiceError::Rejected(m) if m.contains("SAFETY")));
    }

    #[tokio::test]
    async fn disabled_provider_rejects() {
        let service = create_ai_service(&AiConfig {
            provider: "disabled".into(),
            ..AiConfig::default()
        })
        .unwrap();
        let prompt = AiPrompt {
            prompt_id: "p".into(),
            request_id: "r".into(),
            rendered_text: "x".into(),
            token_budget: 10,
            included_chunk_ids: vec![],
            dropped_chunk_ids: vec![],
            truncated: false,
            correction: false,
        };
        let err = service.generate(&prompt, &ModelConfig::default()).await.unwrap_err();
        assert!(matches!(err, ExternalServiceError::Rejected(_)));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
