//! OCR engine clients.
//!
//! The `http` provider posts the image as base64 JSON to a configured
//! endpoint and expects an [`OcrOutput`] back:
//!
//! ```json
//! {"text": "...", "confidence": 0.93, "regions": [{"text": "...", "confidence": 0.9}]}
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;

use study_harness_core::error::ExternalServiceError;
use study_harness_core::services::{OcrEngine, OcrImage, OcrOutput};

use crate::ai::parse_retry_after;
use crate::config::OcrConfig;

pub fn create_ocr_engine(config: &OcrConfig) -> Result<Arc<dyn OcrEngine>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledOcr)),
        "http" => {
            let endpoint = config
                .endpoint
                .clone()
                .context("ocr.endpoint must be set for the http provider")?;
            let token = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            Ok(Arc::new(HttpOcrEngine::new(
                endpoint,
                token,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        other => anyhow::bail!("Unknown OCR provider: '{}'", other),
    }
}

pub struct HttpOcrEngine {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpOcrEngine {
    pub fn new(endpoint: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            token,
            timeout,
        })
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn recognize(&self, image: &OcrImage) -> Result<OcrOutput, ExternalServiceError> {
        let body = serde_json::json!({
            "mime": image.mime,
            "image": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExternalServiceError::Timeout(self.timeout)
            } else {
                ExternalServiceError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, chrono::Utc::now()));
            return Err(ExternalServiceError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ExternalServiceError::Unavailable(format!("OCR endpoint returned {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExternalServiceError::Rejected(format!("OCR endpoint returned {}: {}", status, text)));
        }

        let mut output: OcrOutput = response
            .json()
            .await
            .map_err(|e| ExternalServiceError::Rejected(format!("invalid OCR response: {}", e)))?;
        output.confidence = output.confidence.clamp(0.0, 1.0);
        for region in &mut output.regions {
            region.confidence = region.confidence.clamp(0.0, 1.0);
        }
        Ok(output)
    }
}

/// Used when no OCR engine is configured. Scanned content cannot be read.
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    async fn recognize(&self, _image: &OcrImage) -> Result<OcrOutput, ExternalServiceError> {
        Err(ExternalServiceError::Unavailable(
            "no OCR engine configured; set [ocr] provider = \"http\"".into(),
        ))
    }
}
