//! TOML configuration for the `sth` binary and HTTP server.
//!
//! Every section is optional; omitted keys take the defaults documented on
//! each `default_*` function. [`load_config`] validates cross-field
//! constraints and bails with a readable message on the first violation.
//!
//! ```toml
//! [db]
//! path = "./data/study.sqlite"
//!
//! [chunking]
//! max_tokens = 700
//!
//! [ai]
//! provider = "gemini"
//! model = "gemini-2.0-flash"
//!
//! [remote]
//! provider = "http"
//! base_url = "https://sync.example.org"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use study_harness_core::retry::RetryPolicy;
use study_harness_core::services::ModelConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub youtube: YouTubeConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/study.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Uploads larger than this are refused.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    #[serde(default = "default_max_pdf_pages")]
    pub max_pdf_pages: usize,
    /// Upper bound on one extraction attempt, OCR included.
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: default_max_source_bytes(),
            max_pdf_pages: default_max_pdf_pages(),
            timeout_secs: default_extraction_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_redirects: default_max_redirects(),
            max_page_bytes: default_max_page_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_max_source_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_pdf_pages() -> usize {
    30
}
fn default_extraction_timeout_secs() -> u64 {
    120
}
fn default_fetch_timeout_secs() -> u64 {
    20
}
fn default_max_redirects() -> usize {
    5
}
fn default_max_page_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_user_agent() -> String {
    format!("study-harness/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// `disabled` or `http`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding a bearer token for the endpoint.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            endpoint: None,
            api_key_env: None,
            confidence_threshold: default_confidence_threshold(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_confidence_threshold() -> f32 {
    0.6
}
fn default_ocr_timeout_secs() -> u64 {
    30
}

/// Caption transcripts for YouTube sources, served by a RapidAPI host.
#[derive(Debug, Deserialize, Clone)]
pub struct YouTubeConfig {
    /// RapidAPI host serving `/get_transcript`; unset disables video sources.
    #[serde(default)]
    pub api_host: Option<String>,
    #[serde(default = "default_youtube_key_env")]
    pub api_key_env: String,
    /// Transcripts are cut at this many characters.
    #[serde(default = "default_max_transcript_chars")]
    pub max_transcript_chars: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        Self {
            api_host: None,
            api_key_env: default_youtube_key_env(),
            max_transcript_chars: default_max_transcript_chars(),
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_youtube_key_env() -> String {
    "RAPID_API_KEY".to_string()
}
fn default_max_transcript_chars() -> usize {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    /// `gemini`, `openai`, or `disabled`.
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default = "default_ai_model")]
    pub model: String,
    /// Override the provider's API base URL (proxies, tests).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Prompt size limit, header and chunks included.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_rate_limit_waits: u32,
    #[serde(default = "default_parse_retries")]
    pub parse_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_ai_provider(),
            model: default_ai_model(),
            base_url: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            token_budget: default_token_budget(),
            timeout_secs: default_ai_timeout_secs(),
            max_retries: default_max_retries(),
            max_rate_limit_waits: default_max_rate_limit_waits(),
            parse_retries: default_parse_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

fn default_ai_provider() -> String {
    "gemini".to_string()
}
fn default_ai_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_token_budget() -> usize {
    6000
}
fn default_ai_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_rate_limit_waits() -> u32 {
    5
}
fn default_parse_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_secs() -> u64 {
    32
}

impl AiConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_rate_limit_waits: self.max_rate_limit_waits,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// `disabled` or `http`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    /// Interval of the background queue drain in `sth serve`.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: None,
            api_key_env: None,
            timeout_secs: default_remote_timeout_secs(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

fn default_remote_timeout_secs() -> u64 {
    15
}
fn default_sync_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.ai.token_budget <= config.chunking.max_tokens {
        anyhow::bail!(
            "ai.token_budget ({}) must be larger than chunking.max_tokens ({})",
            config.ai.token_budget,
            config.chunking.max_tokens
        );
    }

    // Extraction
    if config.extraction.max_source_bytes == 0 {
        anyhow::bail!("extraction.max_source_bytes must be > 0");
    }
    if config.extraction.max_pdf_pages == 0 {
        anyhow::bail!("extraction.max_pdf_pages must be >= 1");
    }

    // OCR
    if !(0.0..=1.0).contains(&config.ocr.confidence_threshold) {
        anyhow::bail!("ocr.confidence_threshold must be in [0.0, 1.0]");
    }
    if config.youtube.max_transcript_chars == 0 {
        anyhow::bail!("youtube.max_transcript_chars must be > 0");
    }

    match config.ocr.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.ocr.endpoint.is_none() {
                anyhow::bail!("ocr.endpoint must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown OCR provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    // AI
    match config.ai.provider.as_str() {
        "disabled" | "gemini" | "openai" => {}
        other => anyhow::bail!(
            "Unknown AI provider: '{}'. Must be gemini, openai, or disabled.",
            other
        ),
    }
    if config.ai.backoff_base_ms == 0 {
        anyhow::bail!("ai.backoff_base_ms must be > 0");
    }
    if Duration::from_secs(config.ai.backoff_max_secs)
        < Duration::from_millis(config.ai.backoff_base_ms)
    {
        anyhow::bail!("ai.backoff_max_secs must not be below ai.backoff_base_ms");
    }

    // Remote
    match config.remote.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.remote.base_url.is_none() {
                anyhow::bail!("remote.base_url must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown remote provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    if config.remote.sync_interval_secs == 0 {
        anyhow::bail!("remote.sync_interval_secs must be > 0");
    }

    // Logging
    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}
