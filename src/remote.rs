//! HTTP remote artifact store.
//!
//! Endpoints, relative to `remote.base_url`:
//!
//! - `PUT /artifacts/{id}` with `If-None-Match: *` creates the artifact
//!   unless it exists. `201`/`200` → created, `412` → already present,
//!   `409` → a different record holds the id.
//! - `GET /documents/{id}/artifacts` lists a document's artifacts.
//!
//! Responses to writes carry `{"version": n}`; a missing version reads as 0.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use study_harness_core::error::PersistenceError;
use study_harness_core::models::StudyArtifact;
use study_harness_core::store::{RemoteStore, UpsertOutcome};

use crate::config::RemoteConfig;

pub fn create_remote_store(config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledRemote)),
        "http" => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("remote.base_url must be set for the http provider"))?;
            let token = config
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            Ok(Arc::new(HttpRemoteStore::new(
                &base_url,
                token,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        other => anyhow::bail!("Unknown remote provider: '{}'", other),
    }
}

#[derive(Deserialize, Default)]
struct VersionBody {
    #[serde(default)]
    version: u64,
}

pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn offline(e: reqwest::Error) -> PersistenceError {
    PersistenceError::Unavailable(e.to_string())
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert_if_absent(
        &self,
        artifact: &StudyArtifact,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let url = format!("{}/artifacts/{}", self.base_url, artifact.artifact_id);
        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .json(artifact)
            .send()
            .await
            .map_err(offline)?;

        let status = response.status();
        match status.as_u16() {
            200 | 201 => {
                let body: VersionBody = response.json().await.unwrap_or_default();
                Ok(UpsertOutcome::Created {
                    version: body.version,
                })
            }
            412 => {
                let body: VersionBody = response.json().await.unwrap_or_default();
                Ok(UpsertOutcome::AlreadyExists {
                    version: body.version,
                })
            }
            409 => Err(PersistenceError::Conflict(artifact.artifact_id.clone())),
            s if status.is_server_error() || s == 429 => Err(PersistenceError::Unavailable(
                format!("remote store returned {}", status),
            )),
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(PersistenceError::Write(format!(
                    "remote store returned {}: {}",
                    status, text
                )))
            }
        }
    }

    async fn fetch_by_document(
        &self,
        source_document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PersistenceError> {
        let url = format!("{}/documents/{}/artifacts", self.base_url, source_document_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(offline)?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if status.is_server_error() {
            return Err(PersistenceError::Unavailable(format!(
                "remote store returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(PersistenceError::Write(format!(
                "remote store returned {}",
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| PersistenceError::Write(format!("invalid remote response: {}", e)))
    }
}

/// Used when `remote.provider = "disabled"`. Behaves as permanently offline,
/// so every artifact stays `Unsynced` in the local queue.
pub struct DisabledRemote;

#[async_trait]
impl RemoteStore for DisabledRemote {
    async fn upsert_if_absent(
        &self,
        _artifact: &StudyArtifact,
    ) -> Result<UpsertOutcome, PersistenceError> {
        Err(PersistenceError::Unavailable("remote sync disabled".into()))
    }

    async fn fetch_by_document(
        &self,
        _source_document_id: &str,
    ) -> Result<Vec<StudyArtifact>, PersistenceError> {
        Err(PersistenceError::Unavailable("remote sync disabled".into()))
    }
}
