//! `sth generate`, `sth regenerate`, `sth status` and `sth artifacts`.
//!
//! Each command opens the configured SQLite store, builds an
//! [`Orchestrator`] around it and prints a human-readable summary (or JSON
//! with `--json`).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use study_harness_core::models::{
    ArtifactBody, ArtifactType, GenerationOptions, GenerationRequest, RequestStatus, SourceKind,
    StudyArtifact,
};

use crate::config::Config;
use crate::db;
use crate::intake;
use crate::migrate;
use crate::orchestrator::{Orchestrator, PipelineSettings, Services};
use crate::sqlite_store::SqliteLocalStore;

/// Open the database (migrating it if needed) and build the orchestrator.
pub async fn open_orchestrator(config: &Config) -> Result<Orchestrator> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    let local = Arc::new(SqliteLocalStore::new(pool));
    let services = Services::from_config(config, local)?;
    Ok(Orchestrator::new(services, PipelineSettings::from_config(config)))
}

pub async fn run_generate(
    config: &Config,
    source: &str,
    artifact_type: ArtifactType,
    options: GenerationOptions,
    kind: Option<SourceKind>,
    json: bool,
) -> Result<()> {
    let (document, payload) = if intake::looks_like_url(source) {
        intake::from_url(source)?
    } else {
        let path = Path::new(source);
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", source))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.to_string());
        intake::from_upload(&name, bytes, kind)?
    };
    let orchestrator = open_orchestrator(config).await?;
    let request = orchestrator
        .generate(document, payload, artifact_type, options)
        .await?;
    report(&orchestrator, &request, json).await
}

/// Re-master a document's existing quiz into a new one.
pub async fn run_regenerate(
    config: &Config,
    document_id: &str,
    options: GenerationOptions,
    json: bool,
) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let request = orchestrator.regenerate_quiz(document_id, options).await?;
    report(&orchestrator, &request, json).await
}

async fn report(orchestrator: &Orchestrator, request: &GenerationRequest, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    print_request(request);
    if request.status == RequestStatus::Completed {
        let artifacts = orchestrator.list_artifacts(&request.source_document_id).await?;
        let mine: Vec<&StudyArtifact> = artifacts
            .iter()
            .filter(|a| request.artifact_ids.contains(&a.artifact_id))
            .collect();
        println!();
        for artifact in mine {
            print_artifact(artifact);
        }
    }
    if let Some(reason) = request.failure() {
        anyhow::bail!("request {} failed: {}", request.request_id, reason);
    }
    Ok(())
}

pub async fn run_status(config: &Config, id: Option<&str>, limit: usize, json: bool) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    match id {
        Some(id) => {
            let request = orchestrator.request_status(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&request)?);
            } else {
                print_request(&request);
            }
        }
        None => {
            let requests = orchestrator.list_requests(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&requests)?);
                return Ok(());
            }
            if requests.is_empty() {
                println!("No requests yet.");
            }
            for r in &requests {
                println!(
                    "{}  {:<10} {:<14} {}  {} artifact(s)",
                    r.request_id,
                    r.artifact_type.as_str(),
                    r.status.name(),
                    r.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    r.artifact_ids.len()
                );
            }
        }
    }
    Ok(())
}

pub async fn run_artifacts(config: &Config, document_id: &str, json: bool) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let artifacts = orchestrator.list_artifacts(document_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&artifacts)?);
        return Ok(());
    }
    if artifacts.is_empty() {
        println!("No artifacts for {}.", document_id);
    }
    for artifact in &artifacts {
        print_artifact(artifact);
    }
    Ok(())
}

fn print_request(request: &GenerationRequest) {
    println!("--- Request ---");
    println!("id:           {}", request.request_id);
    println!("document:     {}", request.source_document_id);
    println!("type:         {}", request.artifact_type);
    println!("status:       {}", request.status);
    if let Some(topic) = &request.topic {
        println!("topic:        {}", topic);
    }
    println!("chunks:       {}", request.chunk_ids.len());
    println!(
        "artifacts:    {} ({} new)",
        request.artifact_ids.len(),
        request.new_artifacts
    );
    if request.retries > 0 {
        println!("retries:      {}", request.retries);
    }
    for warning in &request.warnings {
        println!("warning:      {}", warning);
    }
}

fn print_artifact(artifact: &StudyArtifact) {
    let span = if artifact.source_span.first == artifact.source_span.last {
        format!("chunk {}", artifact.source_span.first)
    } else {
        format!(
            "chunks {}-{}",
            artifact.source_span.first, artifact.source_span.last
        )
    };
    match &artifact.body {
        ArtifactBody::Flashcard { front, back } => {
            println!("[{}] {}", span, front);
            println!("    → {}", back);
        }
        ArtifactBody::QuizItem {
            question,
            choices,
            correct_index,
            explanation,
        } => {
            println!("[{}] {}", span, question);
            for (i, choice) in choices.iter().enumerate() {
                let mark = if i == *correct_index { "*" } else { " " };
                println!("  {} {}) {}", mark, (b'a' + i as u8) as char, choice);
            }
            if let Some(explanation) = explanation {
                println!("    {}", explanation);
            }
        }
        ArtifactBody::SummaryBlock { heading, body } => {
            println!("## {} [{}]", heading, span);
            println!("{}", body);
        }
    }
    println!();
}
