//! # Study Harness CLI (`sth`)
//!
//! Turns PDFs, photographed pages, web pages, YouTube videos and text files into
//! flashcards, quizzes and summaries.
//!
//! ## Usage
//!
//! ```bash
//! sth --config ./config/sth.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sth init` | Create the SQLite database and run schema migrations |
//! | `sth generate <path\|url> --type <t>` | Run a generation request to completion |
//! | `sth regenerate <document-id>` | Re-master a document's quiz into a new one |
//! | `sth status [id]` | Show one request, or the most recent ones |
//! | `sth artifacts <document-id>` | List a document's artifacts |
//! | `sth sync` | Replay queued writes to the remote store |
//! | `sth serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! sth init
//! sth generate lecture-3.pdf --type flashcards --count 15
//! sth generate https://en.wikipedia.org/wiki/Mitochondrion --type quiz --difficulty hard
//! sth generate https://youtu.be/dQw4w9WgXcQ --type summary
//! sth regenerate 3f2a9c... --count 5
//! sth status
//! sth serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use study_harness::config::{self, Config};
use study_harness::{generate_cmd, migrate, server, sync_cmd, telemetry};
use study_harness_core::models::{ArtifactType, Difficulty, GenerationOptions, SourceKind};

/// Study Harness: generate study material from your sources.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. When the file does not exist, defaults are used.
#[derive(Parser)]
#[command(
    name = "sth",
    about = "Study Harness: turn PDFs, photos and web pages into flashcards, quizzes and summaries",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sth.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Extract a source and generate study artifacts from it.
    Generate {
        /// File path or http(s) URL.
        source: String,

        /// `flashcards`, `quiz`, or `summary`.
        #[arg(long = "type", short = 't', value_parser = parse_artifact_type)]
        artifact_type: ArtifactType,

        /// Items to ask for per AI call.
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// `easy`, `medium`, or `hard`.
        #[arg(long, default_value = "medium", value_parser = parse_difficulty)]
        difficulty: Difficulty,

        /// Override source kind detection (`pdf`, `image`, `web_page`, `plain_text`, `youtube`).
        #[arg(long, value_parser = parse_kind)]
        kind: Option<SourceKind>,

        /// Print the final request as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate a new quiz from the concepts of a document's existing quiz.
    Regenerate {
        /// Document id (content hash).
        document_id: String,

        /// Questions to ask for.
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// `easy`, `medium`, or `hard`.
        #[arg(long, default_value = "medium", value_parser = parse_difficulty)]
        difficulty: Difficulty,

        #[arg(long)]
        json: bool,
    },

    /// Show a request, or list recent requests.
    Status {
        /// Request id. Omit to list recent requests.
        id: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// List the artifacts generated for a document.
    Artifacts {
        /// Document id (content hash).
        document_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Replay queued writes to the remote store.
    Sync {
        /// Also pull remote artifacts for these documents.
        #[arg(long = "pull")]
        pull: Vec<String>,
    },

    /// Start the HTTP API.
    Serve,
}

fn parse_artifact_type(s: &str) -> Result<ArtifactType, String> {
    s.parse()
}

fn parse_difficulty(s: &str) -> Result<Difficulty, String> {
    s.parse()
}

fn parse_kind(s: &str) -> Result<SourceKind, String> {
    s.parse()
}

fn load(path: &std::path::Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        let cfg = Config::default();
        config::validate(&cfg)?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    telemetry::init_tracing(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Generate {
            source,
            artifact_type,
            count,
            difficulty,
            kind,
            json,
        } => {
            if count == 0 {
                anyhow::bail!("--count must be > 0");
            }
            let options = GenerationOptions {
                item_count: count,
                difficulty,
            };
            generate_cmd::run_generate(&cfg, &source, artifact_type, options, kind, json).await?;
        }
        Commands::Regenerate {
            document_id,
            count,
            difficulty,
            json,
        } => {
            if count == 0 {
                anyhow::bail!("--count must be > 0");
            }
            let options = GenerationOptions {
                item_count: count,
                difficulty,
            };
            generate_cmd::run_regenerate(&cfg, &document_id, options, json).await?;
        }
        Commands::Status { id, limit, json } => {
            generate_cmd::run_status(&cfg, id.as_deref(), limit, json).await?;
        }
        Commands::Artifacts { document_id, json } => {
            generate_cmd::run_artifacts(&cfg, &document_id, json).await?;
        }
        Commands::Sync { pull } => {
            let orchestrator = generate_cmd::open_orchestrator(&cfg).await?;
            sync_cmd::run_sync(&orchestrator, &pull).await?;
        }
        Commands::Serve => {
            let orchestrator = generate_cmd::open_orchestrator(&cfg).await?;
            server::run_server(&cfg, orchestrator).await?;
        }
    }

    Ok(())
}
