//! # Study Harness
//!
//! Turns learning material into study artifacts.
//!
//! A source (PDF, photographed page, web page, YouTube video or plain text) is extracted
//! into provenance-tagged text segments, normalized into token-bounded
//! chunks, rendered into prompts, sent to an AI model and parsed back into
//! flashcards, quiz items or summary blocks. Artifacts are stored locally
//! and reconciled with an optional remote store through an offline FIFO
//! queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────┐   ┌──────────┐
//! │ Extractors │──▶│ Normalizer │──▶│  Prompt  │──▶│ AI model │
//! │ PDF/OCR/Web│   │  (chunks)  │   │ builder  │   └────┬─────┘
//! └────────────┘   └────────────┘   └──────────┘        │
//!                                                       ▼
//!      ┌──────────┐      ┌──────────────┐      ┌──────────────┐
//!      │  Remote  │◀─────│ ArtifactStore│◀─────│    Parser    │
//!      │  store   │queue │ SQLite local │      │ + dedup      │
//!      └──────────┘      └──────────────┘      └──────────────┘
//! ```
//!
//! The pure pieces (normalizer, prompt builder, parser, request state
//! machine, retry policy, store traits) live in `study-harness-core`. This
//! crate adds the I/O: extractors, HTTP clients, SQLite, the orchestrator,
//! the CLI and the HTTP API.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`telemetry`] | `tracing` subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed local store |
//! | [`intake`] | Uploads and URLs into source documents |
//! | [`extract`] | Source extractor dispatch and plain text |
//! | [`extract_pdf`] | PDF text layer and scanned-page OCR |
//! | [`extract_image`] | Photographed pages via OCR |
//! | [`extract_web`] | Web page fetching and readable-block extraction |
//! | [`extract_youtube`] | YouTube caption transcripts |
//! | [`ocr`] | OCR engine clients |
//! | [`ai`] | AI model clients |
//! | [`remote`] | Remote artifact store client |
//! | [`clock`] | Tokio-backed clock |
//! | [`orchestrator`] | Generation request state machine |
//! | [`generate_cmd`] | `sth generate`, `status`, `artifacts` |
//! | [`sync_cmd`] | `sth sync` and the background queue drain |
//! | [`server`] | HTTP API |

pub mod ai;
pub mod clock;
pub mod config;
pub mod db;
pub mod extract;
pub mod extract_image;
pub mod extract_pdf;
pub mod extract_web;
pub mod extract_youtube;
pub mod generate_cmd;
pub mod intake;
pub mod migrate;
pub mod ocr;
pub mod orchestrator;
pub mod remote;
pub mod server;
pub mod sqlite_store;
pub mod sync_cmd;
pub mod telemetry;
