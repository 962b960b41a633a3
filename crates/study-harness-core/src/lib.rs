//! # Study Harness Core
//!
//! Runtime-free logic for Study Harness: data models, content identity,
//! text normalization, prompt construction, AI response parsing, the
//! generation request state machine, retry policy, collaborator traits,
//! store traits and artifact reconciliation.
//!
//! This crate contains no tokio runtime, sqlx, filesystem or network I/O.
//! The native `study-harness` crate supplies concrete extractors, HTTP
//! clients, SQLite persistence and the orchestrator.

pub mod error;
pub mod identity;
pub mod models;
pub mod normalize;
pub mod parse;
pub mod prompt;
pub mod request;
pub mod retry;
pub mod services;
pub mod store;
pub mod sync;
