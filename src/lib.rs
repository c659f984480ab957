//! # Ragline
//!
//! A local-first retrieval-augmented generation (RAG) pipeline.
//!
//! Ragline ingests plain-text documents, splits them into overlapping
//! token-bounded chunks, embeds chunks and queries into fixed-dimension
//! vectors, retrieves the closest chunks by cosine similarity, assembles a
//! token-budgeted context, and forwards it to a completion backend. Every
//! pipeline stage records a telemetry event for metrics and cost reporting.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌───────────┐   ┌─────────┐   ┌───────────┐
//! │ Ingest │──▶│ Chunker   │──▶│ Embed   │──▶│  SQLite   │
//! │ files  │   │ (overlap) │   │ (batch) │   │ (vectors) │
//! └────────┘   └───────────┘   └─────────┘   └─────┬─────┘
//!                                                  │
//!              ┌─────────┐   ┌─────────┐   ┌───────▼────┐
//!  query ─────▶│ Retrieve│──▶│ Context │──▶│ Completion │──▶ answer
//!              └─────────┘   └─────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline init                      # create database
//! ragline ingest ./docs            # ingest and chunk files
//! ragline embed pending            # generate embeddings
//! ragline query "how do I deploy?" # ask a question
//! ragline metrics --hours 24       # pipeline telemetry
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Typed error taxonomy |
//! | [`chunker`] | Sliding-window token chunking |
//! | [`retry`] | Retry policy with backoff and jitter |
//! | [`embedding`] | Embedding backends and client |
//! | [`completion`] | Completion backends and client |
//! | [`store`] | Document, chunk, and vector persistence |
//! | [`retriever`] | Query-time retrieval |
//! | [`context`] | Token-budgeted context assembly |
//! | [`telemetry`] | Buffered event recording and reports |
//! | [`query`] | Query pipeline orchestration |

pub mod chunker;
pub mod completion;
pub mod config;
pub mod context;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod retriever;
pub mod retry;
pub mod stats;
pub mod store;
pub mod telemetry;
