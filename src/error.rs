//! Error taxonomy for the pipeline.
//!
//! Each stage has its own error type so callers can distinguish transient
//! failures (worth retrying) from permanent ones. Transient variants are
//! produced by timeouts, throttling, and network errors; permanent variants
//! by malformed input, auth failures, and unsupported models. The `Exhausted`
//! variants carry the attempt count and last underlying error so a caller can
//! diagnose without retrying blindly.

use thiserror::Error;

/// Failure while reading or normalizing a document. Never retried.
#[derive(Debug, Clone, Error)]
pub enum IngestionError {
    #[error("unreadable document {path}: {detail}")]
    Unreadable { path: String, detail: String },
    #[error("unsupported format '{format}' for {path}: run an external extractor and ingest the plain text")]
    NeedsExtraction { path: String, format: String },
    #[error("unrecognized file type: {path}")]
    UnknownFormat { path: String },
}

/// Failure while producing embeddings.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    /// Timeout, rate limit, server error, or network failure. Retried.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// Invalid input, auth error, unknown model. Fails immediately.
    #[error("permanent embedding failure: {0}")]
    Permanent(String),
    /// All retries used up on a transient failure.
    #[error("embedding failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    /// Backend returned a malformed or mismatched response.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Failure while searching the vector store.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed search request: {0}")]
    BadRequest(String),
}

/// Failure while generating a completion.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("transient completion failure: {0}")]
    Transient(String),
    #[error("permanent completion failure: {0}")]
    Permanent(String),
    #[error("completion failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("invalid completion response: {0}")]
    InvalidResponse(String),
}

/// Top-level failure of a query pipeline run, tagged by the stage that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Short category label for user-facing error reporting.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Embedding(_) => "embedding",
            Self::Search(_) => "search",
            Self::Completion(_) => "completion",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
