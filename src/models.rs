//! Core data models used throughout Ragline.
//!
//! These types represent the documents, chunks, query records, and telemetry
//! events that flow through the ingestion and query pipelines.

use serde::{Deserialize, Serialize};

/// Source format of an ingested document.
///
/// Binary formats (`Pdf`, `Docx`) are recognized so their tag can be stored,
/// but text extraction for them is an external concern; only plain-text
/// formats are read directly by the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Pdf,
    Docx,
    Txt,
    Markdown,
}

impl SourceFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Txt),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Txt => "txt",
            Self::Markdown => "markdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" => Some(Self::Txt),
            "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Whether the pipeline can read this format without an external extractor.
    pub fn is_plain_text(&self) -> bool {
        matches!(self, Self::Txt | Self::Markdown)
    }
}

/// Processing status of a document. Advances monotonically; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Chunked,
    Embedded,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Chunked => "chunked",
            Self::Embedded => "embedded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "chunked" => Some(Self::Chunked),
            "embedded" => Some(Self::Embedded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A document stored in the `documents` table.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub body: String,
    pub format: SourceFormat,
    pub status: DocumentStatus,
    pub created_at: i64,
}

/// A chunk of a document's body text, the atomic unit of embedding and retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub chunk_total: i64,
    pub text: String,
    pub token_count: i64,
    pub metadata_json: String,
}

/// A raw similarity hit from the vector store: chunk identifier plus score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

/// A fully resolved retrieval result: the chunk record plus its score.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// State machine for query processing.
///
/// `received → query_embedded → retrieved → context_built → completed →
/// recorded`, with `failed` reachable from any non-terminal state. No state
/// is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Received,
    QueryEmbedded,
    Retrieved,
    ContextBuilt,
    Completed,
    Recorded,
    Failed,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::QueryEmbedded => "query_embedded",
            Self::Retrieved => "retrieved",
            Self::ContextBuilt => "context_built",
            Self::Completed => "completed",
            Self::Recorded => "recorded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recorded | Self::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(&self, next: QueryState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == QueryState::Failed {
            return true;
        }
        matches!(
            (self, next),
            (Self::Received, Self::QueryEmbedded)
                | (Self::QueryEmbedded, Self::Retrieved)
                | (Self::Retrieved, Self::ContextBuilt)
                | (Self::ContextBuilt, Self::Completed)
                | (Self::Completed, Self::Recorded)
                // search-free queries go straight from received to context assembly
                | (Self::Received, Self::ContextBuilt)
        )
    }
}

/// One query's full lifecycle, finalized exactly once.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub id: String,
    pub query_text: String,
    /// Ordered `(chunk_id, score)` pairs, serialized to JSON for storage.
    pub retrieved: Vec<SearchHit>,
    pub answer_text: Option<String>,
    pub state: QueryState,
    pub duration_ms: i64,
    pub cost_estimate: f64,
    pub error_detail: Option<String>,
    pub created_at: i64,
}

/// Operation type attached to every telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Ingest,
    Embed,
    Search,
    Complete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Embed => "embed",
            Self::Search => "search",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "embed" => Some(Self::Embed),
            "search" => Some(Self::Search),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Outcome of a telemetry-tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Success,
    Failure,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// A structured record of one pipeline operation. Append-only.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub id: String,
    pub operation: OperationType,
    /// Identifier of the document, chunk batch, or query being processed.
    pub operation_id: String,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: i64,
    pub status: EventStatus,
    /// Present iff `status` is `Failure`.
    pub error_detail: Option<String>,
    pub cost_estimate: f64,
    /// Arbitrary metrics (attempt counts, token counts, result counts).
    pub metrics_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            SourceFormat::from_extension("md"),
            Some(SourceFormat::Markdown)
        );
        assert_eq!(SourceFormat::from_extension("PDF"), Some(SourceFormat::Pdf));
        assert_eq!(SourceFormat::from_extension("rs"), None);
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            DocumentStatus::Pending,
            DocumentStatus::Chunked,
            DocumentStatus::Embedded,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_query_state_happy_path() {
        let path = [
            QueryState::Received,
            QueryState::QueryEmbedded,
            QueryState::Retrieved,
            QueryState::ContextBuilt,
            QueryState::Completed,
            QueryState::Recorded,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_query_state_failed_from_any_nonterminal() {
        for s in [
            QueryState::Received,
            QueryState::QueryEmbedded,
            QueryState::Retrieved,
            QueryState::ContextBuilt,
            QueryState::Completed,
        ] {
            assert!(s.can_transition(QueryState::Failed));
        }
    }

    #[test]
    fn test_query_state_terminal_is_final() {
        assert!(!QueryState::Recorded.can_transition(QueryState::Failed));
        assert!(!QueryState::Failed.can_transition(QueryState::Received));
        assert!(!QueryState::Retrieved.can_transition(QueryState::QueryEmbedded));
    }
}
