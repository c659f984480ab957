//! Document ingestion: read files, tag formats, chunk, store.
//!
//! Accepts a single file or a directory tree. Plain-text formats are read
//! directly; PDF and DOCX are recognized but rejected with an error telling
//! the operator to extract text externally first. Each document is processed
//! independently, so one bad file never blocks the rest: the command reports
//! per-file outcomes and exits non-zero only when nothing was ingested.

use anyhow::{bail, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunker;
use crate::config::Config;
use crate::error::IngestionError;
use crate::models::{
    Chunk, Document, DocumentStatus, EventStatus, OperationType, SourceFormat,
};
use crate::store::Store;
use crate::telemetry::{self, TelemetryRecorder};

/// Outcome of ingesting one file.
#[derive(Debug)]
pub enum FileOutcome {
    Ingested {
        document_id: String,
        chunks: usize,
    },
    Failed(IngestionError),
}

pub struct IngestReport {
    pub outcomes: Vec<(PathBuf, FileOutcome)>,
}

impl IngestReport {
    pub fn ingested(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, FileOutcome::Ingested { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.ingested()
    }
}

pub async fn run_ingest(
    config: &Config,
    store: &Store,
    recorder: &TelemetryRecorder,
    path: &Path,
) -> Result<IngestReport> {
    if !path.exists() {
        bail!("Path does not exist: {}", path.display());
    }

    let files = if path.is_dir() {
        collect_files(config, path)?
    } else {
        vec![path.to_path_buf()]
    };

    if files.is_empty() {
        bail!("No matching files under {}", path.display());
    }

    let mut outcomes = Vec::with_capacity(files.len());
    for file in files {
        let started = telemetry::now_ms();
        let outcome = ingest_file(config, store, &file).await?;

        let (status, error_detail, op_id, metrics) = match &outcome {
            FileOutcome::Ingested {
                document_id,
                chunks,
            } => (
                EventStatus::Success,
                None,
                document_id.clone(),
                serde_json::json!({"chunks": chunks, "file": file.display().to_string()}),
            ),
            FileOutcome::Failed(e) => (
                EventStatus::Failure,
                Some(e.to_string()),
                file.display().to_string(),
                serde_json::json!({"file": file.display().to_string()}),
            ),
        };
        recorder.record(telemetry::event(
            OperationType::Ingest,
            &op_id,
            started,
            status,
            error_detail,
            0.0,
            metrics,
        ));
        recorder.maybe_flush().await;

        outcomes.push((file, outcome));
    }

    Ok(IngestReport { outcomes })
}

/// Ingest a single file. Ingestion-level failures (unreadable, unsupported
/// format) are captured in the outcome; storage failures propagate.
async fn ingest_file(config: &Config, store: &Store, path: &Path) -> Result<FileOutcome> {
    let format = match detect_format(path) {
        Ok(f) => f,
        Err(e) => return Ok(FileOutcome::Failed(e)),
    };

    if !format.is_plain_text() {
        return Ok(FileOutcome::Failed(IngestionError::NeedsExtraction {
            path: path.display().to_string(),
            format: format.as_str().to_string(),
        }));
    }

    let body = match std::fs::read_to_string(path) {
        Ok(b) => b,
        Err(e) => {
            return Ok(FileOutcome::Failed(IngestionError::Unreadable {
                path: path.display().to_string(),
                detail: e.to_string(),
            }))
        }
    };

    let doc = Document {
        id: Uuid::new_v4().to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()),
        body,
        format,
        status: DocumentStatus::Pending,
        created_at: Utc::now().timestamp(),
    };
    store.insert_document(&doc).await?;

    let pieces = chunker::split(
        &doc.body,
        config.chunking.chunk_size_tokens,
        config.chunking.overlap_tokens,
    );
    let total = pieces.len() as i64;
    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .map(|p| Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            chunk_index: p.index,
            chunk_total: total,
            text: p.text,
            token_count: p.token_count,
            metadata_json: serde_json::json!({"filename": doc.filename}).to_string(),
        })
        .collect();

    store.insert_chunks(&chunks).await?;
    store
        .set_document_status(&doc.id, DocumentStatus::Chunked)
        .await?;

    Ok(FileOutcome::Ingested {
        document_id: doc.id,
        chunks: chunks.len(),
    })
}

fn detect_format(path: &Path) -> Result<SourceFormat, IngestionError> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(SourceFormat::from_extension)
        .ok_or_else(|| IngestionError::UnknownFormat {
            path: path.display().to_string(),
        })
}

/// Walk a directory collecting files that match the configured globs,
/// sorted for deterministic ordering.
fn collect_files(config: &Config, root: &Path) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(&config.ingest.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.ingest.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        files.push(path.to_path_buf());
    }

    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Print the per-file report in CLI form.
pub fn print_report(report: &IngestReport) {
    for (path, outcome) in &report.outcomes {
        match outcome {
            FileOutcome::Ingested {
                document_id,
                chunks,
            } => {
                println!("  ok   {} ({} chunks, id {})", path.display(), chunks, document_id);
            }
            FileOutcome::Failed(e) => {
                println!("  fail {}: {}", path.display(), e);
            }
        }
    }
    println!(
        "ingested {} document(s), {} failure(s)",
        report.ingested(),
        report.failed()
    );
}
