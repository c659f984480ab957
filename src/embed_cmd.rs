//! Backfill and rebuild chunk embeddings.
//!
//! `embed pending` finds chunks without a current embedding and embeds them
//! in batches; `embed rebuild` clears every stored vector first and re-embeds
//! the whole corpus. Batches run concurrently under a semaphore bound
//! (`embedding.concurrency`); results are written from the command task so
//! the writer side stays single-file. Within a batch, vector order matches
//! chunk order; across batches, completion order is unspecified.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::embedding::{self, EmbeddedText, EmbeddingClient};
use crate::error::EmbeddingError;
use crate::models::{Chunk, DocumentStatus, EventStatus, OperationType};
use crate::store::Store;
use crate::telemetry::{self, TelemetryRecorder};

pub async fn run_embed_pending(
    config: &Config,
    store: &Store,
    recorder: &TelemetryRecorder,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let pending = store
        .chunks_missing_embeddings(limit.map(|l| l as i64))
        .await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        return Ok(());
    }

    let (embedded, failed) =
        embed_chunks(config, store, recorder, pending, batch_size_override).await?;

    println!("embed pending");
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);
    Ok(())
}

pub async fn run_embed_rebuild(
    config: &Config,
    store: &Store,
    recorder: &TelemetryRecorder,
    batch_size_override: Option<usize>,
) -> Result<()> {
    sqlx::query("DELETE FROM chunk_vectors")
        .execute(store.pool())
        .await?;
    sqlx::query("DELETE FROM embeddings")
        .execute(store.pool())
        .await?;

    println!("embed rebuild, cleared existing embeddings");

    let all_chunks = store.all_chunks().await?;
    if all_chunks.is_empty() {
        println!("  no chunks to embed");
        return Ok(());
    }

    let total = all_chunks.len();
    let (embedded, failed) =
        embed_chunks(config, store, recorder, all_chunks, batch_size_override).await?;

    println!("  total chunks: {}", total);
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);
    Ok(())
}

type BatchResult = (
    Vec<String>,
    Vec<Result<EmbeddedText, EmbeddingError>>,
    u32,
    i64,
);

/// Embed `chunks` batch-concurrently and persist the vectors.
///
/// Returns `(embedded, failed)` counts. One telemetry event is recorded per
/// batch. Documents whose chunks are now fully covered advance to `embedded`.
async fn embed_chunks(
    config: &Config,
    store: &Store,
    recorder: &TelemetryRecorder,
    chunks: Vec<Chunk>,
    batch_size_override: Option<usize>,
) -> Result<(u64, u64)> {
    let backend = embedding::create_backend(&config.embedding)?;
    let mut embed_config = config.embedding.clone();
    if let Some(bs) = batch_size_override {
        embed_config.batch_size = bs;
    }
    let client = EmbeddingClient::new(backend, &embed_config);
    let model = client.model().to_string();
    let dims = client.dims();

    let semaphore = Arc::new(Semaphore::new(config.embedding.concurrency));
    let mut join_set: JoinSet<BatchResult> = JoinSet::new();

    for batch in chunks.chunks(embed_config.batch_size.max(1)) {
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let client = client.clone();
        let semaphore = Arc::clone(&semaphore);

        join_set.spawn(async move {
            let started = telemetry::now_ms();
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    // Semaphore closed during shutdown; report the batch as failed
                    let errs = ids
                        .iter()
                        .map(|_| Err(EmbeddingError::Transient("cancelled".to_string())))
                        .collect();
                    return (ids, errs, 0, started);
                }
            };
            let (results, attempts) = client.embed(&texts).await;
            (ids, results, attempts, started)
        });
    }

    let mut embedded = 0u64;
    let mut failed = 0u64;
    let mut touched_docs: HashSet<String> = HashSet::new();
    for chunk in &chunks {
        touched_docs.insert(chunk.document_id.clone());
    }

    while let Some(joined) = join_set.join_next().await {
        let (ids, results, attempts, started) = match joined {
            Ok(r) => r,
            Err(e) => {
                log::warn!("embedding batch task panicked: {}", e);
                continue;
            }
        };

        let mut batch_tokens = 0usize;
        let mut batch_failed = 0u64;
        let mut first_error: Option<String> = None;

        for (chunk_id, result) in ids.iter().zip(results) {
            match result {
                Ok(embedded_text) => {
                    store
                        .upsert_embedding(chunk_id, &embedded_text.vector, &model, dims)
                        .await?;
                    batch_tokens += embedded_text.token_count;
                    embedded += 1;
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                    }
                    batch_failed += 1;
                    failed += 1;
                }
            }
        }

        let est_tokens = telemetry::estimate_tokens(batch_tokens);
        let cost = telemetry::token_cost(&model, est_tokens);
        let status = if batch_failed == 0 {
            EventStatus::Success
        } else {
            EventStatus::Failure
        };
        recorder.record(telemetry::event(
            OperationType::Embed,
            &ids.first().cloned().unwrap_or_default(),
            started,
            status,
            first_error,
            cost,
            serde_json::json!({
                "chunks": ids.len(),
                "failed": batch_failed,
                "attempts": attempts,
                "tokens": est_tokens,
            }),
        ));
        recorder.maybe_flush().await;
    }

    for doc_id in touched_docs {
        if store.document_fully_embedded(&doc_id).await? {
            store
                .set_document_status(&doc_id, DocumentStatus::Embedded)
                .await?;
        }
    }

    Ok((embedded, failed))
}
