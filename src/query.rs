//! Query pipeline orchestration.
//!
//! Runs a query through embed → retrieve → context → complete, driving the
//! `QueryRecord` state machine. The retriever and completion client are
//! injected by the caller, so any backend (including a failing one) can sit
//! behind the pipeline. Each client invocation records its own telemetry
//! event: `embed` for the query embedding, `search` for the store lookup,
//! `complete` for generation. `--no-search` skips retrieval and completes
//! against the bare question.
//!
//! The record is finalized exactly once: `recorded` on success, `failed`
//! with the error captured otherwise. A completion failure after successful
//! retrieval still returns the assembled context, labeled as context-only.

use anyhow::Result;
use chrono::Utc;
use std::time::Instant;
use uuid::Uuid;

use crate::completion::{CompletionClient, CompletionOptions};
use crate::config::Config;
use crate::context::{self, BuiltContext};
use crate::error::PipelineError;
use crate::models::{
    EventStatus, OperationType, QueryRecord, QueryState, RetrievedChunk, SearchHit,
};
use crate::retriever::Retriever;
use crate::store::Store;
use crate::telemetry::{self, TelemetryRecorder};

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub temperature: Option<f32>,
    pub no_search: bool,
}

pub struct QueryOutcome {
    pub record: QueryRecord,
    pub sources: Vec<RetrievedChunk>,
    pub context: BuiltContext,
    /// `None` means the completion stage failed; the context is still
    /// available for the caller to present.
    pub answer: Option<String>,
}

fn advance(state: &mut QueryState, next: QueryState) {
    debug_assert!(state.can_transition(next), "{:?} -> {:?}", state, next);
    *state = next;
}

pub async fn run_query(
    config: &Config,
    store: &Store,
    recorder: &TelemetryRecorder,
    retriever: &Retriever,
    completion: &CompletionClient,
    query_text: &str,
    options: QueryOptions,
) -> Result<QueryOutcome> {
    let started = Instant::now();
    let mut record = QueryRecord {
        id: Uuid::new_v4().to_string(),
        query_text: query_text.to_string(),
        retrieved: Vec::new(),
        answer_text: None,
        state: QueryState::Received,
        duration_ms: 0,
        cost_estimate: 0.0,
        error_detail: None,
        created_at: Utc::now().timestamp(),
    };

    let top_k = options.top_k.unwrap_or(config.retrieval.top_k);
    let mut sources: Vec<RetrievedChunk> = Vec::new();
    let mut total_cost = 0.0f64;

    let built = if options.no_search {
        // Search-free mode: straight to context assembly with no retrieval
        let built = context::build(&[], config.retrieval.max_context_tokens);
        advance(&mut record.state, QueryState::ContextBuilt);
        built
    } else {
        // Query embedding, one telemetry event of its own
        let embed_started = telemetry::now_ms();
        let embedded = match retriever.embed_query(query_text).await {
            Ok((embedded, attempts)) => {
                advance(&mut record.state, QueryState::QueryEmbedded);

                let query_cost = telemetry::token_cost(
                    retriever.model(),
                    telemetry::estimate_tokens(embedded.token_count),
                );
                total_cost += query_cost;

                recorder.record(telemetry::event(
                    OperationType::Embed,
                    &record.id,
                    embed_started,
                    EventStatus::Success,
                    None,
                    query_cost,
                    serde_json::json!({
                        "tokens": embedded.token_count,
                        "attempts": attempts,
                    }),
                ));
                embedded
            }
            Err(e) => {
                recorder.record(telemetry::event(
                    OperationType::Embed,
                    &record.id,
                    embed_started,
                    EventStatus::Failure,
                    Some(e.to_string()),
                    0.0,
                    serde_json::json!({}),
                ));
                let e = PipelineError::Embedding(e);
                let detail = format!("{}: {}", e.category(), e);
                finalize_failed(store, recorder, record, started, &detail).await?;
                return Err(e.into());
            }
        };

        let search_started = telemetry::now_ms();
        match retriever
            .search(&embedded.vector, top_k, config.retrieval.similarity_threshold)
            .await
        {
            Ok(chunks) => {
                advance(&mut record.state, QueryState::Retrieved);

                record.retrieved = chunks
                    .iter()
                    .map(|r| SearchHit {
                        chunk_id: r.chunk.id.clone(),
                        score: r.score,
                    })
                    .collect();

                recorder.record(telemetry::event(
                    OperationType::Search,
                    &record.id,
                    search_started,
                    EventStatus::Success,
                    None,
                    0.0,
                    serde_json::json!({
                        "results": chunks.len(),
                        "top_k": top_k,
                    }),
                ));

                sources = chunks;
                let built = context::build(&sources, config.retrieval.max_context_tokens);
                advance(&mut record.state, QueryState::ContextBuilt);
                built
            }
            Err(e) => {
                recorder.record(telemetry::event(
                    OperationType::Search,
                    &record.id,
                    search_started,
                    EventStatus::Failure,
                    Some(e.to_string()),
                    0.0,
                    serde_json::json!({"top_k": top_k}),
                ));
                let detail = format!("{}: {}", e.category(), e);
                finalize_failed(store, recorder, record, started, &detail).await?;
                return Err(e.into());
            }
        }
    };

    // Completion stage
    let complete_started = telemetry::now_ms();
    let model = completion.model().to_string();
    let prompt = build_prompt(query_text, &built);

    let completion_options = CompletionOptions {
        temperature: options.temperature,
        ..Default::default()
    };

    match completion.complete(&prompt, completion_options).await {
        Ok(outcome) => {
            advance(&mut record.state, QueryState::Completed);

            let est = telemetry::estimate_tokens(outcome.input_tokens + outcome.output_tokens);
            let cost = telemetry::token_cost(&model, est);
            total_cost += cost;

            recorder.record(telemetry::event(
                OperationType::Complete,
                &record.id,
                complete_started,
                EventStatus::Success,
                None,
                cost,
                serde_json::json!({
                    "input_tokens": outcome.input_tokens,
                    "output_tokens": outcome.output_tokens,
                    "attempts": outcome.attempts,
                }),
            ));

            record.answer_text = Some(outcome.text.clone());
            record.cost_estimate = total_cost;
            record.duration_ms = started.elapsed().as_millis() as i64;
            advance(&mut record.state, QueryState::Recorded);
            store.insert_query_record(&record).await?;
            recorder.maybe_flush().await;

            Ok(QueryOutcome {
                record,
                sources,
                context: built,
                answer: Some(outcome.text),
            })
        }
        Err(e) => {
            recorder.record(telemetry::event(
                OperationType::Complete,
                &record.id,
                complete_started,
                EventStatus::Failure,
                Some(e.to_string()),
                0.0,
                serde_json::json!({}),
            ));

            // Retrieval succeeded, so hand the context back instead of
            // discarding the work
            record.cost_estimate = total_cost;
            let detail = e.to_string();
            let record = finalize_failed(store, recorder, record, started, &detail).await?;

            Ok(QueryOutcome {
                record,
                sources,
                context: built,
                answer: None,
            })
        }
    }
}

async fn finalize_failed(
    store: &Store,
    recorder: &TelemetryRecorder,
    mut record: QueryRecord,
    started: Instant,
    detail: &str,
) -> Result<QueryRecord, PipelineError> {
    advance(&mut record.state, QueryState::Failed);
    record.error_detail = Some(detail.to_string());
    record.duration_ms = started.elapsed().as_millis() as i64;
    store.insert_query_record(&record).await?;
    recorder.maybe_flush().await;
    Ok(record)
}

/// Context-enhanced prompt: instruction, numbered source blocks, question.
fn build_prompt(query_text: &str, context: &BuiltContext) -> String {
    if context.text.is_empty() {
        return query_text.to_string();
    }
    format!(
        "Answer the question using only the context below. \
         Cite sources by number where relevant.\n\n{}\n\nQuestion: {}",
        context.text, query_text
    )
}

/// Print the query result in CLI form.
pub fn print_outcome(outcome: &QueryOutcome) {
    match &outcome.answer {
        Some(answer) => {
            println!("{}", answer);
        }
        None => {
            println!("(context only, no generated answer)");
            if !outcome.context.text.is_empty() {
                println!("\n{}", outcome.context.text);
            }
            if let Some(detail) = &outcome.record.error_detail {
                println!("\ncompletion failed: {}", detail);
            }
        }
    }

    if !outcome.sources.is_empty() {
        println!("\nsources:");
        for (i, source) in outcome.sources.iter().enumerate() {
            let preview: String = source.chunk.text.chars().take(80).collect();
            println!(
                "  {}. [{:.2}] {} #{} \"{}\"",
                i + 1,
                source.score,
                source.chunk.document_id,
                source.chunk.chunk_index,
                preview.replace('\n', " ")
            );
        }
    }

    println!(
        "\n{} ms, est. cost ${:.6}, context {} tokens",
        outcome.record.duration_ms, outcome.record.cost_estimate, outcome.context.token_count
    );
}
