//! # Ragline CLI
//!
//! The `ragline` binary drives the RAG pipeline: database initialization,
//! document ingestion, embedding management, querying, and telemetry reports.
//!
//! ## Usage
//!
//! ```bash
//! ragline --config ./config/ragline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and run schema migrations |
//! | `ragline ingest <path>` | Ingest a file or directory, chunking as it goes |
//! | `ragline embed pending` | Embed chunks that have no vector yet |
//! | `ragline embed rebuild` | Delete and regenerate all embeddings |
//! | `ragline query "<text>"` | Run the full retrieve-and-complete pipeline |
//! | `ragline metrics` | Aggregate telemetry report |
//! | `ragline costs` | Cost breakdown by operation |
//! | `ragline errors` | Recent failures grouped by operation |
//! | `ragline stats` | Database overview |
//! | `ragline get <id>` | Retrieve a full document by UUID |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ragline::completion::CompletionClient;
use ragline::embedding::EmbeddingClient;
use ragline::models::OperationType;
use ragline::query::QueryOptions;
use ragline::retriever::Retriever;
use ragline::store::Store;
use ragline::telemetry::TelemetryRecorder;
use ragline::{
    completion, config, db, embed_cmd, embedding, get, ingest, migrate, query, stats, telemetry,
};

/// Ragline CLI: a local-first retrieval-augmented generation pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragline.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragline",
    about = "Ragline — a local-first retrieval-augmented generation pipeline",
    version,
    long_about = "Ragline ingests plain-text documents, chunks and embeds them into a local \
    SQLite vector store, and answers queries by retrieving the closest chunks and forwarding \
    a token-budgeted context to a completion backend. Every stage records telemetry."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent;
    /// running it multiple times is safe.
    Init,

    /// Ingest a file or directory.
    ///
    /// Plain-text files (.txt, .md) are read, chunked, and stored. Other
    /// formats are reported as failures without blocking the rest; the
    /// command exits non-zero only when nothing was ingested.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Run a query through the pipeline and print the answer with sources.
    Query {
        /// The question to answer.
        text: String,

        /// Number of chunks to retrieve (defaults to config).
        #[arg(long)]
        top_k: Option<usize>,

        /// Sampling temperature, 0.0-1.0 (defaults to config).
        #[arg(long)]
        temperature: Option<f32>,

        /// Skip retrieval and complete against the bare question.
        #[arg(long)]
        no_search: bool,
    },

    /// Aggregate telemetry metrics over a recent window.
    Metrics {
        /// Window size in hours.
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Cost breakdown by operation over a recent window.
    Costs {
        /// Window size in hours.
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Recent failures grouped by operation, with sample messages.
    Errors {
        /// Window size in hours.
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Database overview: document, chunk, and embedding counts.
    Stats,

    /// Retrieve a document by its UUID.
    Get {
        /// Document UUID.
        id: String,
    },
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that have no stored vector.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    ///
    /// Useful when switching embedding models or dimensions.
    Rebuild {
        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    let pool = db::connect(&cfg).await?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        pool.close().await;
        return Ok(());
    }

    let store = Store::new(pool.clone());
    let recorder = TelemetryRecorder::new(pool.clone(), &cfg.telemetry);

    let result = run_command(&cli.command, &cfg, &store, &recorder).await;

    // Telemetry always lands before exit, success or not
    recorder.flush().await;
    pool.close().await;
    result
}

async fn run_command(
    command: &Commands,
    cfg: &config::Config,
    store: &Store,
    recorder: &TelemetryRecorder,
) -> Result<()> {
    match command {
        Commands::Init => unreachable!("handled before pool setup"),
        Commands::Ingest { path } => {
            let report = ingest::run_ingest(cfg, store, recorder, path).await?;
            ingest::print_report(&report);
            if report.ingested() == 0 {
                anyhow::bail!("ingest failed for every file");
            }
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(cfg, store, recorder, *limit, *batch_size, *dry_run)
                    .await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(cfg, store, recorder, *batch_size).await?;
            }
        },
        Commands::Query {
            text,
            top_k,
            temperature,
            no_search,
        } => {
            let embed_backend = embedding::create_backend(&cfg.embedding)?;
            let retriever = Retriever::new(
                EmbeddingClient::new(embed_backend, &cfg.embedding),
                store.clone(),
            );
            let completion_client =
                CompletionClient::new(completion::create_backend(&cfg.completion)?, &cfg.completion);

            let outcome = query::run_query(
                cfg,
                store,
                recorder,
                &retriever,
                &completion_client,
                text,
                QueryOptions {
                    top_k: *top_k,
                    temperature: *temperature,
                    no_search: *no_search,
                },
            )
            .await?;
            query::print_outcome(&outcome);
        }
        Commands::Metrics { hours } => {
            print_metrics(store, *hours).await?;
        }
        Commands::Costs { hours } => {
            print_costs(store, *hours).await?;
        }
        Commands::Errors { hours } => {
            print_errors(store, *hours).await?;
        }
        Commands::Stats => {
            stats::run_stats(cfg, store).await?;
        }
        Commands::Get { id } => {
            get::run_get(store, id).await?;
        }
    }
    Ok(())
}

async fn print_metrics(store: &Store, hours: i64) -> Result<()> {
    println!("telemetry, last {} hour(s)", hours);
    println!();

    let overall = telemetry::query_metrics(store.pool(), hours, None).await?;
    println!(
        "  {:<10} {:>6} {:>9} {:>9} {:>8} {:>8} {:>11}",
        "OPERATION", "COUNT", "SUCCESS", "AVG MS", "P50 MS", "P95 MS", "COST USD"
    );
    println!("  {}", "-".repeat(66));
    print_metrics_row("all", &overall);

    for op in [
        OperationType::Ingest,
        OperationType::Embed,
        OperationType::Search,
        OperationType::Complete,
    ] {
        let report = telemetry::query_metrics(store.pool(), hours, Some(op)).await?;
        if report.count > 0 {
            print_metrics_row(op.as_str(), &report);
        }
    }
    println!();
    Ok(())
}

fn print_metrics_row(label: &str, report: &telemetry::MetricsReport) {
    println!(
        "  {:<10} {:>6} {:>8.1}% {:>9.1} {:>8} {:>8} {:>11.6}",
        label,
        report.count,
        report.success_rate * 100.0,
        report.avg_ms,
        report.p50_ms,
        report.p95_ms,
        report.total_cost
    );
}

async fn print_costs(store: &Store, hours: i64) -> Result<()> {
    let lines = telemetry::cost_breakdown(store.pool(), hours).await?;
    println!("cost breakdown, last {} hour(s)", hours);
    if lines.is_empty() {
        println!("  no recorded costs");
        return Ok(());
    }

    println!();
    println!("  {:<12} {:>12} {:>8}", "OPERATION", "COST USD", "SHARE");
    println!("  {}", "-".repeat(36));
    for line in &lines {
        println!(
            "  {:<12} {:>12.6} {:>7.1}%",
            line.operation, line.total_cost, line.share_pct
        );
    }
    println!();
    Ok(())
}

async fn print_errors(store: &Store, hours: i64) -> Result<()> {
    let groups = telemetry::error_analysis(store.pool(), hours).await?;
    println!("error analysis, last {} hour(s)", hours);
    if groups.is_empty() {
        println!("  no recorded failures");
        return Ok(());
    }

    println!();
    for group in &groups {
        println!("  {:<12} {} failure(s)", group.operation, group.count);
        for sample in &group.samples {
            println!("    - {}", sample);
        }
    }
    println!();
    Ok(())
}
