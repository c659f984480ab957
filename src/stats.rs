//! Database overview report.
//!
//! Quick summary of what's indexed: document counts by status, chunk counts,
//! embedding coverage, and query history volume. Used by `ragline stats` to
//! give confidence that ingestion and embedding are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::store::Store;

pub async fn run_stats(config: &Config, store: &Store) -> Result<()> {
    let total_docs = store.count("documents").await?;
    let total_chunks = store.count("chunks").await?;
    let total_embedded = store.count("chunk_vectors").await?;
    let total_queries = store.count("query_history").await?;
    let total_events = store.count("telemetry").await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Ragline — Database Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!("  Queries:     {}", total_queries);
    println!("  Telemetry:   {} events", total_events);

    let status_counts = store.document_status_counts().await?;
    if !status_counts.is_empty() {
        println!();
        println!("  By status:");
        for (status, n) in &status_counts {
            println!("    {:<10} {}", status, n);
        }
    }

    // Most recent queries as a quick health check
    let recent = sqlx::query(
        "SELECT query_text, state, duration_ms, created_at FROM query_history
         ORDER BY created_at DESC LIMIT 5",
    )
    .fetch_all(store.pool())
    .await?;

    if !recent.is_empty() {
        println!();
        println!("  Recent queries:");
        for row in &recent {
            let text: String = row.get("query_text");
            let preview: String = text.chars().take(48).collect();
            println!(
                "    [{}] {} ms  \"{}\"",
                row.get::<String, _>("state"),
                row.get::<i64, _>("duration_ms"),
                preview
            );
        }
    }

    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
