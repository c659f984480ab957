//! Document retrieval by ID for `ragline get`.

use anyhow::{bail, Result};

use crate::store::Store;

pub async fn run_get(store: &Store, id: &str) -> Result<()> {
    let doc = match store.get_document(id).await? {
        Some(d) => d,
        None => bail!("document not found: {}", id),
    };

    let chunks = store.chunks_for_document(id).await?;

    println!("--- Document ---");
    println!("id:         {}", doc.id);
    println!("filename:   {}", doc.filename);
    println!("format:     {}", doc.format.as_str());
    println!("status:     {}", doc.status.as_str());
    println!("created_at: {}", format_ts_iso(doc.created_at));
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    println!("--- Chunks ({}) ---", chunks.len());
    for chunk in &chunks {
        println!(
            "[chunk {}/{}, {} tokens]",
            chunk.chunk_index + 1,
            chunk.chunk_total,
            chunk.token_count
        );
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
