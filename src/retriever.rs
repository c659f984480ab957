//! Query-time retrieval: embed the query, search, resolve chunks.
//!
//! The embedding client is injected at construction, so callers (and tests)
//! control which backend sits behind it. [`Retriever::embed_query`] and
//! [`Retriever::search`] are exposed separately because each is a distinct
//! telemetry-tracked operation; [`Retriever::retrieve`] composes them.

use crate::embedding::{EmbeddedText, EmbeddingClient};
use crate::error::{EmbeddingError, PipelineError};
use crate::models::RetrievedChunk;
use crate::store::Store;

pub struct Retriever {
    client: EmbeddingClient,
    store: Store,
}

/// Successful retrieval: resolved chunks in score order plus the attempt
/// count spent embedding the query (for telemetry).
pub struct Retrieval {
    pub chunks: Vec<RetrievedChunk>,
    pub embed_attempts: u32,
    /// Post-truncation token count of the embedded query.
    pub query_tokens: usize,
}

impl Retriever {
    pub fn new(client: EmbeddingClient, store: Store) -> Self {
        Self { client, store }
    }

    /// Embedding model identifier, for cost attribution.
    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Embed the query text, reporting the attempts spent.
    pub async fn embed_query(
        &self,
        query_text: &str,
    ) -> Result<(EmbeddedText, u32), EmbeddingError> {
        self.client.embed_one(query_text).await
    }

    /// Search the store for the top chunks and resolve their rows. Zero
    /// matches is success with an empty result.
    pub async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedChunk>, PipelineError> {
        let hits = self.store.search(query_vec, top_k, threshold).await?;

        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let resolved = self.store.get_chunks_by_ids(&ids).await?;

        // Pair scores back up; resolution preserves hit order but may skip
        // chunks deleted since indexing
        let mut chunks = Vec::with_capacity(resolved.len());
        for chunk in resolved {
            if let Some(hit) = hits.iter().find(|h| h.chunk_id == chunk.id) {
                chunks.push(RetrievedChunk {
                    score: hit.score,
                    chunk,
                });
            }
        }
        Ok(chunks)
    }

    /// Embed then search in one call. Fails fast if the query cannot be
    /// embedded.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Retrieval, PipelineError> {
        let (embedded, embed_attempts) = self.embed_query(query_text).await?;
        let chunks = self.search(&embedded.vector, top_k, threshold).await?;

        Ok(Retrieval {
            chunks,
            embed_attempts,
            query_tokens: embedded.token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{EmbeddingBackend, HashEmbeddingBackend};
    use crate::migrate;
    use crate::models::{Chunk, Document, DocumentStatus, SourceFormat};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn seeded_retriever(texts: &[&str]) -> Retriever {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = Store::new(pool);

        let doc = Document {
            id: "d1".to_string(),
            filename: "d1.md".to_string(),
            body: texts.join("\n\n"),
            format: SourceFormat::Markdown,
            status: DocumentStatus::Chunked,
            created_at: 1_700_000_000,
        };
        store.insert_document(&doc).await.unwrap();

        let backend = Arc::new(HashEmbeddingBackend::new(64));
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: format!("c{}", i),
                document_id: "d1".to_string(),
                chunk_index: i as i64,
                chunk_total: texts.len() as i64,
                text: t.to_string(),
                token_count: t.split_whitespace().count() as i64,
                metadata_json: "{}".to_string(),
            })
            .collect();
        store.insert_chunks(&chunks).await.unwrap();

        for chunk in &chunks {
            let vectors = backend
                .embed_batch(&[chunk.text.clone()])
                .await
                .unwrap();
            store
                .upsert_embedding(&chunk.id, &vectors[0], "hash", 64)
                .await
                .unwrap();
        }

        let config = EmbeddingConfig {
            provider: "hash".to_string(),
            dims: 64,
            ..Default::default()
        };
        let client = EmbeddingClient::new(backend, &config);
        Retriever::new(client, store)
    }

    #[tokio::test]
    async fn test_exact_text_ranks_first() {
        let retriever = seeded_retriever(&[
            "the borrow checker enforces aliasing rules",
            "tokio provides an async runtime",
            "sqlite stores data in a single file",
        ])
        .await;

        let retrieval = retriever
            .retrieve("tokio provides an async runtime", 3, 0.0)
            .await
            .unwrap();
        assert!(!retrieval.chunks.is_empty());
        assert_eq!(retrieval.chunks[0].chunk.id, "c1");
        assert!((retrieval.chunks[0].score - 1.0).abs() < 1e-5);
        assert_eq!(retrieval.embed_attempts, 1);
    }

    #[tokio::test]
    async fn test_threshold_can_empty_results() {
        let retriever = seeded_retriever(&["alpha beta gamma"]).await;
        let retrieval = retriever
            .retrieve("completely unrelated words here", 5, 0.999)
            .await
            .unwrap();
        assert!(retrieval.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_top_k_limits_results() {
        let retriever = seeded_retriever(&["one two", "three four", "five six", "seven eight"])
            .await;
        let retrieval = retriever.retrieve("one two", 2, -1.0).await.unwrap();
        assert_eq!(retrieval.chunks.len(), 2);
    }
}
