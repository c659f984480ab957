//! Document, chunk, and vector persistence over SQLite.
//!
//! [`Store`] wraps the sqlx pool with the queries the pipeline needs:
//! document lifecycle, chunk insertion, embedding upserts, cosine top-K
//! search, chunk resolution, and query history. Vectors live in their own
//! `chunk_vectors` table as little-endian f32 BLOBs so metadata scans never
//! page in vector payloads.
//!
//! Search loads every stored vector and computes cosine similarity in Rust.
//! That is linear in corpus size, which is fine at the scale this tool
//! targets; rows are scanned in rowid order and sorted with a stable sort,
//! so equal scores keep insertion order.

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::SearchError;
use crate::models::{Chunk, Document, DocumentStatus, QueryRecord, SearchHit, SourceFormat};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Documents ============

    pub async fn insert_document(&self, doc: &Document) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, body, format, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.body)
        .bind(doc.format.as_str())
        .bind(doc.status.as_str())
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, filename, body, format, status, created_at FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| row_to_document(&r)))
    }

    // ============ Chunks ============

    /// Insert all chunks of a document in one transaction.
    pub async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, chunk_total, text, token_count, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(chunk.chunk_total)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(&chunk.metadata_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn chunks_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<Chunk>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, chunk_total, text, token_count, metadata_json
            FROM chunks WHERE document_id = ? ORDER BY chunk_index
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Resolve chunk rows for a list of IDs, preserving the input order.
    pub async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>, sqlx::Error> {
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(
                r#"
                SELECT id, document_id, chunk_index, chunk_total, text, token_count, metadata_json
                FROM chunks WHERE id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(r) = row {
                chunks.push(row_to_chunk(&r));
            }
        }
        Ok(chunks)
    }

    /// Chunks that have no current embedding, oldest documents first.
    pub async fn chunks_missing_embeddings(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<Chunk>, sqlx::Error> {
        let sql = r#"
            SELECT c.id, c.document_id, c.chunk_index, c.chunk_total, c.text, c.token_count, c.metadata_json
            FROM chunks c
            LEFT JOIN embeddings e ON e.chunk_id = c.id
            JOIN documents d ON d.id = c.document_id
            WHERE e.chunk_id IS NULL
            ORDER BY d.created_at, c.document_id, c.chunk_index
            LIMIT ?
        "#;
        let rows = sqlx::query(sql)
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Every chunk in the store, for full re-embedding.
    pub async fn all_chunks(&self) -> Result<Vec<Chunk>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, chunk_total, text, token_count, metadata_json
            FROM chunks ORDER BY document_id, chunk_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// True when every chunk of the document has an embedding.
    pub async fn document_fully_embedded(
        &self,
        document_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let missing: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            LEFT JOIN embeddings e ON e.chunk_id = c.id
            WHERE c.document_id = ? AND e.chunk_id IS NULL
            "#,
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(missing == 0)
    }

    // ============ Embeddings ============

    /// Upsert the current embedding for a chunk. Replaces any prior vector
    /// and refreshes `created_at`.
    pub async fn upsert_embedding(
        &self,
        chunk_id: &str,
        vector: &[f32],
        model: &str,
        dims: usize,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, model, dims, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                created_at = excluded.created_at
            "#,
        )
        .bind(chunk_id)
        .bind(model)
        .bind(dims as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, vector)
            VALUES (?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET vector = excluded.vector
            "#,
        )
        .bind(chunk_id)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Cosine top-K over all stored vectors.
    ///
    /// Scores below `threshold` are excluded. Descending score order with
    /// ties broken by insertion order (rowid scan + stable sort).
    pub async fn search(
        &self,
        query_vec: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if top_k == 0 {
            return Err(SearchError::BadRequest("top_k must be >= 1".to_string()));
        }
        if query_vec.is_empty() {
            return Err(SearchError::BadRequest(
                "query vector is empty".to_string(),
            ));
        }

        let rows = sqlx::query(
            "SELECT chunk_id, vector FROM chunk_vectors ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SearchError::Unavailable(e.to_string()))?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let vec = blob_to_vec(&blob);
                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    score: cosine_similarity(query_vec, &vec),
                }
            })
            .filter(|hit| hit.score >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);

        Ok(hits)
    }

    // ============ Query history ============

    pub async fn insert_query_record(&self, record: &QueryRecord) -> Result<(), sqlx::Error> {
        let retrieved_json =
            serde_json::to_string(&record.retrieved).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO query_history
                (id, query_text, retrieved_json, answer_text, state, duration_ms,
                 cost_estimate, error_detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.query_text)
        .bind(retrieved_json)
        .bind(&record.answer_text)
        .bind(record.state.as_str())
        .bind(record.duration_ms)
        .bind(record.cost_estimate)
        .bind(&record.error_detail)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Stats ============

    pub async fn count(&self, table: &str) -> Result<i64, sqlx::Error> {
        // Table names come from a fixed internal list, never user input
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        sqlx::query_scalar(&sql).fetch_one(&self.pool).await
    }

    pub async fn document_status_counts(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM documents GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
            .collect())
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let format: String = row.get("format");
    let status: String = row.get("status");
    Document {
        id: row.get("id"),
        filename: row.get("filename"),
        body: row.get("body"),
        format: SourceFormat::parse(&format).unwrap_or(SourceFormat::Txt),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Pending),
        created_at: row.get("created_at"),
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        chunk_total: row.get("chunk_total"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        metadata_json: row.get("metadata_json"),
    }
}
