//! Embedding backends and the batching/retry client.
//!
//! [`EmbeddingBackend`] is the low-level contract: a batch of texts in, one
//! fixed-dimension vector per text out, same order. Two implementations:
//!
//! - **[`OpenAiEmbeddingBackend`]**: calls an OpenAI-compatible
//!   `POST /embeddings` endpoint. HTTP 429 and 5xx are transient; other 4xx
//!   are permanent.
//! - **[`HashEmbeddingBackend`]**: deterministic offline vectors derived
//!   from SHA-256 of the input tokens, L2-normalized. Identical text always
//!   maps to the identical vector, which makes exact-text retrieval score
//!   1.0. Used for tests and air-gapped demos.
//!
//! [`EmbeddingClient`] layers the pipeline-facing contract on top: per-text
//! token-limit truncation (deterministic, reported, never silent), batching
//! that preserves input order, and retry with exponential backoff for
//! transient failures. A batch that exhausts its retries fails item-by-item
//! while earlier batches remain intact.
//!
//! Also provides vector utilities shared with the store:
//! [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::chunker::tokenize;
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;
use crate::retry::{run_with_retry, ErrorClass, RetryPolicy};

/// Low-level embedding backend contract.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;
    /// Fixed vector dimensionality for this model.
    fn dims(&self) -> usize;
    /// Embed one batch; result length and order must match the input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// One embedded text with its truncation report.
#[derive(Debug, Clone)]
pub struct EmbeddedText {
    pub vector: Vec<f32>,
    /// Token count actually embedded (post-truncation).
    pub token_count: usize,
    /// True when the input exceeded the model token limit and was cut.
    pub truncated: bool,
}

fn classify(e: &EmbeddingError) -> ErrorClass {
    match e {
        EmbeddingError::Transient(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Pipeline-facing embedding client: truncation + batching + retry.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    max_input_tokens: usize,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
        Self {
            backend,
            batch_size: config.batch_size,
            max_input_tokens: config.max_input_tokens,
            retry: RetryPolicy::new(config.max_attempts, config.base_delay_ms),
        }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    /// Deterministically truncate `text` to the model token limit.
    fn prepare(&self, text: &str) -> (String, usize, bool) {
        let tokens = tokenize(text);
        if tokens.len() <= self.max_input_tokens {
            (text.to_string(), tokens.len(), false)
        } else {
            let cut = &tokens[..self.max_input_tokens];
            (cut.join(" "), cut.len(), true)
        }
    }

    /// Embed `texts`, returning one result per input in input order, plus the
    /// highest attempt count spent on any batch (for telemetry).
    ///
    /// Batches are independent: a batch that fails after retries reports its
    /// items as errors without disturbing results from other batches.
    pub async fn embed(
        &self,
        texts: &[String],
    ) -> (Vec<Result<EmbeddedText, EmbeddingError>>, u32) {
        let mut results: Vec<Result<EmbeddedText, EmbeddingError>> =
            Vec::with_capacity(texts.len());
        let mut max_attempts_used = 0u32;

        let prepared: Vec<(String, usize, bool)> =
            texts.iter().map(|t| self.prepare(t)).collect();

        for batch in prepared.chunks(self.batch_size.max(1)) {
            let batch_texts: Vec<String> = batch.iter().map(|(t, _, _)| t.clone()).collect();

            let outcome = run_with_retry(&self.retry, classify, || {
                let backend = Arc::clone(&self.backend);
                let batch_texts = batch_texts.clone();
                async move { backend.embed_batch(&batch_texts).await }
            })
            .await;

            match outcome {
                Ok(attempted) => {
                    max_attempts_used = max_attempts_used.max(attempted.attempts);
                    let vectors = attempted.value;
                    if vectors.len() != batch.len() {
                        let err = EmbeddingError::InvalidResponse(format!(
                            "expected {} vectors, got {}",
                            batch.len(),
                            vectors.len()
                        ));
                        results.extend(batch.iter().map(|_| Err(err.clone())));
                        continue;
                    }
                    for ((_, token_count, truncated), vector) in batch.iter().zip(vectors) {
                        if vector.len() != self.backend.dims() {
                            results.push(Err(EmbeddingError::InvalidResponse(format!(
                                "expected {} dims, got {}",
                                self.backend.dims(),
                                vector.len()
                            ))));
                        } else {
                            results.push(Ok(EmbeddedText {
                                vector,
                                token_count: *token_count,
                                truncated: *truncated,
                            }));
                        }
                    }
                }
                Err((last, attempts)) => {
                    max_attempts_used = max_attempts_used.max(attempts);
                    let err = match last {
                        EmbeddingError::Transient(detail) => EmbeddingError::Exhausted {
                            attempts,
                            last_error: detail,
                        },
                        other => other,
                    };
                    results.extend(batch.iter().map(|_| Err(err.clone())));
                }
            }
        }

        (results, max_attempts_used)
    }

    /// Embed a single text (query-time convenience).
    pub async fn embed_one(
        &self,
        text: &str,
    ) -> Result<(EmbeddedText, u32), EmbeddingError> {
        let (mut results, attempts) = self.embed(&[text.to_string()]).await;
        match results.pop() {
            Some(Ok(embedded)) => Ok((embedded, attempts)),
            Some(Err(e)) => Err(e),
            None => Err(EmbeddingError::InvalidResponse(
                "empty embedding result".to_string(),
            )),
        }
    }
}

// ============ OpenAI-compatible backend ============

/// Embedding backend for OpenAI-compatible `POST /embeddings` endpoints.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbeddingBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbeddingBackend {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            EmbeddingError::Permanent("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Permanent(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddingBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Timeouts and connection errors are worth retrying
                EmbeddingError::Transient(e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(EmbeddingError::Transient(format!(
                    "embedding API error {}: {}",
                    status, detail
                )));
            }
            return Err(EmbeddingError::Permanent(format!(
                "embedding API error {}: {}",
                status, detail
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        parse_embeddings_response(&json)
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding".to_string()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Deterministic hash backend ============

/// Offline embedding backend: token hashes folded into a normalized vector.
///
/// Not semantically meaningful, but deterministic and dimension-stable, so
/// exact text matches score cosine 1.0 and the full pipeline can run without
/// network access.
pub struct HashEmbeddingBackend {
    dims: usize,
}

impl HashEmbeddingBackend {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let token_lower = token.to_ascii_lowercase();
            // One 32-byte digest block per 32 output dims
            for block in 0..self.dims.div_ceil(32) {
                let mut hasher = Sha256::new();
                hasher.update(token_lower.as_bytes());
                hasher.update((block as u32).to_le_bytes());
                let digest = hasher.finalize();
                for (i, byte) in digest.iter().enumerate() {
                    let dim = block * 32 + i;
                    if dim >= self.dims {
                        break;
                    }
                    v[dim] += (*byte as f32 - 127.5) / 127.5;
                }
            }
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbeddingBackend {
    fn model(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Instantiate the backend named in the configuration.
pub fn create_backend(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingBackend>, EmbeddingError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbeddingBackend::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbeddingBackend::new(config.dims))),
        other => Err(EmbeddingError::Permanent(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(batch_size: usize, max_input_tokens: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            model: "hash".to_string(),
            dims: 64,
            batch_size,
            max_input_tokens,
            concurrency: 2,
            max_attempts: 3,
            base_delay_ms: 1,
            timeout_secs: 5,
            base_url: None,
        }
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_backend_dims_and_determinism() {
        let backend = HashEmbeddingBackend::new(128);
        let a = backend
            .embed_batch(&["the quick brown fox".to_string()])
            .await
            .unwrap();
        let b = backend
            .embed_batch(&["the quick brown fox".to_string()])
            .await
            .unwrap();
        assert_eq!(a[0].len(), 128);
        assert_eq!(a, b);
        assert!((cosine_similarity(&a[0], &b[0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_hash_backend_distinct_texts_differ() {
        let backend = HashEmbeddingBackend::new(64);
        let vs = backend
            .embed_batch(&["alpha beta".to_string(), "gamma delta".to_string()])
            .await
            .unwrap();
        assert!(cosine_similarity(&vs[0], &vs[1]) < 0.99);
    }

    #[tokio::test]
    async fn test_client_preserves_order_across_batches() {
        let config = test_config(2, 1000);
        let client = EmbeddingClient::new(Arc::new(HashEmbeddingBackend::new(64)), &config);
        let texts: Vec<String> = (0..5).map(|i| format!("text number {}", i)).collect();

        let (results, _) = client.embed(&texts).await;
        assert_eq!(results.len(), 5);

        // Each result must equal the single-text embedding of the same input
        for (text, result) in texts.iter().zip(&results) {
            let (single, _) = client.embed_one(text).await.map(|(e, a)| (e, a)).unwrap();
            assert_eq!(result.as_ref().unwrap().vector, single.vector);
        }
    }

    #[tokio::test]
    async fn test_truncation_reported_not_silent() {
        let config = test_config(8, 4);
        let client = EmbeddingClient::new(Arc::new(HashEmbeddingBackend::new(64)), &config);

        let (embedded, _) = client
            .embed_one("one two three four five six seven")
            .await
            .unwrap();
        assert!(embedded.truncated);
        assert_eq!(embedded.token_count, 4);

        let (short, _) = client.embed_one("one two").await.unwrap();
        assert!(!short.truncated);
        assert_eq!(short.token_count, 2);
    }

    struct FlakyBackend {
        calls: AtomicU32,
        fail_first: u32,
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingBackend for FlakyBackend {
        fn model(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(EmbeddingError::Transient("simulated timeout".to_string()))
            } else {
                Ok(texts.iter().map(|_| vec![0.5; self.dims]).collect())
            }
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried_then_succeed() {
        let mut config = test_config(8, 1000);
        config.dims = 8;
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: 2,
            dims: 8,
        });
        let client = EmbeddingClient::new(backend, &config);

        let (embedded, attempts) = client.embed_one("hello").await.unwrap();
        assert_eq!(embedded.vector.len(), 8);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_reported_per_item() {
        let mut config = test_config(2, 1000);
        config.dims = 8;
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            dims: 8,
        });
        let client = EmbeddingClient::new(backend, &config);

        let texts: Vec<String> = (0..3).map(|i| format!("t{}", i)).collect();
        let (results, attempts) = client.embed(&texts).await;
        assert_eq!(results.len(), 3);
        assert_eq!(attempts, 3);
        for r in &results {
            match r {
                Err(EmbeddingError::Exhausted { attempts, .. }) => assert_eq!(*attempts, 3),
                other => panic!("expected Exhausted, got {:?}", other),
            }
        }
    }

    struct PermanentFailBackend;

    #[async_trait]
    impl EmbeddingBackend for PermanentFailBackend {
        fn model(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Permanent("invalid api key".to_string()))
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let mut config = test_config(8, 1000);
        config.dims = 8;
        let client = EmbeddingClient::new(Arc::new(PermanentFailBackend), &config);

        let err = client.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Permanent(_)));
    }
}
