use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration. Every recognized option is enumerated below with
/// a default; unknown keys are rejected at load time.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: default_chunk_size(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    400
}
fn default_overlap() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// `openai` or `hash` (deterministic offline backend).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Maximum texts per backend call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Texts longer than this are deterministically truncated, never dropped.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    /// Concurrent in-flight batches during backlog embedding.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Override the API base URL (e.g. for a proxy or local server).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_input_tokens: default_max_input_tokens(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
            base_url: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_batch_size() -> usize {
    64
}
fn default_max_input_tokens() -> usize {
    8192
}
fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CompletionConfig {
    /// `openai` or `extractive` (deterministic offline backend).
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    /// Sampling randomness, 0.0–1.0.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Caps output length.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Nucleus-sampling cutoff.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: default_completion_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            timeout_secs: default_completion_timeout_secs(),
            base_url: None,
        }
    }
}

fn default_completion_provider() -> String {
    "openai".to_string()
}
fn default_completion_model() -> String {
    "mistral-large".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_top_p() -> f32 {
    0.9
}
fn default_completion_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Hits scoring below this cosine similarity are excluded.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Token budget for the assembled context.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.25
}
fn default_max_context_tokens() -> usize {
    1800
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Buffered events before an automatic flush.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum seconds between flushes.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_buffer_size() -> usize {
    50
}
fn default_flush_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.markdown".to_string(),
        "**/*.txt".to_string(),
    ]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size_tokens == 0 {
        anyhow::bail!("chunking.chunk_size_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.chunk_size_tokens {
        anyhow::bail!(
            "chunking.overlap_tokens ({}) must be < chunk_size_tokens ({})",
            config.chunking.overlap_tokens,
            config.chunking.chunk_size_tokens
        );
    }

    match config.embedding.provider.as_str() {
        "openai" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or hash.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }
    if config.embedding.max_attempts == 0 {
        anyhow::bail!("embedding.max_attempts must be > 0");
    }

    match config.completion.provider.as_str() {
        "openai" | "extractive" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be openai or extractive.",
            other
        ),
    }
    if !(0.0..=1.0).contains(&config.completion.temperature) {
        anyhow::bail!("completion.temperature must be in [0.0, 1.0]");
    }
    if config.completion.max_tokens == 0 {
        anyhow::bail!("completion.max_tokens must be > 0");
    }
    if !(0.0..=1.0).contains(&config.completion.top_p) {
        anyhow::bail!("completion.top_p must be in [0.0, 1.0]");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }
    if config.retrieval.max_context_tokens == 0 {
        anyhow::bail!("retrieval.max_context_tokens must be > 0");
    }

    if config.telemetry.buffer_size == 0 {
        anyhow::bail!("telemetry.buffer_size must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse("[db]\npath = \"data/ragline.sqlite\"\n").unwrap();
        assert_eq!(cfg.chunking.chunk_size_tokens, 400);
        assert_eq!(cfg.chunking.overlap_tokens, 40);
        assert_eq!(cfg.embedding.dims, 768);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert!((cfg.completion.temperature - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse("[db]\npath = \"x.sqlite\"\n\n[chunking]\nchunk_tokens = 100\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let err = parse("[db]\npath = \"x.sqlite\"\n\n[dashboard]\nport = 8501\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_overlap_must_be_less_than_chunk_size() {
        let err = parse(
            "[db]\npath = \"x.sqlite\"\n\n[chunking]\nchunk_size_tokens = 10\noverlap_tokens = 10\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[db]\npath = \"x.sqlite\"\n\n[embedding]\nprovider = \"cortex\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_temperature_range_enforced() {
        let err = parse("[db]\npath = \"x.sqlite\"\n\n[completion]\ntemperature = 1.5\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_threshold_range_enforced() {
        let err = parse("[db]\npath = \"x.sqlite\"\n\n[retrieval]\nsimilarity_threshold = 1.2\n");
        assert!(err.is_err());
    }
}
