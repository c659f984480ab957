//! Completion backends and the retrying client.
//!
//! Mirrors the embedding layer: [`CompletionBackend`] is the low-level
//! contract, [`CompletionClient`] adds retry and token accounting.
//!
//! - **[`OpenAiCompletionBackend`]**: `POST /chat/completions` against an
//!   OpenAI-compatible endpoint; answer read from
//!   `choices[0].message.content`.
//! - **[`ExtractiveBackend`]**: deterministic offline backend that answers
//!   by extracting the context blocks from the prompt. Used for tests and
//!   air-gapped demos.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::chunker::token_count;
use crate::config::CompletionConfig;
use crate::error::CompletionError;
use crate::retry::{run_with_retry, ErrorClass, RetryPolicy};

/// Generation options. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// Result of one completion call, with rough token counts for cost tracking.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub text: String,
    /// Estimated prompt tokens (whitespace count, not a model tokenizer).
    pub input_tokens: usize,
    /// Estimated answer tokens.
    pub output_tokens: usize,
    pub attempts: u32,
}

/// Low-level completion backend contract.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn model(&self) -> &str;
    async fn complete(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        top_p: f32,
    ) -> Result<String, CompletionError>;
}

fn classify(e: &CompletionError) -> ErrorClass {
    match e {
        CompletionError::Transient(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Pipeline-facing completion client with retry and defaults.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    defaults: CompletionConfig,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &CompletionConfig) -> Self {
        Self {
            backend,
            defaults: config.clone(),
            retry: RetryPolicy::new(config.max_attempts, config.base_delay_ms),
        }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub async fn complete(
        &self,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<CompletionOutcome, CompletionError> {
        let temperature = options.temperature.unwrap_or(self.defaults.temperature);
        let max_tokens = options.max_tokens.unwrap_or(self.defaults.max_tokens);
        let top_p = options.top_p.unwrap_or(self.defaults.top_p);

        if !(0.0..=1.0).contains(&temperature) {
            return Err(CompletionError::Permanent(format!(
                "temperature {} out of range [0.0, 1.0]",
                temperature
            )));
        }
        if max_tokens == 0 {
            return Err(CompletionError::Permanent(
                "max_tokens must be > 0".to_string(),
            ));
        }

        let outcome = run_with_retry(&self.retry, classify, || {
            let backend = Arc::clone(&self.backend);
            let prompt = prompt.to_string();
            async move {
                backend
                    .complete(&prompt, temperature, max_tokens, top_p)
                    .await
            }
        })
        .await;

        match outcome {
            Ok(attempted) => Ok(CompletionOutcome {
                input_tokens: token_count(prompt),
                output_tokens: token_count(&attempted.value),
                text: attempted.value,
                attempts: attempted.attempts,
            }),
            Err((CompletionError::Transient(detail), attempts)) => {
                Err(CompletionError::Exhausted {
                    attempts,
                    last_error: detail,
                })
            }
            Err((other, _)) => Err(other),
        }
    }
}

// ============ OpenAI-compatible backend ============

/// Completion backend for OpenAI-compatible `POST /chat/completions`.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiCompletionBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompletionBackend {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            CompletionError::Permanent("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CompletionError::Permanent(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletionBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
        top_p: f32,
    ) -> Result<String, CompletionError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
            "top_p": top_p,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CompletionError::Transient(format!(
                    "completion API error {}: {}",
                    status, detail
                )));
            }
            return Err(CompletionError::Permanent(format!(
                "completion API error {}: {}",
                status, detail
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                CompletionError::InvalidResponse(
                    "missing choices[0].message.content".to_string(),
                )
            })
    }
}

// ============ Deterministic extractive backend ============

/// Offline completion backend: answers by echoing the context blocks found in
/// the prompt, or the question itself when no context is present.
///
/// Deterministic, so the full query pipeline can be exercised without network
/// access.
pub struct ExtractiveBackend;

#[async_trait]
impl CompletionBackend for ExtractiveBackend {
    fn model(&self) -> &str {
        "extractive"
    }

    async fn complete(
        &self,
        prompt: &str,
        _temperature: f32,
        max_tokens: u32,
        _top_p: f32,
    ) -> Result<String, CompletionError> {
        // Context blocks are introduced by "[Source N]" lines in the prompt
        // template; collect their first sentences as the answer.
        let mut extracted: Vec<&str> = Vec::new();
        let mut in_block = false;
        for line in prompt.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("[Source ") {
                in_block = true;
                continue;
            }
            if in_block {
                if trimmed.is_empty() {
                    in_block = false;
                } else {
                    extracted.push(trimmed);
                }
            }
        }

        let answer = if extracted.is_empty() {
            let question = prompt
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .trim();
            format!("No supporting context was found for: {}", question)
        } else {
            format!("Based on the provided context: {}", extracted.join(" "))
        };

        // Honor max_tokens as a whitespace-token cap
        let tokens: Vec<&str> = answer.split_whitespace().collect();
        if tokens.len() > max_tokens as usize {
            Ok(tokens[..max_tokens as usize].join(" "))
        } else {
            Ok(answer)
        }
    }
}

/// Instantiate the backend named in the configuration.
pub fn create_backend(
    config: &CompletionConfig,
) -> Result<Arc<dyn CompletionBackend>, CompletionError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompletionBackend::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveBackend)),
        other => Err(CompletionError::Permanent(format!(
            "unknown completion provider: {}",
            other
        ))),
    }
}
