//! Embedding backends and the fallback gateway.
//!
//! Defines the [`EmbeddingBackend`] trait and concrete implementations:
//! - **[`OpenAIBackend`]** calls an OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`OllamaBackend`]** calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`HashedBackend`]** deterministic feature-hashing embedder; always
//!   available, no network, lowest quality.
//! - **`LocalBackend`** runs models in-process via fastembed (feature
//!   `local-embeddings-fastembed`).
//!
//! Backends are listed in priority order in `[[embedding.providers]]`; the
//! [`EmbeddingGateway`](gateway::EmbeddingGateway) picks the first healthy
//! one and falls back down the list.
//!
//! # Retry Strategy
//!
//! The HTTP backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: `base`, `2 × base`, `4 × base`, … (capped at `32 × base`)

pub mod gateway;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use recall_harness_core::embedding::normalize;
use recall_harness_core::search::tokenize;

use crate::config::{EmbeddingConfig, ProviderConfig};

pub use gateway::{Compatibility, EmbeddingGateway, GatewayPolicy};

/// A source of embedding vectors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Provider kind (`"openai"`, `"ollama"`, `"hashed"`, `"local"`).
    fn name(&self) -> &str;

    /// Model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Declared vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Retry settings shared by the HTTP backends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.backoff_ms),
            timeout: config.timeout(),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// POST `body` to `url`, retrying rate limits, server errors, and network
/// failures. Returns the parsed JSON body of the first success.
async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    retry: RetryPolicy,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            let delay = retry.delay(attempt);
            tracing::debug!(backend = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

fn json_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", what))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow::anyhow!("Invalid {} response: non-numeric component", what))
        })
        .collect()
}

// ============ OpenAI Backend ============

pub struct OpenAIBackend {
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OpenAIBackend {
    pub fn new(provider: &ProviderConfig, retry: RetryPolicy) -> Result<Self> {
        let model = provider
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model required for openai provider"))?;
        let dims = provider
            .dims
            .ok_or_else(|| anyhow::anyhow!("dims required for openai provider"))?;
        let key_var = provider.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(key_var)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", key_var))?;
        let base = provider
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            dims,
            endpoint: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            client: reqwest::Client::builder().timeout(retry.timeout).build()?,
            retry,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAIBackend {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json_with_retry(
            &self.client,
            &self.endpoint,
            Some(&self.api_key),
            &body,
            self.retry,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, json_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Backend ============

pub struct OllamaBackend {
    model: String,
    dims: usize,
    endpoint: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OllamaBackend {
    pub fn new(provider: &ProviderConfig, retry: RetryPolicy) -> Result<Self> {
        let model = provider
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model required for ollama provider"))?;
        let dims = provider
            .dims
            .ok_or_else(|| anyhow::anyhow!("dims required for ollama provider"))?;
        let base = provider
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            endpoint: format!("{}/api/embed", base.trim_end_matches('/')),
            client: reqwest::Client::builder().timeout(retry.timeout).build()?,
            retry,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json =
            post_json_with_retry(&self.client, &self.endpoint, None, &body, self.retry, "Ollama")
                .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings.iter().map(|e| json_vector(e, "Ollama")).collect()
}

// ============ Hashed Backend ============

/// Feature-hashing embedder over unigrams and adjacent bigrams.
///
/// Each token is hashed with SHA-256 into a signed bucket; the result is
/// L2-normalized. Texts sharing vocabulary get high cosine similarity.
pub struct HashedBackend {
    dims: usize,
    model: String,
}

impl HashedBackend {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("hashed-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return v;
        }
        let tokens = tokenize(text);
        let bigrams = tokens.windows(2).map(|w| format!("{} {}", w[0], w[1]));
        let features = tokens.iter().cloned().map(|t| (t, 1.0f32)).chain(bigrams.map(|b| (b, 0.5)));

        for (feature, weight) in features {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign * weight;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingBackend for HashedBackend {
    fn name(&self) -> &str {
        "hashed"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Local Backend (fastembed) ============

/// In-process embeddings via fastembed. The model is downloaded from
/// Hugging Face on first use and cached; afterwards no network is needed.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalBackend {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalBackend {
    pub fn new(provider: &ProviderConfig, batch_size: usize) -> Result<Self> {
        let model_name = provider
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        config_to_fastembed_model(&model_name)?;
        let dims = provider.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let model_name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = model.lock().map_err(|_| anyhow::anyhow!("local model lock poisoned"))?;
            if guard.is_none() {
                let options = fastembed::InitOptions::new(config_to_fastembed_model(&model_name)?)
                    .with_show_download_progress(false);
                let loaded = fastembed::TextEmbedding::try_new(options)
                    .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(loaded);
            }
            let embedder = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local model not loaded"))?;
            embedder
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Instantiate one backend from its provider entry.
///
/// | Kind | Backend |
/// |------|---------|
/// | `"openai"` | [`OpenAIBackend`] |
/// | `"ollama"` | [`OllamaBackend`] |
/// | `"hashed"` | [`HashedBackend`] |
/// | `"local"` | `LocalBackend` (feature `local-embeddings-fastembed`) |
pub fn create_backend(
    provider: &ProviderConfig,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingBackend>> {
    let retry = RetryPolicy::from_config(config);
    match provider.kind.as_str() {
        "openai" => Ok(Arc::new(OpenAIBackend::new(provider, retry)?)),
        "ollama" => Ok(Arc::new(OllamaBackend::new(provider, retry)?)),
        "hashed" => Ok(Arc::new(HashedBackend::new(provider.dims.unwrap_or(384)))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalBackend::new(provider, config.batch_size)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Instantiate every configured backend, in priority order.
///
/// Entries that cannot be constructed (missing API key, missing feature)
/// are skipped with a warning; an empty result is an error.
pub fn create_backends(config: &EmbeddingConfig) -> Result<Vec<Arc<dyn EmbeddingBackend>>> {
    let mut backends = Vec::new();
    for provider in &config.providers {
        match create_backend(provider, config) {
            Ok(b) => backends.push(b),
            Err(e) => tracing::warn!(kind = %provider.kind, "skipping embedding provider: {:#}", e),
        }
    }
    if backends.is_empty() {
        bail!("no embedding provider could be constructed");
    }
    Ok(backends)
}
