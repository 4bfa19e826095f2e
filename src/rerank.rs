//! Stage-2 reranking through a text-generation model.
//!
//! The [`RerankingGateway`] sends a single listwise prompt covering every
//! stage-1 candidate, parses the model's JSON ranking, and blends its
//! relevance scores with the vector scores. The whole exchange runs under
//! a deadline; a timeout, transport error, or unparseable answer is an
//! error the search pipeline answers with stage-1 results.
//!
//! [`ChatCompletionGenerator`] talks to any OpenAI-compatible
//! `/v1/chat/completions` endpoint (Ollama, LM Studio, vLLM, OpenAI).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use recall_harness_core::rerank::{
    build_prompt, combine_scores, parse_response, RerankCandidate, RerankWeights, Reranked,
};
use recall_harness_core::{Result, RetrievalError};

use crate::config::RerankConfig;

/// Sampling options for one generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A text-generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
    /// Some servers put the answer here when thinking mode is enabled.
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct ChatCompletionGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionGenerator {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionGenerator {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> anyhow::Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You rank documents for a search engine. Answer only with JSON.".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut req_builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req_builder = req_builder.bearer_auth(key);
        }

        let resp = req_builder
            .send()
            .await
            .with_context(|| format!("chat completion request to {} failed", url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("chat completion error {}: {}", status, body);
        }
        let completion: ChatCompletionResponse = resp.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("chat completion returned no choices"))?;

        match (choice.message.content, choice.message.reasoning_content) {
            (Some(content), _) if !content.trim().is_empty() => Ok(content),
            (_, Some(reasoning)) => Ok(reasoning),
            (content, None) => Ok(content.unwrap_or_default()),
        }
    }
}

/// Prompt, weighting, and deadline settings of the reranker.
#[derive(Debug, Clone, Copy)]
pub struct RerankSettings {
    pub weights: RerankWeights,
    pub excerpt_chars: usize,
    pub timeout: Duration,
    pub options: GenerateOptions,
}

impl RerankSettings {
    pub fn from_config(config: &RerankConfig) -> Self {
        Self {
            weights: RerankWeights {
                vector: config.vector_weight,
                rerank: config.rerank_weight,
            },
            excerpt_chars: config.excerpt_chars,
            timeout: config.timeout(),
            options: GenerateOptions {
                max_tokens: config.max_tokens,
                temperature: 0.0,
            },
        }
    }
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self::from_config(&RerankConfig::default())
    }
}

pub struct RerankingGateway {
    generator: Arc<dyn TextGenerator>,
    settings: RerankSettings,
}

impl RerankingGateway {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: RerankSettings) -> Self {
        Self {
            generator,
            settings,
        }
    }

    /// Build from `[rerank]`; `None` when reranking is disabled.
    pub fn from_config(config: &RerankConfig) -> anyhow::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rerank.model required when rerank is enabled"))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var).map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        let generator = ChatCompletionGenerator::new(config.url.clone(), model, api_key);
        Ok(Some(Self::new(Arc::new(generator), RerankSettings::from_config(config))))
    }

    pub fn settings(&self) -> &RerankSettings {
        &self.settings
    }

    /// Re-order `candidates` by blended score, keeping at most `top_k`.
    ///
    /// Only candidates the model judged are returned. Exceeding the
    /// configured timeout or a transport failure is `ProviderUnavailable`;
    /// an answer without a usable ranking is a `Parse` error.
    pub async fn rerank(&self, query: &str, candidates: &[RerankCandidate], top_k: usize) -> Result<Vec<Reranked>> {
        if candidates.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let prompt = build_prompt(query, candidates, top_k, self.settings.excerpt_chars);

        let deadline = self.settings.timeout;
        let text = tokio::time::timeout(deadline, self.generator.generate(&prompt, self.settings.options))
            .await
            .map_err(|_| RetrievalError::unavailable(format!("rerank timed out after {:?}", deadline)))?
            .map_err(|e| RetrievalError::unavailable(format!("rerank generation failed: {:#}", e)))?;

        let judgements = parse_response(&text, candidates.len()).map_err(|e| {
            warn!(response_len = text.len(), "unparseable rerank response");
            e
        })?;
        debug!(
            candidates = candidates.len(),
            judged = judgements.len(),
            "rerank response parsed"
        );
        Ok(combine_scores(candidates, &judgements, self.settings.weights, top_k))
    }
}
