//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/recall.sqlite"
//!
//! [[embedding.providers]]
//! kind = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [[embedding.providers]]
//! kind = "hashed"
//! dims = 384
//!
//! [rerank]
//! enabled = true
//! url = "http://localhost:11434"
//! model = "qwen2.5:7b"
//!
//! [watcher]
//! roots = ["./docs"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use recall_harness_core::search::SearchMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Index backend, selected once at construction.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Memory,
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

fn default_compaction_threshold() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

/// One embedding backend entry; entries are tried in listed order.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// `openai`, `ollama`, `hashed`, or `local`.
    pub kind: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key (openai).
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// After a probe finds no backend, calls fail fast for this long.
    #[serde(default = "default_probe_cooldown_ms")]
    pub probe_cooldown_ms: u64,
    /// Clear the index and re-embed when the model dimension changes.
    #[serde(default)]
    pub auto_rebuild_on_model_change: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            probe_attempts: default_probe_attempts(),
            backoff_ms: default_backoff_ms(),
            probe_cooldown_ms: default_probe_cooldown_ms(),
            auto_rebuild_on_model_change: false,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig {
        kind: "hashed".to_string(),
        model: None,
        dims: Some(384),
        url: None,
        api_key_env: None,
    }]
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_probe_attempts() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_probe_cooldown_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub score_threshold: Option<f32>,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,
    /// Whole-query deadline (embedding + retrieval + rerank).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Limit on embedding the query; past it the query uses keyword
    /// scoring. Must be shorter than `query_timeout_ms`.
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            mode: SearchMode::default(),
            score_threshold: None,
            hybrid_alpha: default_hybrid_alpha(),
            query_timeout_ms: default_query_timeout_ms(),
            embed_timeout_ms: default_embed_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }
}

fn default_top_k() -> usize {
    10
}
fn default_hybrid_alpha() -> f32 {
    0.6
}
fn default_query_timeout_ms() -> u64 {
    60_000
}
fn default_embed_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible chat completions server.
    #[serde(default = "default_rerank_url")]
    pub url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_rerank_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_rerank_weight")]
    pub rerank_weight: f32,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_candidate_floor")]
    pub candidate_floor: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    #[serde(default = "default_rerank_max_tokens")]
    pub max_tokens: u32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_rerank_url(),
            model: None,
            api_key_env: None,
            timeout_ms: default_rerank_timeout_ms(),
            vector_weight: default_vector_weight(),
            rerank_weight: default_rerank_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            candidate_floor: default_candidate_floor(),
            excerpt_chars: default_excerpt_chars(),
            max_tokens: default_rerank_max_tokens(),
        }
    }
}

impl RerankConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_rerank_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_rerank_timeout_ms() -> u64 {
    15_000
}
fn default_vector_weight() -> f32 {
    0.3
}
fn default_rerank_weight() -> f32 {
    0.7
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_candidate_floor() -> usize {
    20
}
fn default_excerpt_chars() -> usize {
    500
}
fn default_rerank_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsistencyConfig {
    /// Apply corrective sync when a scheduled check finds drift.
    #[serde(default = "default_true")]
    pub auto_fix: bool,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default = "default_min_sync_interval_secs")]
    pub min_sync_interval_secs: u64,
    #[serde(default = "default_light_check_interval_secs")]
    pub light_check_interval_secs: u64,
    #[serde(default = "default_deep_scan_interval_secs")]
    pub deep_scan_interval_secs: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            auto_fix: true,
            error_threshold: default_error_threshold(),
            error_window_secs: default_error_window_secs(),
            min_sync_interval_secs: default_min_sync_interval_secs(),
            light_check_interval_secs: default_light_check_interval_secs(),
            deep_scan_interval_secs: default_deep_scan_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_error_threshold() -> usize {
    5
}
fn default_error_window_secs() -> u64 {
    300
}
fn default_min_sync_interval_secs() -> u64 {
    600
}
fn default_light_check_interval_secs() -> u64 {
    300
}
fn default_deep_scan_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_scan_secs")]
    pub max_scan_secs: u64,
    /// Ceiling on distinct paths awaiting debounce.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_true")]
    pub follow_symlinks: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            debounce_ms: default_debounce_ms(),
            max_depth: default_max_depth(),
            max_scan_secs: default_max_scan_secs(),
            max_pending: default_max_pending(),
            channel_capacity: default_channel_capacity(),
            follow_symlinks: true,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_max_depth() -> usize {
    32
}
fn default_max_scan_secs() -> u64 {
    120
}
fn default_max_pending() -> usize {
    10_000
}
fn default_channel_capacity() -> usize {
    1024
}

impl Config {
    /// A config with every section defaulted, persisting to `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            index: IndexConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            consistency: ConsistencyConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }

    /// Directory holding the database; never watched as input.
    pub fn storage_dir(&self) -> Option<&Path> {
        self.db.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if !(0.0..1.0).contains(&self.index.compaction_threshold) {
            bail!("index.compaction_threshold must be in [0.0, 1.0)");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
        }
        if self.retrieval.embed_timeout_ms == 0
            || self.retrieval.embed_timeout_ms >= self.retrieval.query_timeout_ms
        {
            bail!("retrieval.embed_timeout_ms must be > 0 and below retrieval.query_timeout_ms");
        }
        if self.embedding.providers.is_empty() {
            bail!("embedding.providers must list at least one provider");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        for p in &self.embedding.providers {
            match p.kind.as_str() {
                "openai" | "ollama" => {
                    if p.model.is_none() {
                        bail!("embedding provider '{}' requires a model", p.kind);
                    }
                    if p.dims.unwrap_or(0) == 0 {
                        bail!("embedding provider '{}' requires dims > 0", p.kind);
                    }
                }
                "hashed" | "local" => {
                    if p.dims == Some(0) {
                        bail!("embedding provider '{}' dims must be > 0", p.kind);
                    }
                }
                other => bail!(
                    "Unknown embedding provider: '{}'. Must be openai, ollama, hashed, or local.",
                    other
                ),
            }
        }
        if self.rerank.enabled {
            if self.rerank.model.is_none() {
                bail!("rerank.model must be specified when rerank is enabled");
            }
            let sum = self.rerank.vector_weight + self.rerank.rerank_weight;
            if self.rerank.vector_weight < 0.0 || self.rerank.rerank_weight < 0.0 || sum <= 0.0 {
                bail!("rerank weights must be non-negative and not both zero");
            }
            if self.rerank.candidate_multiplier == 0 {
                bail!("rerank.candidate_multiplier must be >= 1");
            }
            if self.rerank.timeout_ms + self.retrieval.embed_timeout_ms >= self.retrieval.query_timeout_ms {
                bail!("rerank.timeout_ms plus retrieval.embed_timeout_ms must be below retrieval.query_timeout_ms");
            }
        }
        if self.consistency.error_threshold == 0 {
            bail!("consistency.error_threshold must be >= 1");
        }
        if self.watcher.debounce_ms == 0 || self.watcher.max_pending == 0 {
            bail!("watcher.debounce_ms and watcher.max_pending must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
