//! Embedding gateway: provider selection with fallback.
//!
//! The gateway probes backends in priority order and routes every call to
//! the first healthy one. When the active backend fails, the gateway
//! re-probes from the top of the list and retries once with whichever
//! backend answers. If nothing answers, calls fail with
//! [`RetrievalError::ProviderUnavailable`]. Calls made within
//! `probe_cooldown` of an unsuccessful probe fail immediately; the first
//! call after the cooldown probes again.
//!
//! A failover restarts the whole request on the new backend so vectors in
//! one response never come from two different models.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use recall_harness_core::models::ModelInfo;
use recall_harness_core::{Result, RetrievalError};

use super::EmbeddingBackend;
use crate::config::EmbeddingConfig;

/// Probing, batching, and timeout behaviour of the gateway.
#[derive(Debug, Clone, Copy)]
pub struct GatewayPolicy {
    /// Attempts per backend while probing.
    pub probe_attempts: u32,
    /// Delay before the second and later probe attempts (doubles).
    pub probe_backoff: Duration,
    /// Upper bound on any single backend call.
    pub call_timeout: Duration,
    /// How long after an unsuccessful probe calls fail without probing.
    pub probe_cooldown: Duration,
    pub batch_size: usize,
    pub auto_rebuild_on_model_change: bool,
}

impl GatewayPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            probe_attempts: config.probe_attempts.max(1),
            probe_backoff: Duration::from_millis(config.backoff_ms),
            // Backends retry internally; leave room for their attempts.
            call_timeout: config.timeout() * (config.max_retries + 1),
            probe_cooldown: Duration::from_millis(config.probe_cooldown_ms),
            batch_size: config.batch_size.max(1),
            auto_rebuild_on_model_change: config.auto_rebuild_on_model_change,
        }
    }
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

/// Whether index contents can be searched with the active model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    DimensionChanged { index: usize, model: usize },
}

pub struct EmbeddingGateway {
    backends: Vec<Arc<dyn EmbeddingBackend>>,
    active: RwLock<Option<usize>>,
    /// Set when a probe starts, refreshed when it finds nothing, cleared
    /// when it succeeds.
    last_probe: Mutex<Option<Instant>>,
    policy: GatewayPolicy,
}

impl EmbeddingGateway {
    /// Build a gateway and probe for the first healthy backend.
    ///
    /// Never fails: a gateway with no healthy backend is returned and
    /// reports `ProviderUnavailable` until a backend comes up.
    pub async fn connect(backends: Vec<Arc<dyn EmbeddingBackend>>, policy: GatewayPolicy) -> Self {
        let gateway = Self {
            backends,
            active: RwLock::new(None),
            last_probe: Mutex::new(None),
            policy,
        };
        match gateway.probe().await {
            Some(i) => tracing::info!(
                backend = gateway.backends[i].name(),
                model = gateway.backends[i].model_name(),
                dims = gateway.backends[i].dims(),
                "embedding backend selected"
            ),
            None => tracing::warn!("no embedding backend available; semantic search will degrade"),
        }
        gateway
    }

    pub async fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let backends = super::create_backends(config)?;
        Ok(Self::connect(backends, GatewayPolicy::from_config(config)).await)
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    fn active_index(&self) -> Option<usize> {
        *self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_active(&self, value: Option<usize>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn is_available(&self) -> bool {
        self.active_index().is_some()
    }

    fn set_last_probe(&self, value: Option<Instant>) {
        *self.last_probe.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Whether a recent probe found nothing and the cooldown still runs.
    fn cooling_down(&self) -> bool {
        let started = *self.last_probe.lock().unwrap_or_else(PoisonError::into_inner);
        started.is_some_and(|t| t.elapsed() < self.policy.probe_cooldown)
    }

    /// Probe backends in priority order; the first to answer becomes active.
    ///
    /// The start time is recorded up front so a probe abandoned by a
    /// caller's timeout still counts towards the cooldown.
    async fn probe(&self) -> Option<usize> {
        self.set_last_probe(Some(Instant::now()));
        let probe_text = vec!["ping".to_string()];
        for (i, backend) in self.backends.iter().enumerate() {
            for attempt in 0..self.policy.probe_attempts {
                if attempt > 0 {
                    tokio::time::sleep(self.policy.probe_backoff * (1 << (attempt - 1).min(5))).await;
                }
                match tokio::time::timeout(self.policy.call_timeout, backend.embed(&probe_text)).await {
                    Ok(Ok(v)) if v.len() == 1 && v[0].len() == backend.dims() && v[0].iter().all(|x| x.is_finite()) => {
                        self.set_active(Some(i));
                        self.set_last_probe(None);
                        return Some(i);
                    }
                    Ok(Ok(v)) => {
                        tracing::warn!(
                            backend = backend.name(),
                            expected = backend.dims(),
                            got = v.first().map(Vec::len).unwrap_or(0),
                            "embedding probe returned unexpected shape"
                        );
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(backend = backend.name(), attempt, "embedding probe failed: {:#}", e)
                    }
                    Err(_) => tracing::debug!(backend = backend.name(), attempt, "embedding probe timed out"),
                }
            }
        }
        self.set_active(None);
        self.set_last_probe(Some(Instant::now()));
        None
    }

    async fn ensure_active(&self) -> Result<usize> {
        if let Some(i) = self.active_index() {
            return Ok(i);
        }
        if self.cooling_down() {
            return Err(RetrievalError::unavailable(
                "no embedding backend is reachable (waiting before the next probe)",
            ));
        }
        self.probe()
            .await
            .ok_or_else(|| RetrievalError::unavailable("no embedding backend is reachable"))
    }

    async fn embed_with(&self, backend: &dyn EmbeddingBackend, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.policy.batch_size) {
            let vectors = tokio::time::timeout(self.policy.call_timeout, backend.embed(batch))
                .await
                .map_err(|_| {
                    RetrievalError::unavailable(format!("{} embedding timed out", backend.name()))
                })?
                .map_err(|e| RetrievalError::unavailable(format!("{}: {:#}", backend.name(), e)))?;

            if vectors.len() != batch.len() {
                return Err(RetrievalError::unavailable(format!(
                    "{} returned {} vectors for {} texts",
                    backend.name(),
                    vectors.len(),
                    batch.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != backend.dims()) {
                return Err(RetrievalError::configuration(format!(
                    "{} returned a {}-dimensional vector, configured dims = {}",
                    backend.name(),
                    bad.len(),
                    backend.dims()
                )));
            }
            if vectors.iter().any(|v| v.iter().any(|x| !x.is_finite())) {
                return Err(RetrievalError::unavailable(format!(
                    "{} returned non-finite embedding values",
                    backend.name()
                )));
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed texts in order, batched by `batch_size`.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut last_err = None;
        for _ in 0..2 {
            let i = self.ensure_active().await?;
            let backend = Arc::clone(&self.backends[i]);
            match self.embed_with(backend.as_ref(), texts).await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(backend = backend.name(), "embedding failed, failing over: {}", e);
                    self.set_active(None);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RetrievalError::unavailable("embedding failed")))
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_documents(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::unavailable("empty embedding response"))
    }

    /// Name and dimensionality of the active backend's model.
    pub fn get_model_info(&self) -> Result<ModelInfo> {
        let i = self
            .active_index()
            .ok_or_else(|| RetrievalError::unavailable("no active embedding backend"))?;
        let backend = &self.backends[i];
        Ok(ModelInfo {
            name: backend.model_name().to_string(),
            dimensions: backend.dims(),
        })
    }

    /// Compare the index's established dimension with the active model.
    pub fn check_compatibility(&self, index_dimension: Option<usize>) -> Result<Compatibility> {
        let model = self.get_model_info()?;
        Ok(match index_dimension {
            Some(index) if index != model.dimensions => Compatibility::DimensionChanged {
                index,
                model: model.dimensions,
            },
            _ => Compatibility::Compatible,
        })
    }
}
