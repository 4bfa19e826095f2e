//! Two-stage search pipeline.
//!
//! ```text
//! Received ──▶ Stage1Retrieved ──┬──▶ Stage2Reranked ──▶ Returned
//!                                └──▶ Stage1Final ─────▶ Returned
//! ```
//!
//! Stage 1 scores candidates by cosine similarity (or token overlap when
//! the query cannot be embedded within `embed_timeout`, or fused scores
//! in hybrid mode). Stage 2
//! asks the [`RerankingGateway`] to reorder them. Stage 2 only runs in
//! semantic mode with a reranker configured and requested; any stage-2
//! failure returns the stage-1 order instead.
//!
//! Dropping the future returned by [`SearchPipeline::search`] cancels any
//! in-flight embedding or rerank call; the index is never mutated here.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use recall_harness_core::index::{MetadataFilter, ScoredRecord, SearchParams, VectorIndex};
use recall_harness_core::models::SearchResult;
use recall_harness_core::rerank::RerankCandidate;
use recall_harness_core::search::{fuse_hybrid, stage1_candidate_count, CandidatePolicy, SearchMode};
use recall_harness_core::{Result, RetrievalError};

use crate::config::{Config, RetrievalConfig};
use crate::consistency::ErrorTracker;
use crate::embedding::EmbeddingGateway;
use crate::rerank::RerankingGateway;

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    Received,
    Stage1Retrieved,
    Stage2Reranked,
    Stage1Final,
    Returned,
}

/// A fallback the pipeline took instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// The query could not be embedded; token-overlap scoring was used.
    KeywordFallback,
    /// Reranking failed; stage-1 order was returned.
    RerankFallback,
}

/// One search request. Unset fields fall back to `[retrieval]` defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub mode: Option<SearchMode>,
    pub rerank: bool,
    pub score_threshold: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }
}

/// Results plus how they were produced.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Stage that produced the final ordering.
    pub stage: QueryStage,
    pub candidates_requested: usize,
    pub degraded: Option<Degradation>,
}

/// Pipeline tuning, usually taken from `[retrieval]` and `[rerank]`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub default_top_k: usize,
    pub default_mode: SearchMode,
    pub score_threshold: Option<f32>,
    pub hybrid_alpha: f32,
    pub candidates: CandidatePolicy,
    /// Limit on embedding the query before falling back to keywords.
    pub embed_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            candidates: CandidatePolicy {
                multiplier: config.rerank.candidate_multiplier,
                floor: config.rerank.candidate_floor,
            },
            ..Self::from_retrieval(&config.retrieval)
        }
    }

    fn from_retrieval(retrieval: &RetrievalConfig) -> Self {
        Self {
            default_top_k: retrieval.top_k,
            default_mode: retrieval.mode,
            score_threshold: retrieval.score_threshold,
            hybrid_alpha: retrieval.hybrid_alpha,
            candidates: CandidatePolicy::default(),
            embed_timeout: retrieval.embed_timeout(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_retrieval(&RetrievalConfig::default())
    }
}

pub struct SearchPipeline {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<EmbeddingGateway>,
    reranker: Option<Arc<RerankingGateway>>,
    errors: Option<Arc<ErrorTracker>>,
    settings: PipelineSettings,
}

impl SearchPipeline {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<EmbeddingGateway>,
        reranker: Option<Arc<RerankingGateway>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            reranker,
            errors: None,
            settings,
        }
    }

    /// Report stage-1 failures to `tracker`.
    pub fn with_error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.errors = Some(tracker);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// [`search`](Self::search) bounded by a whole-query deadline.
    pub async fn search_with_deadline(
        &self,
        request: SearchRequest,
        deadline: Duration,
    ) -> Result<SearchOutcome> {
        tokio::time::timeout(deadline, self.search(request))
            .await
            .map_err(|_| RetrievalError::unavailable(format!("query exceeded deadline of {:?}", deadline)))?
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchOutcome> {
        let mut stage = QueryStage::Received;
        let top_k = request.top_k.unwrap_or(self.settings.default_top_k);
        let mode = request.mode.unwrap_or(self.settings.default_mode);
        let query = request.query.trim();

        if query.is_empty() {
            return Err(RetrievalError::configuration("search query must not be empty"));
        }

        let corpus = self.index.len().await;
        if top_k == 0 || corpus == 0 {
            return Ok(SearchOutcome {
                results: Vec::new(),
                stage: QueryStage::Returned,
                candidates_requested: 0,
                degraded: None,
            });
        }

        let use_rerank = request.rerank
            && self.reranker.is_some()
            && !mode.has_builtin_fusion()
            && mode != SearchMode::Keyword;
        let candidates_requested =
            stage1_candidate_count(top_k, corpus, use_rerank, self.settings.candidates);
        let params = SearchParams {
            top_k: candidates_requested,
            score_threshold: request.score_threshold.or(self.settings.score_threshold),
            filter: request.filter.clone(),
        };

        let (mut results, mut degraded) = match self.stage1(query, mode, &params, top_k).await {
            Ok(r) => r,
            Err(e) => {
                if let Some(tracker) = &self.errors {
                    tracker.record_error("search");
                }
                return Err(e);
            }
        };
        stage = advance(stage, QueryStage::Stage1Retrieved);
        debug!(mode = %mode, candidates = results.len(), requested = candidates_requested, "stage 1 complete");

        let reranker = match (&self.reranker, use_rerank) {
            (Some(r), true) if !results.is_empty() => Some(r),
            _ => None,
        };

        if let Some(reranker) = reranker {
            let candidates: Vec<RerankCandidate> = results
                .iter()
                .map(|r| RerankCandidate {
                    id: r.id.clone(),
                    content: r.content.clone(),
                    vector_score: r.score,
                })
                .collect();

            match reranker
                .rerank(query, &candidates, top_k)
                .await
            {
                Ok(ranked) => {
                    let stage1 = std::mem::take(&mut results);
                    results = ranked
                        .iter()
                        .map(|r| {
                            let mut hit = stage1[r.index].clone();
                            hit.score = r.final_score;
                            hit.rerank_score = Some(r.relevance);
                            hit
                        })
                        .collect();
                    stage = advance(stage, QueryStage::Stage2Reranked);
                }
                Err(e) => {
                    warn!("rerank failed, returning stage-1 order: {}", e);
                    results.truncate(top_k);
                    degraded = degraded.or(Some(Degradation::RerankFallback));
                    stage = advance(stage, QueryStage::Stage1Final);
                }
            }
        } else {
            results.truncate(top_k);
            stage = advance(stage, QueryStage::Stage1Final);
        }

        debug!(?stage, results = results.len(), "query answered");
        Ok(SearchOutcome {
            results,
            stage: advance(stage, QueryStage::Returned),
            candidates_requested,
            degraded,
        })
    }

    /// Stage-1 retrieval for `mode`, degrading to keyword scoring when the
    /// query cannot be embedded.
    async fn stage1(
        &self,
        query: &str,
        mode: SearchMode,
        params: &SearchParams,
        top_k: usize,
    ) -> Result<(Vec<SearchResult>, Option<Degradation>)> {
        if mode == SearchMode::Keyword {
            let hits = self.index.keyword_search(query, params).await?;
            return Ok((hits.iter().map(keyword_hit).collect(), None));
        }

        let embedded = tokio::time::timeout(self.settings.embed_timeout, self.embedder.embed_query(query))
            .await
            .unwrap_or_else(|_| {
                Err(RetrievalError::unavailable(format!(
                    "query embedding exceeded {:?}",
                    self.settings.embed_timeout
                )))
            });
        let embedding = match embedded {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed, using keyword scoring: {}", e);
                let hits = self.index.keyword_search(query, params).await?;
                return Ok((
                    hits.iter().map(keyword_hit).collect(),
                    Some(Degradation::KeywordFallback),
                ));
            }
        };

        match mode {
            SearchMode::Hybrid => {
                let vector = self.index.search(&embedding, params).await?;
                let keyword = self.index.keyword_search(query, params).await?;
                let fused = fuse_hybrid(&vector, &keyword, self.settings.hybrid_alpha, top_k);
                let results = fused
                    .into_iter()
                    .map(|h| SearchResult {
                        id: h.record.id.clone(),
                        content: h.record.content.clone(),
                        score: h.score,
                        metadata: h.record.metadata.clone(),
                        vector_score: h.vector_score,
                        rerank_score: None,
                        keyword_score: h.keyword_score,
                    })
                    .collect();
                Ok((results, None))
            }
            _ => {
                let hits = self.index.search(&embedding, params).await?;
                Ok((hits.iter().map(vector_hit).collect(), None))
            }
        }
    }
}

fn advance(from: QueryStage, to: QueryStage) -> QueryStage {
    debug_assert!(matches!(
        (from, to),
        (QueryStage::Received, QueryStage::Stage1Retrieved)
            | (QueryStage::Stage1Retrieved, QueryStage::Stage2Reranked)
            | (QueryStage::Stage1Retrieved, QueryStage::Stage1Final)
            | (QueryStage::Stage2Reranked, QueryStage::Returned)
            | (QueryStage::Stage1Final, QueryStage::Returned)
    ));
    to
}

fn vector_hit(hit: &ScoredRecord) -> SearchResult {
    SearchResult {
        id: hit.record.id.clone(),
        content: hit.record.content.clone(),
        score: hit.score,
        metadata: hit.record.metadata.clone(),
        vector_score: Some(hit.score),
        rerank_score: None,
        keyword_score: None,
    }
}

fn keyword_hit(hit: &ScoredRecord) -> SearchResult {
    SearchResult {
        id: hit.record.id.clone(),
        content: hit.record.content.clone(),
        score: hit.score,
        metadata: hit.record.metadata.clone(),
        vector_score: None,
        rerank_score: None,
        keyword_score: Some(hit.score),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingBackend, GatewayPolicy, HashedBackend};
    use crate::rerank::{GenerateOptions, RerankSettings, TextGenerator};
    use async_trait::async_trait;
    use recall_harness_core::index::memory::InMemoryIndex;
    use recall_harness_core::models::{RecordMetadata, VectorRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Down;

    #[async_trait]
    impl EmbeddingBackend for Down {
        fn name(&self) -> &str {
            "down"
        }
        fn model_name(&self) -> &str {
            "down"
        }
        fn dims(&self) -> usize {
            64
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("connection refused")
        }
    }

    /// Counts embedding calls currently awaiting a response.
    struct InFlight(Arc<AtomicUsize>);

    impl InFlight {
        fn enter(counter: &Arc<AtomicUsize>) -> Self {
            counter.fetch_add(1, Ordering::SeqCst);
            Self(Arc::clone(counter))
        }
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Never answers, except the first call when `answer_first` is set.
    struct Stalled {
        answer_first: bool,
        calls: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        started: Notify,
    }

    impl Stalled {
        fn new(answer_first: bool) -> Arc<Self> {
            Arc::new(Self {
                answer_first,
                calls: AtomicUsize::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                started: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }
        fn model_name(&self) -> &str {
            "stalled"
        }
        fn dims(&self) -> usize {
            64
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 && self.answer_first {
                return Ok(texts.iter().map(|_| vec![0.5; 64]).collect());
            }
            let _in_flight = InFlight::enter(&self.in_flight);
            self.started.notify_one();
            std::future::pending::<anyhow::Result<Vec<Vec<f32>>>>().await
        }
    }

    struct Canned(String);

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn gateway_policy() -> GatewayPolicy {
        GatewayPolicy {
            probe_attempts: 1,
            probe_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(2),
            probe_cooldown: Duration::ZERO,
            batch_size: 16,
            auto_rebuild_on_model_change: false,
        }
    }

    async fn seeded(backend: Arc<dyn EmbeddingBackend>, texts: &[&str]) -> (Arc<dyn VectorIndex>, Arc<EmbeddingGateway>) {
        seeded_with(backend, texts, gateway_policy()).await
    }

    async fn seeded_with(
        backend: Arc<dyn EmbeddingBackend>,
        texts: &[&str],
        policy: GatewayPolicy,
    ) -> (Arc<dyn VectorIndex>, Arc<EmbeddingGateway>) {
        let hashed = HashedBackend::new(64);
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let records = texts
            .iter()
            .enumerate()
            .map(|(i, t)| VectorRecord {
                id: format!("f{}:0", i),
                embedding: hashed.embed_one(t),
                content: t.to_string(),
                metadata: RecordMetadata {
                    file_id: format!("f{}", i),
                    ..Default::default()
                },
            })
            .collect();
        index.add_documents(records).await.unwrap();
        let gateway = Arc::new(EmbeddingGateway::connect(vec![backend], policy).await);
        (index, gateway)
    }

    fn corpus() -> Vec<String> {
        (0..30)
            .map(|i| format!("document {} about compaction and tombstones number{}", i, i))
            .collect()
    }

    #[tokio::test]
    async fn test_semantic_scores_strictly_descending() {
        let (index, gateway) = seeded(
            Arc::new(HashedBackend::new(64)),
            &["rust vector index", "cooking pasta", "vector similarity in rust"],
        )
        .await;
        let pipeline = SearchPipeline::new(index, gateway, None, PipelineSettings::default());
        let outcome = pipeline.search(SearchRequest::new("rust vector").top_k(3)).await.unwrap();
        assert_eq!(outcome.stage, QueryStage::Returned);
        assert!(outcome.results.len() <= 3);
        assert!(outcome.results.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(outcome.degraded.is_none());
    }

    #[tokio::test]
    async fn test_embedding_outage_degrades_to_keywords() {
        let (index, gateway) = seeded(Arc::new(Down), &["alpha beta", "gamma delta"]).await;
        let pipeline = SearchPipeline::new(index, gateway, None, PipelineSettings::default());
        let outcome = pipeline.search(SearchRequest::new("gamma")).await.unwrap();
        assert_eq!(outcome.degraded, Some(Degradation::KeywordFallback));
        assert_eq!(outcome.results[0].id, "f1:0");
        assert!(outcome.results[0].keyword_score.is_some());
    }

    #[tokio::test]
    async fn test_rerank_failure_returns_stage1_order() {
        let texts = corpus();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let (index, gateway) = seeded(Arc::new(HashedBackend::new(64)), &refs).await;

        let plain = SearchPipeline::new(Arc::clone(&index), Arc::clone(&gateway), None, PipelineSettings::default());
        let expected = plain.search(SearchRequest::new("compaction number3").top_k(5)).await.unwrap();

        let reranker = Arc::new(RerankingGateway::new(
            Arc::new(Canned("I'd rather not.".to_string())),
            RerankSettings::default(),
        ));
        let pipeline = SearchPipeline::new(index, gateway, Some(reranker), PipelineSettings::default());
        let outcome = pipeline
            .search(SearchRequest::new("compaction number3").top_k(5).with_rerank(true))
            .await
            .unwrap();

        assert_eq!(outcome.degraded, Some(Degradation::RerankFallback));
        assert_eq!(outcome.candidates_requested, 20);
        let got: Vec<&str> = outcome.results.iter().map(|r| r.id.as_str()).collect();
        let want: Vec<&str> = expected.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn test_rerank_success_applies_blended_scores() {
        let texts = corpus();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let (index, gateway) = seeded(Arc::new(HashedBackend::new(64)), &refs).await;
        let reranker = Arc::new(RerankingGateway::new(
            Arc::new(Canned(r#"[{"document_id": "doc-2", "relevance_score": 1.0}]"#.to_string())),
            RerankSettings::default(),
        ));
        let pipeline = SearchPipeline::new(index, gateway, Some(reranker), PipelineSettings::default());
        let outcome = pipeline
            .search(SearchRequest::new("compaction").top_k(3).with_rerank(true))
            .await
            .unwrap();
        assert!(outcome.degraded.is_none());
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].rerank_score, Some(1.0));
    }

    #[tokio::test]
    async fn test_hybrid_never_reranks() {
        let (index, gateway) = seeded(Arc::new(HashedBackend::new(64)), &["a rust index", "b pasta"]).await;
        let reranker = Arc::new(RerankingGateway::new(
            Arc::new(Canned("garbage".to_string())),
            RerankSettings::default(),
        ));
        let pipeline = SearchPipeline::new(index, gateway, Some(reranker), PipelineSettings::default());
        let outcome = pipeline
            .search(SearchRequest::new("rust index").mode(SearchMode::Hybrid).with_rerank(true))
            .await
            .unwrap();
        assert!(outcome.degraded.is_none());
        assert_eq!(outcome.candidates_requested, 10);
        assert_eq!(outcome.results[0].id, "f0:0");
    }

    #[tokio::test]
    async fn test_empty_index_and_empty_query() {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let gateway = Arc::new(
            EmbeddingGateway::connect(vec![Arc::new(HashedBackend::new(8)) as Arc<dyn EmbeddingBackend>], gateway_policy()).await,
        );
        let pipeline = SearchPipeline::new(index, gateway, None, PipelineSettings::default());
        assert!(pipeline.search(SearchRequest::new("x")).await.unwrap().results.is_empty());
        assert!(matches!(
            pipeline.search(SearchRequest::new("   ")).await,
            Err(RetrievalError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_query_embedding_falls_back_within_deadline() {
        let config = Config::minimal("unused.sqlite");
        let backend = Stalled::new(true);
        let (index, gateway) = seeded_with(
            backend.clone(),
            &["alpha beta", "gamma delta"],
            GatewayPolicy::from_config(&config.embedding),
        )
        .await;
        assert!(gateway.policy().call_timeout > config.retrieval.query_timeout());

        let pipeline = SearchPipeline::new(index, gateway, None, PipelineSettings::from_config(&config));
        let outcome = pipeline
            .search_with_deadline(SearchRequest::new("gamma"), config.retrieval.query_timeout())
            .await
            .unwrap();
        assert_eq!(outcome.degraded, Some(Degradation::KeywordFallback));
        assert_eq!(outcome.results[0].id, "f1:0");
        assert_eq!(backend.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_provider_is_not_rechecked_per_query() {
        let config = Config::minimal("unused.sqlite");
        let backend = Stalled::new(false);
        let (index, gateway) = seeded_with(
            backend.clone(),
            &["alpha beta", "gamma delta"],
            GatewayPolicy::from_config(&config.embedding),
        )
        .await;
        assert!(!gateway.is_available());
        let probes = backend.calls.load(Ordering::SeqCst);

        let pipeline = SearchPipeline::new(index, gateway, None, PipelineSettings::from_config(&config));
        for _ in 0..3 {
            let outcome = pipeline
                .search_with_deadline(SearchRequest::new("alpha"), config.retrieval.query_timeout())
                .await
                .unwrap();
            assert_eq!(outcome.degraded, Some(Degradation::KeywordFallback));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), probes);
    }

    #[tokio::test]
    async fn test_dropped_query_cancels_embedding_and_leaves_index_alone() {
        let backend = Stalled::new(true);
        let (index, gateway) = seeded(backend.clone(), &["alpha beta", "gamma delta"]).await;
        let before = index.get_index_info().await;
        let pipeline = Arc::new(SearchPipeline::new(
            Arc::clone(&index),
            gateway,
            None,
            PipelineSettings::default(),
        ));

        let query = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.search(SearchRequest::new("alpha")).await })
        };
        backend.started.notified().await;
        assert_eq!(backend.in_flight.load(Ordering::SeqCst), 1);

        query.abort();
        assert!(query.await.unwrap_err().is_cancelled());
        assert_eq!(backend.in_flight.load(Ordering::SeqCst), 0);

        let after = index.get_index_info().await;
        assert_eq!(after.occupied_slots, before.occupied_slots);
        assert_eq!(after.last_updated, before.last_updated);
    }
}
