//! The retrieval engine context.
//!
//! [`Engine`] owns one instance of every component and wires them
//! together:
//!
//! ```text
//!            ┌───────────────────┐
//!  watcher ─▶│     Ingestor      │──▶ EmbeddingGateway
//!            └─────────┬─────────┘
//!                      ▼ (write lock)
//!   SqliteFileStore ◀──┴──▶ VectorIndex ◀── SearchPipeline ──▶ RerankingGateway
//!          ▲                    ▲
//!          └─ ConsistencyManager┘
//! ```
//!
//! Components never reach each other through globals; everything is
//! passed in at construction, so tests can build an engine around stub
//! embedding and reranking backends with [`Engine::open_with`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use recall_harness_core::files::FileStore;
use recall_harness_core::index::memory::InMemoryIndex;
use recall_harness_core::index::VectorIndex;
use recall_harness_core::models::{IndexStats, IntegrityReport, ModelInfo};
use recall_harness_core::{Result, RetrievalError};

use crate::config::{Config, IndexBackend, IndexConfig};
use crate::consistency::{ConsistencyManager, ConsistencySettings, ErrorTracker, SyncOptions, SyncReport};
use crate::embedding::{Compatibility, EmbeddingGateway};
use crate::ingest::{IngestOutcome, Ingestor};
use crate::pipeline::{PipelineSettings, SearchOutcome, SearchPipeline, SearchRequest};
use crate::rerank::RerankingGateway;
use crate::sqlite_store::SqliteFileStore;
use crate::watcher::{reconcile_scan, scan, IngestionWatcher, ScanOptions, WatchEventKind};
use crate::{db, migrate};

/// Construct the configured index backend.
pub fn build_index(config: &IndexConfig) -> Arc<dyn VectorIndex> {
    match config.backend {
        IndexBackend::Memory => Arc::new(InMemoryIndex::with_compaction_threshold(
            config.compaction_threshold,
        )),
    }
}

/// Summary returned by [`Engine::get_index_info`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub backend: String,
    pub stats: IndexStats,
    pub vectors: usize,
    pub files: usize,
    /// Model currently answering embedding calls.
    pub active_model: Option<ModelInfo>,
    /// Model recorded with the persisted snapshot.
    pub stored_model: Option<ModelInfo>,
}

/// Outcome of [`Engine::index_root`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexRunReport {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub empty: usize,
    pub removed: usize,
    pub failures: Vec<String>,
    /// The scan hit its time limit; results are partial.
    pub timed_out: bool,
}

pub struct Engine {
    config: Config,
    store: Arc<SqliteFileStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<EmbeddingGateway>,
    ingestor: Arc<Ingestor>,
    consistency: Arc<ConsistencyManager>,
    pipeline: SearchPipeline,
}

impl Engine {
    /// Open the database, connect backends from `config`, and load the
    /// persisted index snapshot.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let embedder = Arc::new(EmbeddingGateway::from_config(&config.embedding).await?);
        let reranker = RerankingGateway::from_config(&config.rerank)?.map(Arc::new);
        Self::open_with(config, embedder, reranker).await
    }

    /// [`open`](Self::open) with caller-supplied gateways.
    pub async fn open_with(
        config: Config,
        embedder: Arc<EmbeddingGateway>,
        reranker: Option<Arc<RerankingGateway>>,
    ) -> anyhow::Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate(&pool).await?;
        let store = Arc::new(SqliteFileStore::new(pool));
        let files: Arc<dyn FileStore> = store.clone();
        let index = build_index(&config.index);

        let tracker = Arc::new(ErrorTracker::from_config(&config.consistency));
        let ingestor = Arc::new(
            Ingestor::new(
                Arc::clone(&index),
                Arc::clone(&files),
                Arc::clone(&embedder),
                Arc::new(Mutex::new(())),
                config.chunking.max_tokens,
            )
            .with_error_tracker(Arc::clone(&tracker)),
        );
        let consistency = Arc::new(ConsistencyManager::new(
            Arc::clone(&index),
            files,
            Arc::clone(&ingestor),
            Arc::clone(&tracker),
            ConsistencySettings::from_config(&config.consistency),
        ));
        let pipeline = SearchPipeline::new(
            Arc::clone(&index),
            Arc::clone(&embedder),
            reranker,
            PipelineSettings::from_config(&config),
        )
        .with_error_tracker(tracker);

        let engine = Self {
            config,
            store,
            index,
            embedder,
            ingestor,
            consistency,
            pipeline,
        };
        let loaded = engine.load_snapshot().await?;
        debug!(records = loaded, "snapshot loaded");
        engine.reconcile_model().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn file_store(&self) -> &Arc<SqliteFileStore> {
        &self.store
    }

    pub fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.consistency
    }

    /// Run a query under the configured whole-query deadline.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchOutcome> {
        self.pipeline
            .search_with_deadline(request, self.config.retrieval.query_timeout())
            .await
    }

    pub async fn add_documents_for_file(&self, path: &Path) -> Result<IngestOutcome> {
        self.ingestor.ingest_path(path, false).await
    }

    /// Drop a file's record and vectors. `None` if the path was unknown.
    pub async fn remove_documents_for_file(&self, path: &Path) -> Result<Option<usize>> {
        self.ingestor.remove_path(path).await
    }

    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        self.consistency.check_integrity().await
    }

    pub async fn force_sync(&self, options: SyncOptions) -> Result<SyncReport> {
        self.consistency.force_sync(options).await
    }

    pub async fn get_index_info(&self) -> anyhow::Result<IndexInfo> {
        Ok(IndexInfo {
            backend: self.index.name().to_string(),
            stats: self.index.get_index_info().await,
            vectors: self.index.len().await,
            files: self.store.list_files().await?.len(),
            active_model: self.embedder.get_model_info().ok(),
            stored_model: self.store.stored_model().await?,
        })
    }

    /// Scan `root` and bring the index in line with it.
    pub async fn index_root(&self, root: &Path) -> anyhow::Result<IndexRunReport> {
        let options = ScanOptions::from_config(&self.config.watcher, self.config.storage_dir())?;
        let root_buf = root.to_path_buf();
        let scanned = tokio::task::spawn_blocking(move || scan(&root_buf, &options)).await??;
        let events = reconcile_scan(&scanned, self.store.as_ref()).await?;

        let mut report = IndexRunReport {
            scanned: scanned.files.len(),
            timed_out: scanned.timed_out,
            ..Default::default()
        };
        // Anything the scan saw but reconcile skipped is unchanged.
        let touched = events
            .iter()
            .filter(|e| e.kind != WatchEventKind::Deleted)
            .count();
        report.unchanged = report.scanned.saturating_sub(touched);

        for event in &events {
            let path = event.path.display().to_string();
            match event.kind {
                WatchEventKind::Added | WatchEventKind::Changed => {
                    match self.ingestor.ingest_path(&event.path, false).await {
                        Ok(IngestOutcome::Indexed { .. }) => report.indexed += 1,
                        Ok(IngestOutcome::Unchanged { .. }) => report.unchanged += 1,
                        Ok(IngestOutcome::Empty { .. }) => report.empty += 1,
                        Err(e) => report.failures.push(format!("{}: {}", path, e)),
                    }
                }
                WatchEventKind::Deleted => match self.ingestor.remove_path(&event.path).await {
                    Ok(Some(_)) => report.removed += 1,
                    Ok(None) => {}
                    Err(e) => report.failures.push(format!("{}: {}", path, e)),
                },
            }
        }

        info!(
            root = %scanned.root.display(),
            indexed = report.indexed,
            unchanged = report.unchanged,
            removed = report.removed,
            failures = report.failures.len(),
            "index run finished"
        );
        Ok(report)
    }

    /// Clear the index and re-embed every known file with the active model.
    pub async fn rebuild(&self) -> Result<SyncReport> {
        if !self.index.capabilities().rebuild {
            return Err(RetrievalError::configuration(format!(
                "index backend '{}' does not support rebuild",
                self.index.name()
            )));
        }
        let report = self.consistency.rebuild().await?;
        self.save_snapshot().await?;
        Ok(report)
    }

    /// Persist every record to the database. Returns the count written.
    pub async fn save_snapshot(&self) -> anyhow::Result<usize> {
        if !self.index.capabilities().snapshot {
            debug!(backend = self.index.name(), "backend has no snapshot support");
            return Ok(0);
        }
        let records = self.index.all_records().await;
        let model = self.embedder.get_model_info().ok();
        let written = self.store.save_snapshot(&records, model.as_ref()).await?;
        debug!(records = written, "snapshot saved");
        Ok(written)
    }

    async fn load_snapshot(&self) -> anyhow::Result<usize> {
        let records = self.store.load_snapshot().await?;
        if records.is_empty() {
            return Ok(0);
        }
        Ok(self.index.add_documents(records).await?)
    }

    /// Compare the snapshot's model with the active one.
    ///
    /// On a change, rebuild when `auto_rebuild_on_model_change` is set;
    /// otherwise warn and leave the index as is (semantic queries then fail
    /// with a configuration error until `rebuild` runs).
    async fn reconcile_model(&self) -> anyhow::Result<()> {
        let Ok(active) = self.embedder.get_model_info() else {
            return Ok(());
        };
        let stored = self.store.stored_model().await?;
        let dimension = self.index.get_index_info().await.dimension;

        let changed = match self.embedder.check_compatibility(dimension)? {
            Compatibility::DimensionChanged { index, model } => {
                warn!(index, model, "embedding dimension changed");
                true
            }
            Compatibility::Compatible => {
                let renamed = stored.as_ref().is_some_and(|s| s.name != active.name);
                renamed && !self.index.is_empty().await
            }
        };
        if !changed {
            return Ok(());
        }

        if self.embedder.policy().auto_rebuild_on_model_change {
            info!(model = %active.name, "embedding model changed, rebuilding index");
            self.rebuild().await?;
        } else {
            warn!(
                from = stored.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
                to = %active.name,
                "embedding model changed; run `recall rebuild` to re-embed"
            );
        }
        Ok(())
    }

    /// Watch the configured roots until `shutdown` flips to `true`.
    ///
    /// Runs a catch-up scan first, then live events. The consistency
    /// scheduler runs alongside, and the index snapshot is saved on every
    /// light-check interval and once more on the way out.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.config.watcher.roots.is_empty() {
            anyhow::bail!("watcher.roots is empty; nothing to watch");
        }
        let mut watcher = IngestionWatcher::from_config(&self.config.watcher, self.config.storage_dir())?;

        let pending = watcher.catch_up(self.store.as_ref()).await?;
        info!(events = pending.len(), "catch-up scan");
        for event in &pending {
            if let Err(e) = self.ingestor.handle_event(event).await {
                warn!(path = %event.path.display(), "catch-up failed: {}", e);
            }
        }
        self.save_snapshot().await?;

        let rx = watcher.start()?;
        let ingest_task = tokio::spawn(Arc::clone(&self.ingestor).run(rx));
        let scheduler = Arc::clone(&self.consistency).spawn_scheduler(shutdown.clone());

        let interval = Duration::from_secs(self.config.consistency.light_check_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.save_snapshot().await {
                        warn!("snapshot failed: {:#}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Dropping the notify handle closes the event chain; the debouncer
        // flushes and the ingestion loop drains before exiting.
        watcher.stop();
        if let Err(e) = ingest_task.await {
            warn!("ingestion task ended abnormally: {}", e);
        }
        if let Err(e) = scheduler.await {
            warn!("consistency scheduler ended abnormally: {}", e);
        }
        if watcher.dropped_events() > 0 {
            warn!(dropped = watcher.dropped_events(), "events were dropped under load");
        }
        self.save_snapshot().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.store.pool().close().await;
    }
}
