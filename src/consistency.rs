//! Index ↔ file-store reconciliation.
//!
//! The [`ConsistencyManager`] compares the vector index with the
//! authoritative [`FileStore`] and repairs drift:
//!
//! | Drift | Repair |
//! |-------|--------|
//! | vectors whose file id has no record | delete the vectors |
//! | record with no vectors (non-empty file) | re-ingest |
//! | record whose file changed on disk | re-ingest |
//! | record whose file no longer exists | remove record and vectors |
//!
//! Repairs run on demand ([`force_sync`](ConsistencyManager::force_sync)),
//! on a schedule, or when the [`ErrorTracker`] sees a burst of failures.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use recall_harness_core::files::FileStore;
use recall_harness_core::index::VectorIndex;
use recall_harness_core::models::IntegrityReport;
use recall_harness_core::{Result, RetrievalError};

use crate::config::ConsistencyConfig;
use crate::ingest::{hash_on_disk, IngestOutcome, Ingestor};

// ─── Error tracker ───

struct TrackerState {
    errors: VecDeque<Instant>,
    last_auto_sync: Option<Instant>,
}

/// Rolling window of recent failures.
///
/// When `threshold` errors land within `window`, an automatic sync is
/// requested, at most once per `min_sync_interval`.
pub struct ErrorTracker {
    state: StdMutex<TrackerState>,
    threshold: usize,
    window: Duration,
    min_sync_interval: Duration,
    sync_requested: Notify,
}

impl ErrorTracker {
    pub fn new(threshold: usize, window: Duration, min_sync_interval: Duration) -> Self {
        Self {
            state: StdMutex::new(TrackerState {
                errors: VecDeque::new(),
                last_auto_sync: None,
            }),
            threshold: threshold.max(1),
            window,
            min_sync_interval,
            sync_requested: Notify::new(),
        }
    }

    pub fn from_config(config: &ConsistencyConfig) -> Self {
        Self::new(
            config.error_threshold,
            Duration::from_secs(config.error_window_secs),
            Duration::from_secs(config.min_sync_interval_secs),
        )
    }

    /// Record one failure. Returns `true` if this error requested a sync.
    pub fn record_error(&self, context: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.errors.push_back(now);
        while let Some(&oldest) = state.errors.front() {
            if now.duration_since(oldest) > self.window {
                state.errors.pop_front();
            } else {
                break;
            }
        }
        debug!(context, recent = state.errors.len(), "error recorded");

        if state.errors.len() < self.threshold {
            return false;
        }
        let cooled_down = state
            .last_auto_sync
            .map_or(true, |t| now.duration_since(t) >= self.min_sync_interval);
        if !cooled_down {
            return false;
        }
        state.last_auto_sync = Some(now);
        state.errors.clear();
        drop(state);

        warn!(context, "error threshold crossed, requesting sync");
        self.sync_requested.notify_one();
        true
    }

    /// Errors currently inside the window.
    pub fn recent_errors(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .errors
            .iter()
            .filter(|t| now.duration_since(**t) <= self.window)
            .count()
    }

    /// Resolves once a sync has been requested.
    pub async fn sync_requested(&self) {
        self.sync_requested.notified().await
    }
}

// ─── Manager ───

/// Scope and mode of a [`ConsistencyManager::force_sync`] run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Report what would change without changing anything.
    pub dry_run: bool,
    /// Restrict the run to these file ids; `None` means everything.
    pub file_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Integrity state observed before repairs.
    pub report: IntegrityReport,
    pub vectors_removed: usize,
    pub files_reingested: usize,
    pub files_removed: usize,
    /// `"<path or id>: <error>"` for each repair that failed.
    pub failures: Vec<String>,
    pub dry_run: bool,
    /// Another sync was already running; nothing was done.
    pub skipped: bool,
}

impl SyncReport {
    pub fn changed_anything(&self) -> bool {
        self.vectors_removed + self.files_reingested + self.files_removed > 0
    }
}

/// Scheduler intervals and auto-fix policy.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencySettings {
    pub auto_fix: bool,
    pub light_check_interval: Duration,
    pub deep_scan_interval: Duration,
}

impl ConsistencySettings {
    pub fn from_config(config: &ConsistencyConfig) -> Self {
        Self {
            auto_fix: config.auto_fix,
            light_check_interval: Duration::from_secs(config.light_check_interval_secs.max(1)),
            deep_scan_interval: Duration::from_secs(config.deep_scan_interval_secs.max(1)),
        }
    }
}

pub struct ConsistencyManager {
    index: Arc<dyn VectorIndex>,
    files: Arc<dyn FileStore>,
    ingestor: Arc<Ingestor>,
    tracker: Arc<ErrorTracker>,
    sync_lock: Mutex<()>,
    settings: ConsistencySettings,
}

impl ConsistencyManager {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        files: Arc<dyn FileStore>,
        ingestor: Arc<Ingestor>,
        tracker: Arc<ErrorTracker>,
        settings: ConsistencySettings,
    ) -> Self {
        Self {
            index,
            files,
            ingestor,
            tracker,
            sync_lock: Mutex::new(()),
            settings,
        }
    }

    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    /// Compare the index with the file store. Read-only.
    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        let by_file = self.index.file_ids().await;
        let files = self.files.list_files().await?;
        let known: HashSet<&str> = files.iter().map(|f| f.id.as_str()).collect();

        let orphaned_vector_ids: Vec<String> = by_file
            .iter()
            .filter(|(file_id, _)| !known.contains(file_id.as_str()))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        let orphaned_file_ids: Vec<String> = files
            .iter()
            .filter(|f| f.size > 0 && !by_file.contains_key(&f.id))
            .map(|f| f.id.clone())
            .collect();

        let report = IntegrityReport {
            orphaned_vector_ids,
            orphaned_file_ids,
            total_vectors: by_file.values().map(Vec::len).sum(),
            total_files: files.len(),
            last_checked_at: Utc::now(),
            auto_fix_applied: false,
        };
        if !report.is_consistent() {
            let drift = RetrievalError::IntegrityDrift {
                orphaned_vectors: report.orphaned_vector_ids.len(),
                orphaned_files: report.orphaned_file_ids.len(),
            };
            info!("{}", drift);
        }
        Ok(report)
    }

    /// Repair drift. Single-flight: a call made while another sync runs
    /// returns immediately with `skipped = true`.
    pub async fn force_sync(&self, options: SyncOptions) -> Result<SyncReport> {
        let Ok(_running) = self.sync_lock.try_lock() else {
            debug!("sync already running, skipping");
            return Ok(SyncReport {
                report: self.check_integrity().await?,
                vectors_removed: 0,
                files_reingested: 0,
                files_removed: 0,
                failures: Vec::new(),
                dry_run: options.dry_run,
                skipped: true,
            });
        };
        self.sync_locked(options).await
    }

    /// Clear the index and re-ingest every known file.
    ///
    /// Holds the sync lock from the clear until the last file is back, so
    /// no scheduled sync interleaves; the clear itself is exclusive with
    /// ingestion.
    pub async fn rebuild(&self) -> Result<SyncReport> {
        let _running = self.sync_lock.lock().await;
        self.ingestor.clear_index().await?;
        info!("index cleared, re-embedding all files");
        // Every file is now orphaned; a full sync re-ingests or removes each.
        self.sync_locked(SyncOptions::default()).await
    }

    /// Sync body; the caller holds `sync_lock`.
    async fn sync_locked(&self, options: SyncOptions) -> Result<SyncReport> {
        let report = self.check_integrity().await?;
        let targets: Option<HashSet<String>> = options.file_ids.map(|ids| ids.into_iter().collect());
        let in_scope = |id: &str| targets.as_ref().map_or(true, |t| t.contains(id));
        let dry_run = options.dry_run;

        let mut out = SyncReport {
            report,
            vectors_removed: 0,
            files_reingested: 0,
            files_removed: 0,
            failures: Vec::new(),
            dry_run,
            skipped: false,
        };

        // Vectors with no owning record.
        let by_file = self.index.file_ids().await;
        let known: HashSet<String> = self.files.list_files().await?.into_iter().map(|f| f.id).collect();
        for (file_id, ids) in by_file.iter().filter(|(id, _)| !known.contains(*id) && in_scope(id.as_str())) {
            if dry_run {
                out.vectors_removed += ids.len();
                continue;
            }
            match self.ingestor.remove_vectors(file_id).await {
                Ok(n) => out.vectors_removed += n,
                Err(e) => out.failures.push(format!("{}: {}", file_id, e)),
            }
        }

        // Records: vanished, orphaned, or stale.
        let orphaned: HashSet<String> = out.report.orphaned_file_ids.iter().cloned().collect();
        for file in self.files.list_files().await? {
            if !in_scope(&file.id) {
                continue;
            }
            let disk_hash = match hash_on_disk(Path::new(&file.path)).await {
                Ok(h) => h,
                Err(e) => {
                    out.failures.push(format!("{}: {}", file.path, e));
                    continue;
                }
            };
            match disk_hash {
                None => {
                    if dry_run {
                        out.files_removed += 1;
                        out.vectors_removed += by_file.get(&file.id).map_or(0, Vec::len);
                        continue;
                    }
                    match self.ingestor.remove_file_id(&file.id).await {
                        Ok(n) => {
                            out.files_removed += 1;
                            out.vectors_removed += n;
                        }
                        Err(e) => out.failures.push(format!("{}: {}", file.path, e)),
                    }
                }
                Some(hash) if hash != file.hash || orphaned.contains(&file.id) => {
                    if dry_run {
                        out.files_reingested += 1;
                        continue;
                    }
                    match self.ingestor.ingest_path(Path::new(&file.path), true).await {
                        Ok(IngestOutcome::Indexed { .. }) => out.files_reingested += 1,
                        Ok(_) => {}
                        Err(e) => out.failures.push(format!("{}: {}", file.path, e)),
                    }
                }
                Some(_) => {}
            }
        }

        out.report.auto_fix_applied = !dry_run && out.changed_anything();
        info!(
            dry_run,
            vectors_removed = out.vectors_removed,
            files_reingested = out.files_reingested,
            files_removed = out.files_removed,
            failures = out.failures.len(),
            "sync finished"
        );
        Ok(out)
    }

    async fn light_check(&self) {
        match self.check_integrity().await {
            Ok(report) if report.is_consistent() => debug!("integrity check clean"),
            Ok(report) if self.settings.auto_fix => {
                let mut ids = report.orphaned_file_ids.clone();
                ids.extend(
                    report
                        .orphaned_vector_ids
                        .iter()
                        .filter_map(|id| id.rsplit_once(':').map(|(file, _)| file.to_string())),
                );
                ids.sort();
                ids.dedup();
                self.run_scheduled(SyncOptions {
                    dry_run: false,
                    file_ids: Some(ids),
                })
                .await;
            }
            Ok(_) => warn!("index drift detected; auto_fix disabled"),
            Err(e) => warn!("integrity check failed: {}", e),
        }
    }

    async fn run_scheduled(&self, options: SyncOptions) {
        if let Err(e) = self.force_sync(options).await {
            warn!("scheduled sync failed, will retry next tick: {}", e);
        }
    }

    /// Run periodic checks until `shutdown` flips to `true` or its sender
    /// is dropped.
    ///
    /// - every light interval: integrity check, targeted repair if drift
    /// - every deep interval: full sync including hash comparison
    /// - on error-threshold requests: full sync
    pub fn spawn_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut light = tokio::time::interval_at(
                start + self.settings.light_check_interval,
                self.settings.light_check_interval,
            );
            let mut deep = tokio::time::interval_at(
                start + self.settings.deep_scan_interval,
                self.settings.deep_scan_interval,
            );
            light.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            deep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = light.tick() => self.light_check().await,
                    _ = deep.tick() => {
                        debug!("deep scan");
                        self.run_scheduled(SyncOptions::default()).await;
                    }
                    _ = self.tracker.sync_requested() => {
                        info!("sync requested by error tracker");
                        self.run_scheduled(SyncOptions::default()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("consistency scheduler stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingBackend, EmbeddingGateway, GatewayPolicy, HashedBackend};
    use recall_harness_core::files::InMemoryFileStore;
    use recall_harness_core::index::memory::InMemoryIndex;
    use recall_harness_core::models::{RecordMetadata, VectorRecord};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        manager: Arc<ConsistencyManager>,
        index: Arc<dyn VectorIndex>,
        ingestor: Arc<Ingestor>,
        tmp: TempDir,
    }

    impl Fixture {
        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.tmp.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        async fn add_ghost(&self) {
            let record = VectorRecord {
                id: "ghost:0".to_string(),
                embedding: HashedBackend::new(32).embed_one("ghost"),
                content: "ghost".to_string(),
                metadata: RecordMetadata {
                    file_id: "ghost".to_string(),
                    total_chunks: 1,
                    ..Default::default()
                },
            };
            self.index.add_documents(vec![record]).await.unwrap();
        }

        async fn has_ghost(&self) -> bool {
            self.index.file_ids().await.contains_key("ghost")
        }
    }

    async fn fixture(tracker: ErrorTracker, settings: ConsistencySettings) -> Fixture {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let files: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
        let gateway = EmbeddingGateway::connect(
            vec![Arc::new(HashedBackend::new(32)) as Arc<dyn EmbeddingBackend>],
            GatewayPolicy::default(),
        )
        .await;
        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&index),
            Arc::clone(&files),
            Arc::new(gateway),
            Arc::new(Mutex::new(())),
            100,
        ));
        let manager = Arc::new(ConsistencyManager::new(
            Arc::clone(&index),
            files,
            Arc::clone(&ingestor),
            Arc::new(tracker),
            settings,
        ));
        Fixture {
            manager,
            index,
            ingestor,
            tmp: TempDir::new().unwrap(),
        }
    }

    fn settings(light: Duration, deep: Duration) -> ConsistencySettings {
        ConsistencySettings {
            auto_fix: true,
            light_check_interval: light,
            deep_scan_interval: deep,
        }
    }

    fn quiet_tracker() -> ErrorTracker {
        ErrorTracker::new(100, Duration::from_secs(60), Duration::from_secs(3600))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    /// Poll `check` every 10 ms for up to five seconds.
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_light_check_removes_orphaned_vectors() {
        let fx = fixture(quiet_tracker(), settings(Duration::from_millis(30), HOUR)).await;
        fx.ingestor.ingest_path(&fx.write("a.md", "kept content"), false).await.unwrap();
        fx.add_ghost().await;

        let (stop, shutdown) = watch::channel(false);
        let scheduler = Arc::clone(&fx.manager).spawn_scheduler(shutdown);
        let fx_ref = &fx;
        assert!(eventually(|| async move { !fx_ref.has_ghost().await }).await);
        assert_eq!(fx.index.len().await, 1);

        stop.send(true).unwrap();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_light_check_leaves_drift_when_auto_fix_disabled() {
        let mut no_fix = settings(Duration::from_millis(20), HOUR);
        no_fix.auto_fix = false;
        let fx = fixture(quiet_tracker(), no_fix).await;
        fx.add_ghost().await;

        let (stop, shutdown) = watch::channel(false);
        let scheduler = Arc::clone(&fx.manager).spawn_scheduler(shutdown);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.has_ghost().await);

        drop(stop);
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_deep_scan_reingests_changed_files() {
        let fx = fixture(quiet_tracker(), settings(HOUR, Duration::from_millis(30))).await;
        let path = fx.write("a.md", "before the edit");
        fx.ingestor.ingest_path(&path, false).await.unwrap();
        std::fs::write(&path, "after the edit").unwrap();

        let (stop, shutdown) = watch::channel(false);
        let scheduler = Arc::clone(&fx.manager).spawn_scheduler(shutdown);
        let index = Arc::clone(&fx.index);
        assert!(
            eventually(|| {
                let index = Arc::clone(&index);
                async move {
                    index
                        .all_records()
                        .await
                        .first()
                        .is_some_and(|r| r.content == "after the edit")
                }
            })
            .await
        );

        stop.send(true).unwrap();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_burst_syncs_once_per_min_interval() {
        let tracker = ErrorTracker::new(1, Duration::from_secs(60), HOUR);
        let fx = fixture(tracker, settings(HOUR, HOUR)).await;
        fx.add_ghost().await;

        let (stop, shutdown) = watch::channel(false);
        let scheduler = Arc::clone(&fx.manager).spawn_scheduler(shutdown);
        assert!(fx.manager.error_tracker().record_error("search"));
        let fx_ref = &fx;
        assert!(eventually(|| async move { !fx_ref.has_ghost().await }).await);

        fx.add_ghost().await;
        assert!(!fx.manager.error_tracker().record_error("search"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.has_ghost().await);

        stop.send(true).unwrap();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_waits_for_running_sync() {
        let fx = fixture(quiet_tracker(), settings(HOUR, HOUR)).await;
        fx.ingestor.ingest_path(&fx.write("a.md", "first file"), false).await.unwrap();
        fx.ingestor.ingest_path(&fx.write("b.md", "second file"), false).await.unwrap();

        let (sync, rebuild) = tokio::join!(
            fx.manager.force_sync(SyncOptions::default()),
            fx.manager.rebuild()
        );
        assert!(!sync.unwrap().skipped);
        let rebuild = rebuild.unwrap();
        assert!(!rebuild.skipped);
        assert_eq!(rebuild.files_reingested, 2);
        assert_eq!(fx.index.len().await, 2);
        assert!(fx.manager.check_integrity().await.unwrap().is_consistent());
    }

    #[test]
    fn test_tracker_threshold_within_window() {
        let tracker = ErrorTracker::new(3, Duration::from_secs(60), Duration::from_secs(600));
        assert!(!tracker.record_error("a"));
        assert!(!tracker.record_error("a"));
        assert!(tracker.record_error("a"));
        assert_eq!(tracker.recent_errors(), 0);
    }

    #[test]
    fn test_tracker_respects_min_sync_interval() {
        let tracker = ErrorTracker::new(1, Duration::from_secs(60), Duration::from_secs(600));
        assert!(tracker.record_error("a"));
        assert!(!tracker.record_error("a"));
        assert!(!tracker.record_error("a"));
    }

    #[test]
    fn test_tracker_window_expires_old_errors() {
        let tracker = ErrorTracker::new(2, Duration::from_millis(20), Duration::ZERO);
        assert!(!tracker.record_error("a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!tracker.record_error("a"));
        assert!(tracker.record_error("a"));
    }

    #[tokio::test]
    async fn test_tracker_notifies_waiter() {
        let tracker = Arc::new(ErrorTracker::new(1, Duration::from_secs(60), Duration::ZERO));
        let waiter = {
            let t = Arc::clone(&tracker);
            tokio::spawn(async move { t.sync_requested().await })
        };
        tracker.record_error("x");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
