//! Filesystem watching, scanning, and debouncing.
//!
//! Two sources feed the ingestion channel:
//!
//! - **Live events** from `notify`, converted to [`WatchEvent`]s and passed
//!   through a per-path [`Debouncer`] so a burst of writes to one file is
//!   delivered once, after the file goes quiet.
//! - **Catch-up scans** that walk each root with [`scan`] and diff the
//!   result against the file store ([`reconcile_scan`]), covering changes
//!   made while nothing was watching.
//!
//! Events are delivered over a bounded `tokio::sync::mpsc` channel; the
//! consumer is [`Ingestor::run`](crate::ingest::Ingestor::run).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use recall_harness_core::files::FileStore;
use recall_harness_core::RetrievalError;

use crate::config::WatcherConfig;
use crate::ingest::{hash_on_disk, normalize_path};

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    Create(String),

    #[error("Failed to watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("Watch root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Added,
    Changed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    pub observed_at: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
        }
    }
}

/// Combine two events for one path into the state to deliver.
///
/// - Deleted wins over anything before it
/// - Added then Changed is still Added (the file is new)
/// - Deleted then Added is a Changed (the file was replaced)
fn merge_kinds(existing: WatchEventKind, new: WatchEventKind) -> WatchEventKind {
    use WatchEventKind::*;
    match (existing, new) {
        (_, Deleted) => Deleted,
        (Deleted, _) => Changed,
        (Added, _) => Added,
        (Changed, _) => Changed,
    }
}

// ─── Debouncer ───

#[derive(Debug, Clone)]
struct PendingEvent {
    event: WatchEvent,
    last_seen: Instant,
}

/// Per-path coalescing of events within a quiet window.
pub struct Debouncer {
    pending: HashMap<PathBuf, PendingEvent>,
    window: Duration,
    max_pending: usize,
    dropped: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(window: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            window,
            max_pending: max_pending.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share a drop counter with other stages.
    pub fn with_drop_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.dropped = counter;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Queue an event. Returns `false` if it was dropped because the
    /// pending set is full and the path is not already pending.
    pub fn push(&mut self, event: WatchEvent, now: Instant) -> bool {
        if let Some(p) = self.pending.get_mut(&event.path) {
            p.event.kind = merge_kinds(p.event.kind, event.kind);
            p.event.observed_at = event.observed_at;
            p.last_seen = now;
            return true;
        }
        if self.pending.len() >= self.max_pending {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                path = %event.path.display(),
                pending = self.pending.len(),
                dropped_total = total,
                "debounce queue full, dropping event"
            );
            return false;
        }
        self.pending.insert(
            event.path.clone(),
            PendingEvent {
                event,
                last_seen: now,
            },
        );
        true
    }

    /// Remove and return every event quiet for at least the window,
    /// ordered by path.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<WatchEvent> {
        let window = self.window;
        let mut ready = Vec::new();
        self.pending.retain(|_, p| {
            if now.duration_since(p.last_seen) >= window {
                ready.push(p.event.clone());
                false
            } else {
                true
            }
        });
        ready.sort_by(|a, b| a.path.cmp(&b.path));
        ready
    }

    pub fn drain_all(&mut self) -> Vec<WatchEvent> {
        let mut all: Vec<WatchEvent> = self.pending.drain().map(|(_, p)| p.event).collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Pump `raw_rx` through `debouncer` into `tx` until either side closes.
pub async fn run_debouncer(
    mut raw_rx: mpsc::Receiver<WatchEvent>,
    tx: mpsc::Sender<WatchEvent>,
    mut debouncer: Debouncer,
) {
    let tick = (debouncer.window() / 2).clamp(Duration::from_millis(5), Duration::from_millis(50));

    loop {
        match tokio::time::timeout(tick, raw_rx.recv()).await {
            Ok(Some(event)) => {
                debouncer.push(event, Instant::now());
            }
            Ok(None) => {
                for event in debouncer.drain_all() {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                return;
            }
            Err(_) => {}
        }

        for event in debouncer.drain_ready(Instant::now()) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

// ─── Scanning ───

/// Which files under a root are ingestion input.
#[derive(Clone)]
pub struct ScanOptions {
    include: GlobSet,
    exclude: GlobSet,
    pub max_depth: usize,
    pub max_duration: Duration,
    pub follow_symlinks: bool,
    skip_dirs: Vec<PathBuf>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, WatcherError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl ScanOptions {
    /// `storage_dir` (where the database lives) is never scanned.
    pub fn from_config(config: &WatcherConfig, storage_dir: Option<&Path>) -> Result<Self, WatcherError> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            max_depth: config.max_depth,
            max_duration: Duration::from_secs(config.max_scan_secs),
            follow_symlinks: config.follow_symlinks,
            skip_dirs: storage_dir.map(normalize_path).into_iter().collect(),
        })
    }

    fn is_skipped_dir(&self, path: &Path) -> bool {
        self.skip_dirs.iter().any(|d| path.starts_with(d))
    }

    // `dir/**` patterns only match paths below the directory itself.
    fn excludes_dir(&self, relative: &Path) -> bool {
        self.exclude.is_match(relative) || self.exclude.is_match(relative.join("_"))
    }

    /// Whether `path` (under `root`) passes the storage-dir, exclude, and
    /// include rules.
    pub fn accepts(&self, root: &Path, path: &Path) -> bool {
        if self.is_skipped_dir(path) {
            return false;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        !self.exclude.is_match(relative) && self.include.is_match(relative)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub root: PathBuf,
    /// Accepted files, sorted by path. Partial if `timed_out`.
    pub files: Vec<ScannedFile>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Walk `root` and collect accepted files.
///
/// Bounded by `max_depth` and `max_duration`; on timeout the files seen so
/// far are returned with `timed_out = true`. Symlinked directories are
/// followed once: a canonical-path set breaks cycles.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<ScanReport, WatcherError> {
    let root = root
        .canonicalize()
        .map_err(|_| WatcherError::MissingRoot(root.to_path_buf()))?;
    let start = Instant::now();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut seen_files: HashSet<PathBuf> = HashSet::new();
    let mut files = Vec::new();
    let mut timed_out = false;

    let mut walker = WalkDir::new(&root)
        .max_depth(options.max_depth)
        .follow_links(options.follow_symlinks)
        .into_iter();

    while let Some(next) = walker.next() {
        if start.elapsed() >= options.max_duration {
            timed_out = true;
            break;
        }
        let entry = match next {
            Ok(e) => e,
            Err(e) => {
                if e.loop_ancestor().is_some() {
                    tracing::debug!("symlink cycle skipped: {}", e);
                } else {
                    tracing::warn!("scan error under {}: {}", root.display(), e);
                }
                continue;
            }
        };
        let path = entry.path();

        if entry.file_type().is_dir() {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            let relative = path.strip_prefix(&root).unwrap_or(path);
            let excluded = entry.depth() > 0 && options.excludes_dir(relative);
            if options.is_skipped_dir(&canonical) || excluded || !visited.insert(canonical) {
                walker.skip_current_dir();
            }
            continue;
        }
        if !entry.file_type().is_file() || !options.accepts(&root, path) {
            continue;
        }

        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !seen_files.insert(canonical.clone()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %path.display(), "metadata unavailable: {}", e);
                continue;
            }
        };
        files.push(ScannedFile {
            path: canonical,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    let elapsed = start.elapsed();
    if timed_out {
        let err = RetrievalError::ScanTimeout {
            elapsed,
            partial: files.len(),
        };
        tracing::warn!(root = %root.display(), "{}", err);
    }
    Ok(ScanReport {
        root,
        files,
        timed_out,
        elapsed,
    })
}

/// Events that bring the file store in line with `scan`.
///
/// New paths are `Added`; known paths whose size differs, or whose mtime
/// differs and whose content hash changed, are `Changed`; stored paths
/// under the root missing from a complete scan are `Deleted`. A timed-out
/// scan never produces deletions.
pub async fn reconcile_scan(scan: &ScanReport, files: &dyn FileStore) -> anyhow::Result<Vec<WatchEvent>> {
    let root = scan.root.to_string_lossy().to_string();
    let stored: HashMap<String, _> = files
        .list_files()
        .await?
        .into_iter()
        .filter(|f| Path::new(&f.path).starts_with(&scan.root))
        .map(|f| (f.path.clone(), f))
        .collect();

    let mut events = Vec::new();
    let mut present = HashSet::new();

    for file in &scan.files {
        let key = file.path.to_string_lossy().to_string();
        present.insert(key.clone());
        match stored.get(&key) {
            None => events.push(WatchEvent::new(&file.path, WatchEventKind::Added)),
            Some(record) if record.size != file.size => {
                events.push(WatchEvent::new(&file.path, WatchEventKind::Changed))
            }
            Some(record) if file.modified.is_some_and(|m| m != record.modified_at) => {
                if hash_on_disk(&file.path).await?.is_some_and(|h| h != record.hash) {
                    events.push(WatchEvent::new(&file.path, WatchEventKind::Changed));
                }
            }
            Some(_) => {}
        }
    }

    if !scan.timed_out {
        let mut gone: Vec<&String> = stored.keys().filter(|p| !present.contains(*p)).collect();
        gone.sort();
        events.extend(gone.into_iter().map(|p| WatchEvent::new(p, WatchEventKind::Deleted)));
    }

    tracing::debug!(root = %root, events = events.len(), "scan reconciled");
    Ok(events)
}

// ─── Live watcher ───

/// Settings for [`IngestionWatcher`].
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub roots: Vec<PathBuf>,
    pub debounce: Duration,
    pub max_pending: usize,
    pub channel_capacity: usize,
}

impl WatchSettings {
    pub fn from_config(config: &WatcherConfig) -> Self {
        Self {
            roots: config.roots.clone(),
            debounce: Duration::from_millis(config.debounce_ms),
            max_pending: config.max_pending,
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// Live filesystem watcher feeding debounced events to ingestion.
pub struct IngestionWatcher {
    settings: WatchSettings,
    options: ScanOptions,
    dropped: Arc<AtomicU64>,
    // Must stay alive for events to keep flowing.
    _watcher: Option<RecommendedWatcher>,
}

impl IngestionWatcher {
    pub fn new(settings: WatchSettings, options: ScanOptions) -> Self {
        Self {
            settings,
            options,
            dropped: Arc::new(AtomicU64::new(0)),
            _watcher: None,
        }
    }

    pub fn from_config(config: &WatcherConfig, storage_dir: Option<&Path>) -> Result<Self, WatcherError> {
        Ok(Self::new(
            WatchSettings::from_config(config),
            ScanOptions::from_config(config, storage_dir)?,
        ))
    }

    pub fn scan_options(&self) -> &ScanOptions {
        &self.options
    }

    /// Events dropped by the raw queue or the debouncer so far.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Scan every root and diff against `files`.
    pub async fn catch_up(&self, files: &dyn FileStore) -> anyhow::Result<Vec<WatchEvent>> {
        let mut events = Vec::new();
        for root in &self.settings.roots {
            let root = root.clone();
            let options = self.options.clone();
            let report = tokio::task::spawn_blocking(move || scan(&root, &options)).await??;
            tracing::info!(
                root = %report.root.display(),
                files = report.files.len(),
                timed_out = report.timed_out,
                elapsed = ?report.elapsed,
                "scan complete"
            );
            events.extend(reconcile_scan(&report, files).await?);
        }
        Ok(events)
    }

    /// Start watching every root. Returns the debounced event stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> Result<mpsc::Receiver<WatchEvent>, WatcherError> {
        let capacity = self.settings.channel_capacity;
        let (raw_tx, raw_rx) = mpsc::channel::<WatchEvent>(capacity);
        let (tx, rx) = mpsc::channel::<WatchEvent>(capacity);

        let mut roots = Vec::new();
        for root in &self.settings.roots {
            roots.push(
                root.canonicalize()
                    .map_err(|_| WatcherError::MissingRoot(root.clone()))?,
            );
        }

        let options = self.options.clone();
        let callback_roots = roots.clone();
        let dropped = Arc::clone(&self.dropped);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    for ev in convert_event(event, &callback_roots, &options) {
                        if raw_tx.try_send(ev).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("watch event queue full, dropping event");
                        }
                    }
                }
                Err(e) => tracing::warn!("watch error: {}", e),
            }
        })
        .map_err(|e| WatcherError::Create(e.to_string()))?;

        for root in &roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| WatcherError::Watch {
                    path: root.clone(),
                    reason: e.to_string(),
                })?;
        }
        self._watcher = Some(watcher);

        let debouncer = Debouncer::new(self.settings.debounce, self.settings.max_pending)
            .with_drop_counter(Arc::clone(&self.dropped));
        tokio::spawn(run_debouncer(raw_rx, tx, debouncer));

        tracing::info!(roots = ?roots, debounce = ?self.settings.debounce, "watching");
        Ok(rx)
    }

    pub fn stop(&mut self) {
        self._watcher = None;
        tracing::info!("stopped watching");
    }
}

/// Map a `notify` event onto accepted paths.
fn convert_event(event: Event, roots: &[PathBuf], options: &ScanOptions) -> Vec<WatchEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => WatchEventKind::Added,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchEventKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::Added,
        EventKind::Modify(_) => WatchEventKind::Changed,
        EventKind::Remove(_) => WatchEventKind::Deleted,
        _ => return Vec::new(),
    };

    // A two-path rename event carries (from, to).
    let is_rename_pair = matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
        && event.paths.len() == 2;

    event
        .paths
        .into_iter()
        .enumerate()
        .filter_map(|(i, path)| {
            let kind = match (is_rename_pair, i) {
                (true, 0) => WatchEventKind::Deleted,
                (true, _) => WatchEventKind::Added,
                _ => kind,
            };
            if kind != WatchEventKind::Deleted && path.is_dir() {
                return None;
            }
            let root = roots.iter().find(|r| path.starts_with(r))?;
            options
                .accepts(root, &path)
                .then(|| WatchEvent::new(path, kind))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use recall_harness_core::files::InMemoryFileStore;
    use recall_harness_core::models::FileRecord;
    use tempfile::TempDir;

    fn ev(path: &str, kind: WatchEventKind) -> WatchEvent {
        WatchEvent::new(path, kind)
    }

    #[test]
    fn test_merge_rules() {
        use WatchEventKind::*;
        assert_eq!(merge_kinds(Added, Changed), Added);
        assert_eq!(merge_kinds(Changed, Deleted), Deleted);
        assert_eq!(merge_kinds(Added, Deleted), Deleted);
        assert_eq!(merge_kinds(Deleted, Added), Changed);
        assert_eq!(merge_kinds(Changed, Changed), Changed);
    }

    #[test]
    fn test_debounce_coalesces_burst() {
        let mut d = Debouncer::new(Duration::from_millis(300), 100);
        let t0 = Instant::now();
        d.push(ev("/a.md", WatchEventKind::Added), t0);
        d.push(ev("/a.md", WatchEventKind::Changed), t0 + Duration::from_millis(100));
        d.push(ev("/a.md", WatchEventKind::Changed), t0 + Duration::from_millis(200));

        assert!(d.drain_ready(t0 + Duration::from_millis(400)).is_empty());
        let ready = d.drain_ready(t0 + Duration::from_millis(500));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].kind, WatchEventKind::Added);
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn test_debounce_ceiling_drops_new_paths() {
        let mut d = Debouncer::new(Duration::from_millis(10), 2);
        let now = Instant::now();
        assert!(d.push(ev("/a", WatchEventKind::Added), now));
        assert!(d.push(ev("/b", WatchEventKind::Added), now));
        assert!(!d.push(ev("/c", WatchEventKind::Added), now));
        assert!(d.push(ev("/a", WatchEventKind::Changed), now));
        assert_eq!(d.dropped_events(), 1);
        assert_eq!(d.drain_all().len(), 2);
    }

    #[tokio::test]
    async fn test_run_debouncer_emits_once() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(run_debouncer(raw_rx, tx, Debouncer::new(Duration::from_millis(50), 100)));

        for _ in 0..5 {
            raw_tx.send(ev("/x.md", WatchEventKind::Changed)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.path, PathBuf::from("/x.md"));
        drop(raw_tx);
        assert!(rx.recv().await.is_none());
    }

    fn options(tmp: &Path, storage: Option<&Path>) -> ScanOptions {
        let config = WatcherConfig {
            roots: vec![tmp.to_path_buf()],
            exclude_globs: vec!["**/skip/**".to_string()],
            ..WatcherConfig::default()
        };
        ScanOptions::from_config(&config, storage).unwrap()
    }

    #[test]
    fn test_scan_filters_and_skips_storage() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("docs/skip")).unwrap();
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join("docs/a.md"), "a").unwrap();
        std::fs::write(root.join("docs/b.rs"), "b").unwrap();
        std::fs::write(root.join("docs/skip/c.md"), "c").unwrap();
        std::fs::write(root.join("data/d.md"), "d").unwrap();

        let report = scan(root, &options(root, Some(&root.join("data")))).unwrap();
        let names: Vec<String> = report
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.md"]);
        assert!(!report.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_survives_symlink_cycle() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/a.md"), "a").unwrap();
        std::os::unix::fs::symlink(root, root.join("sub/loop")).unwrap();

        let report = scan(root, &options(root, None)).unwrap();
        assert_eq!(report.files.len(), 1);
    }

    #[test]
    fn test_scan_timeout_returns_partial() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "a").unwrap();
        let mut opts = options(tmp.path(), None);
        opts.max_duration = Duration::ZERO;
        let report = scan(tmp.path(), &opts).unwrap();
        assert!(report.timed_out);
    }

    #[tokio::test]
    async fn test_reconcile_scan_diffs_store() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::write(root.join("new.md"), "new").unwrap();
        std::fs::write(root.join("same.md"), "same").unwrap();

        let store = InMemoryFileStore::new();
        let same_meta = std::fs::metadata(root.join("same.md")).unwrap();
        let record = |name: &str, size: u64, modified: DateTime<Utc>| FileRecord {
            id: name.to_string(),
            path: root.join(name).to_string_lossy().to_string(),
            name: name.to_string(),
            size,
            hash: recall_harness_core::chunk::hash_bytes(b"same"),
            created_at: Utc::now(),
            modified_at: modified,
        };
        store
            .upsert_file(&record("same.md", 4, DateTime::<Utc>::from(same_meta.modified().unwrap())))
            .await
            .unwrap();
        store.upsert_file(&record("gone.md", 3, Utc::now())).await.unwrap();

        let report = scan(&root, &options(&root, None)).unwrap();
        let events = reconcile_scan(&report, &store).await.unwrap();
        let summary: Vec<(String, WatchEventKind)> = events
            .iter()
            .map(|e| (e.path.file_name().unwrap().to_string_lossy().to_string(), e.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("new.md".to_string(), WatchEventKind::Added),
                ("gone.md".to_string(), WatchEventKind::Deleted),
            ]
        );
    }

    #[tokio::test]
    async fn test_live_events_reach_ingestion() {
        use crate::embedding::{EmbeddingBackend, EmbeddingGateway, GatewayPolicy, HashedBackend};
        use crate::ingest::Ingestor;
        use recall_harness_core::index::memory::InMemoryIndex;
        use recall_harness_core::index::VectorIndex;

        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let config = WatcherConfig {
            roots: vec![root.clone()],
            debounce_ms: 50,
            ..WatcherConfig::default()
        };
        let mut watcher = IngestionWatcher::from_config(&config, None).unwrap();

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
            Arc::new(tokio::sync::Mutex::new(())),
            100,
        ));

        let rx = watcher.start().unwrap();
        let task = tokio::spawn(Arc::clone(&ingestor).run(rx));

        std::fs::write(root.join("note.md"), "live watcher content").unwrap();
        std::fs::write(root.join("ignored.bin"), "not an included type").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let listed = loop {
            let listed = files.list_files().await.unwrap();
            if !listed.is_empty() {
                break listed;
            }
            assert!(Instant::now() < deadline, "created file was never indexed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "note.md");
        assert_eq!(index.len().await, 1);

        std::fs::remove_file(root.join("note.md")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !files.list_files().await.unwrap().is_empty() {
            assert!(Instant::now() < deadline, "deleted file was never removed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(index.is_empty().await);

        watcher.stop();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
