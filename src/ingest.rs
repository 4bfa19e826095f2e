//! File ingestion: read → hash → chunk → embed → index.
//!
//! The [`Ingestor`] owns the write path into the vector index. A file's
//! vectors are swapped in one index write
//! ([`replace_documents_for_file`](VectorIndex::replace_documents_for_file))
//! while holding the engine's mutation lock, so concurrent searches see
//! either the old or the new set of chunks for a file. The file record is
//! written only after the index accepted the new vectors; a rejected batch
//! leaves both the old vectors and the old record in place.
//!
//! Embedding happens before the lock is taken. If it fails, the file's
//! stale vectors are dropped and its record is updated, so the file is an
//! orphaned file that the consistency manager re-ingests later.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use recall_harness_core::chunk::{chunk_text, hash_bytes};
use recall_harness_core::files::FileStore;
use recall_harness_core::index::VectorIndex;
use recall_harness_core::models::{FileRecord, VectorRecord};
use recall_harness_core::Result;

use crate::consistency::ErrorTracker;
use crate::embedding::EmbeddingGateway;
use crate::watcher::{WatchEvent, WatchEventKind};

/// What [`Ingestor::ingest_path`] did with a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Chunks embedded and indexed.
    Indexed { file_id: String, chunks: usize },
    /// Same content hash as the stored record, vectors present.
    Unchanged { file_id: String },
    /// No text to index; the record is kept with zero vectors.
    Empty { file_id: String },
}

impl IngestOutcome {
    pub fn file_id(&self) -> &str {
        match self {
            IngestOutcome::Indexed { file_id, .. }
            | IngestOutcome::Unchanged { file_id }
            | IngestOutcome::Empty { file_id } => file_id,
        }
    }
}

/// Absolute form of `path`, resolving symlinks where the file still exists.
///
/// For a deleted file the parent directory is resolved instead, so the
/// result matches what was stored when the file was ingested.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// SHA-256 of the file currently on disk, `None` if it is gone.
pub async fn hash_on_disk(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(hash_bytes(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub struct Ingestor {
    index: Arc<dyn VectorIndex>,
    files: Arc<dyn FileStore>,
    embedder: Arc<EmbeddingGateway>,
    write_lock: Arc<Mutex<()>>,
    max_tokens: usize,
    errors: Option<Arc<ErrorTracker>>,
}

impl Ingestor {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        files: Arc<dyn FileStore>,
        embedder: Arc<EmbeddingGateway>,
        write_lock: Arc<Mutex<()>>,
        max_tokens: usize,
    ) -> Self {
        Self {
            index,
            files,
            embedder,
            write_lock,
            max_tokens,
            errors: None,
        }
    }

    pub fn with_error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.errors = Some(tracker);
        self
    }

    fn record_error(&self, context: &str) {
        if let Some(tracker) = &self.errors {
            tracker.record_error(context);
        }
    }

    /// Index (or re-index) the file at `path`.
    ///
    /// Skips embedding when the stored hash matches and vectors exist,
    /// unless `force` is set.
    pub async fn ingest_path(&self, path: &Path, force: bool) -> Result<IngestOutcome> {
        let result = self.ingest_inner(path, force).await;
        if let Err(e) = &result {
            warn!(path = %path.display(), "ingestion failed: {}", e);
            self.record_error("ingest");
        }
        result
    }

    async fn ingest_inner(&self, path: &Path, force: bool) -> Result<IngestOutcome> {
        let path = normalize_path(path);
        let path_str = path.to_string_lossy().to_string();

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let meta = tokio::fs::metadata(&path).await?;
        let hash = hash_bytes(&bytes);
        let text = String::from_utf8_lossy(&bytes);

        let existing = self.files.get_file_by_path(&path_str).await?;
        let file_id = existing
            .as_ref()
            .map(|f| f.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let chunks = chunk_text(&file_id, &text, self.max_tokens);

        if let Some(prev) = &existing {
            let has_vectors = self.index.file_ids().await.contains_key(&file_id);
            if !force && prev.hash == hash && (has_vectors || chunks.is_empty()) {
                debug!(path = %path_str, "unchanged, skipping");
                return Ok(IngestOutcome::Unchanged { file_id });
            }
        }

        let now = Utc::now();
        let record = FileRecord {
            id: file_id.clone(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path_str.clone()),
            path: path_str.clone(),
            size: meta.len(),
            hash,
            created_at: existing
                .as_ref()
                .map(|f| f.created_at)
                .or_else(|| meta.created().ok().map(DateTime::<Utc>::from))
                .unwrap_or(now),
            modified_at: meta.modified().map(DateTime::<Utc>::from).unwrap_or(now),
        };

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = match self.embedder.embed_documents(&texts).await {
            Ok(v) => v,
            Err(e) => {
                let _guard = self.write_lock.lock().await;
                self.index.replace_documents_for_file(&file_id, Vec::new()).await?;
                self.files.upsert_file(&record).await?;
                return Err(e);
            }
        };

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, &record, embedding))
            .collect();
        let count = records.len();

        let _guard = self.write_lock.lock().await;
        self.index.replace_documents_for_file(&file_id, records).await?;
        self.files.upsert_file(&record).await?;
        if count == 0 {
            debug!(path = %path_str, "empty file, no chunks");
            return Ok(IngestOutcome::Empty { file_id });
        }
        info!(path = %path_str, chunks = count, "indexed");
        Ok(IngestOutcome::Indexed {
            file_id,
            chunks: count,
        })
    }

    /// Remove a file's record and vectors. Returns the vectors removed.
    pub async fn remove_file_id(&self, file_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let removed = self.index.delete_documents_by_file_id(file_id).await?;
        self.files.remove_file(file_id).await?;
        Ok(removed)
    }

    /// Drop vectors whose file has no record. Returns the count removed.
    ///
    /// A no-op if a record for `file_id` appeared since the caller looked.
    pub async fn remove_vectors(&self, file_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        if self.files.get_file_by_id(file_id).await?.is_some() {
            return Ok(0);
        }
        self.index.delete_documents_by_file_id(file_id).await
    }

    /// Empty the index, exclusive with every other write.
    pub async fn clear_index(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.index.rebuild_index().await
    }

    /// Remove whatever is stored for `path`. `None` if nothing was.
    pub async fn remove_path(&self, path: &Path) -> Result<Option<usize>> {
        let path_str = normalize_path(path).to_string_lossy().to_string();
        match self.files.get_file_by_path(&path_str).await? {
            Some(file) => {
                let removed = self.remove_file_id(&file.id).await?;
                info!(path = %path_str, vectors = removed, "removed");
                Ok(Some(removed))
            }
            None => Ok(None),
        }
    }

    /// Apply one watcher event.
    pub async fn handle_event(&self, event: &WatchEvent) -> Result<()> {
        match event.kind {
            WatchEventKind::Added | WatchEventKind::Changed => {
                self.ingest_path(&event.path, false).await?;
            }
            WatchEventKind::Deleted => {
                if let Err(e) = self.remove_path(&event.path).await {
                    self.record_error("remove");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Consume watcher events until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WatchEvent>) {
        while let Some(event) = rx.recv().await {
            debug!(path = %event.path.display(), kind = ?event.kind, "event");
            if let Err(e) = self.handle_event(&event).await {
                warn!(path = %event.path.display(), "failed to apply {:?}: {}", event.kind, e);
            }
        }
        debug!("event channel closed, ingestion loop exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingBackend, GatewayPolicy, HashedBackend};
    use recall_harness_core::files::InMemoryFileStore;
    use recall_harness_core::index::memory::InMemoryIndex;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn ingestor() -> (Ingestor, Arc<dyn VectorIndex>, Arc<dyn FileStore>) {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new());
        let files: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
        let ing = ingestor_over(Arc::clone(&index), Arc::clone(&files), 32).await;
        (ing, index, files)
    }

    async fn ingestor_over(index: Arc<dyn VectorIndex>, files: Arc<dyn FileStore>, dims: usize) -> Ingestor {
        let policy = GatewayPolicy {
            probe_attempts: 1,
            probe_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(2),
            probe_cooldown: Duration::ZERO,
            batch_size: 8,
            auto_rebuild_on_model_change: false,
        };
        let gateway = EmbeddingGateway::connect(
            vec![Arc::new(HashedBackend::new(dims)) as Arc<dyn EmbeddingBackend>],
            policy,
        )
        .await;
        Ingestor::new(index, files, Arc::new(gateway), Arc::new(Mutex::new(())), 50)
    }

    #[tokio::test]
    async fn test_ingest_then_skip_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.md");
        std::fs::write(&path, "first paragraph\n\nsecond paragraph").unwrap();
        let (ing, index, files) = ingestor().await;

        let first = ing.ingest_path(&path, false).await.unwrap();
        assert!(matches!(first, IngestOutcome::Indexed { chunks: 1, .. }));
        assert_eq!(files.list_files().await.unwrap().len(), 1);
        assert_eq!(index.len().await, 1);

        let second = ing.ingest_path(&path, false).await.unwrap();
        assert_eq!(second, IngestOutcome::Unchanged { file_id: first.file_id().to_string() });
    }

    #[tokio::test]
    async fn test_change_replaces_vectors_and_keeps_id() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.md");
        let para = "word ".repeat(40);
        std::fs::write(&path, format!("{}\n\n{}\n\n{}", para, para, para)).unwrap();
        let (ing, index, _files) = ingestor().await;

        let first = ing.ingest_path(&path, false).await.unwrap();
        assert!(index.len().await >= 2);

        std::fs::write(&path, "short now").unwrap();
        let second = ing.ingest_path(&path, false).await.unwrap();
        assert_eq!(first.file_id(), second.file_id());
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_file_has_record_but_no_vectors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, "").unwrap();
        let (ing, index, files) = ingestor().await;

        let outcome = ing.ingest_path(&path, false).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Empty { .. }));
        assert_eq!(files.list_files().await.unwrap().len(), 1);
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_path_after_delete() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.md");
        std::fs::write(&path, "soon deleted").unwrap();
        let (ing, index, files) = ingestor().await;
        ing.ingest_path(&path, false).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        assert_eq!(ing.remove_path(&path).await.unwrap(), Some(1));
        assert!(index.is_empty().await);
        assert!(files.list_files().await.unwrap().is_empty());
        assert_eq!(ing.remove_path(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_reingest_keeps_old_vectors_and_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.md");
        std::fs::write(&path, "original text").unwrap();
        let (ing, index, files) = ingestor().await;
        let file_id = ing.ingest_path(&path, false).await.unwrap().file_id().to_string();
        let before = files.get_file_by_id(&file_id).await.unwrap().unwrap();

        std::fs::write(&path, "rewritten text").unwrap();
        let narrower = ingestor_over(Arc::clone(&index), Arc::clone(&files), 16).await;
        assert!(narrower.ingest_path(&path, false).await.is_err());

        assert_eq!(index.file_ids().await[&file_id].len(), 1);
        assert_eq!(index.all_records().await[0].content, "original text");
        assert_eq!(files.get_file_by_id(&file_id).await.unwrap().unwrap().hash, before.hash);
    }

    #[tokio::test]
    async fn test_stale_vector_removal_skips_files_with_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.md");
        std::fs::write(&path, "kept").unwrap();
        let (ing, index, _files) = ingestor().await;
        let file_id = ing.ingest_path(&path, false).await.unwrap().file_id().to_string();

        assert_eq!(ing.remove_vectors(&file_id).await.unwrap(), 0);
        assert_eq!(index.len().await, 1);
    }
}
