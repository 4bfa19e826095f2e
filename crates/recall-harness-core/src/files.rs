//! The authoritative file/metadata store contract.
//!
//! The consistency manager reconciles the vector index against this store;
//! ingestion creates, updates, and removes [`FileRecord`]s through it. An
//! in-memory implementation is provided for tests and embedded use; the
//! app crate adds a SQLite-backed one.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::FileRecord;

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Every known file, ordered by path.
    async fn list_files(&self) -> Result<Vec<FileRecord>>;

    async fn get_file_by_id(&self, id: &str) -> Result<Option<FileRecord>>;

    async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Insert or replace a record, keyed by `id`. Paths stay unique: an
    /// existing record with the same path and a different id is replaced.
    async fn upsert_file(&self, file: &FileRecord) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn remove_file(&self, id: &str) -> Result<bool>;
}

/// In-memory [`FileStore`].
#[derive(Default)]
pub struct InMemoryFileStore {
    files: RwLock<HashMap<String, FileRecord>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<FileRecord> = files.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }

    async fn get_file_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files.get(id).cloned())
    }

    async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        Ok(files.values().find(|f| f.path == path).cloned())
    }

    async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.retain(|id, f| f.path != file.path || *id == file.id);
        files.insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn remove_file(&self, id: &str) -> Result<bool> {
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        Ok(files.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn file(id: &str, path: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size: 1,
            hash: "h".to_string(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let store = InMemoryFileStore::new();
        store.upsert_file(&file("1", "/b.md")).await.unwrap();
        store.upsert_file(&file("2", "/a.md")).await.unwrap();

        let listed = store.list_files().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, "/a.md");
        assert_eq!(store.get_file_by_path("/b.md").await.unwrap().unwrap().id, "1");
        assert!(store.get_file_by_id("3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_stays_unique() {
        let store = InMemoryFileStore::new();
        store.upsert_file(&file("1", "/a.md")).await.unwrap();
        store.upsert_file(&file("2", "/a.md")).await.unwrap();
        let listed = store.list_files().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "2");
    }

    #[tokio::test]
    async fn test_remove() {
        let store = InMemoryFileStore::new();
        store.upsert_file(&file("1", "/a.md")).await.unwrap();
        assert!(store.remove_file("1").await.unwrap());
        assert!(!store.remove_file("1").await.unwrap());
    }
}
