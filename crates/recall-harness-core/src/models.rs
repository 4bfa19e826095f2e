//! Core data models used throughout Recall Harness.
//!
//! These types represent the files, chunks, indexed vectors, and search
//! results that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build the record id for a chunk: `"{file_id}:{chunk_index}"`.
pub fn record_id(file_id: &str, chunk_index: usize) -> String {
    format!("{}:{}", file_id, chunk_index)
}

/// A chunk ready for embedding, as produced by ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInput {
    pub file_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub content: String,
    /// SHA-256 of `content`.
    pub hash: String,
}

/// Metadata carried by every [`VectorRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
    pub file_hash: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One embedded chunk stored in a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub content: String,
    pub metadata: RecordMetadata,
}

impl VectorRecord {
    /// Assemble a record for `chunk` owned by `file`.
    pub fn from_chunk(chunk: &ChunkInput, file: &FileRecord, embedding: Vec<f32>) -> Self {
        Self {
            id: record_id(&chunk.file_id, chunk.chunk_index),
            embedding,
            content: chunk.content.clone(),
            metadata: RecordMetadata {
                file_id: chunk.file_id.clone(),
                file_name: file.name.clone(),
                file_path: file.path.clone(),
                file_type: file.file_type(),
                file_hash: file.hash.clone(),
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                ..Default::default()
            },
        }
    }
}

/// Authoritative description of one ingested file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Absolute path; unique across the store.
    pub path: String,
    pub name: String,
    pub size: u64,
    /// SHA-256 content fingerprint.
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl FileRecord {
    /// Lowercased extension, or `"unknown"`.
    pub fn file_type(&self) -> String {
        std::path::Path::new(&self.path)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Derived, read-only index statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub total_slots: usize,
    pub occupied_slots: usize,
    /// `(total - occupied) / total`, `0.0` for an empty index.
    pub sparsity: f64,
    pub dimension: Option<usize>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    /// Final score of the stage that produced this ordering.
    pub score: f32,
    pub metadata: RecordMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f32>,
}

/// Outcome of one integrity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    /// Record ids whose `file_id` is absent from the file store.
    pub orphaned_vector_ids: Vec<String>,
    /// Files that should have vectors but have none.
    pub orphaned_file_ids: Vec<String>,
    pub total_vectors: usize,
    pub total_files: usize,
    pub last_checked_at: DateTime<Utc>,
    pub auto_fix_applied: bool,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned_vector_ids.is_empty() && self.orphaned_file_ids.is_empty()
    }
}

/// Name and dimensionality of the active embedding model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub dimensions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> FileRecord {
        FileRecord {
            id: "f1".to_string(),
            path: path.to_string(),
            name: "notes.MD".to_string(),
            size: 10,
            hash: "abc".to_string(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_id_format() {
        assert_eq!(record_id("file-1", 3), "file-1:3");
    }

    #[test]
    fn test_file_type_from_extension() {
        assert_eq!(file("/docs/notes.MD").file_type(), "md");
        assert_eq!(file("/docs/Makefile").file_type(), "unknown");
    }

    #[test]
    fn test_from_chunk_copies_file_fields() {
        let chunk = ChunkInput {
            file_id: "f1".to_string(),
            chunk_index: 1,
            total_chunks: 2,
            content: "second".to_string(),
            hash: "h".to_string(),
        };
        let rec = VectorRecord::from_chunk(&chunk, &file("/docs/notes.md"), vec![1.0, 0.0]);
        assert_eq!(rec.id, "f1:1");
        assert_eq!(rec.metadata.file_path, "/docs/notes.md");
        assert_eq!(rec.metadata.file_hash, "abc");
        assert_eq!(rec.metadata.total_chunks, 2);
    }
}
