//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines every operation the search pipeline,
//! ingestion, and consistency manager need from an index, so backends can
//! be swapped at construction time without duplicating business logic.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`add_documents`](VectorIndex::add_documents) | Atomically insert a validated batch |
//! | [`search`](VectorIndex::search) | Cosine similarity search with filtering |
//! | [`delete_documents_by_file_id`](VectorIndex::delete_documents_by_file_id) | Remove all records of a file |
//! | [`replace_documents_for_file`](VectorIndex::replace_documents_for_file) | Swap a file's records in one step |
//! | [`get_index_info`](VectorIndex::get_index_info) | Derived [`IndexStats`] |
//! | [`compact`](VectorIndex::compact) | Reclaim tombstoned slots |
//! | [`rebuild_index`](VectorIndex::rebuild_index) | Clear everything, forget the dimension |

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexStats, RecordMetadata, VectorRecord};

/// Sparsity above which deletions trigger compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.3;

/// Statically declared optional capabilities of an index backend.
///
/// Callers branch on these flags instead of probing for methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCapabilities {
    /// `rebuild_index` clears state and accepts a new dimension.
    pub rebuild: bool,
    /// `compact` reclaims space.
    pub compaction: bool,
    /// `all_records` returns a complete snapshot suitable for persistence.
    pub snapshot: bool,
}

type Predicate = dyn Fn(&RecordMetadata) -> anyhow::Result<bool> + Send + Sync;

/// A metadata predicate applied before scoring.
///
/// A predicate that returns `Err` excludes the record; it never fails the
/// search call.
#[derive(Clone)]
pub struct MetadataFilter {
    label: String,
    predicate: Arc<Predicate>,
}

impl MetadataFilter {
    pub fn new<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&RecordMetadata) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn file_id(file_id: impl Into<String>) -> Self {
        let file_id = file_id.into();
        Self::new(format!("file_id={}", file_id), move |m| Ok(m.file_id == file_id))
    }

    pub fn file_type(file_type: impl Into<String>) -> Self {
        let file_type = file_type.into().to_lowercase();
        Self::new(format!("file_type={}", file_type), move |m| {
            Ok(m.file_type == file_type)
        })
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self::new(format!("tag={}", tag), move |m| Ok(m.tags.contains(&tag)))
    }

    pub fn category(category: impl Into<String>) -> Self {
        let category = category.into();
        Self::new(format!("category={}", category), move |m| {
            Ok(m.category.as_deref() == Some(category.as_str()))
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Evaluate the predicate; errors count as "excluded".
    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        match (self.predicate)(metadata) {
            Ok(keep) => keep,
            Err(e) => {
                tracing::debug!(filter = %self.label, record = %metadata.file_id, "filter error, excluding record: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for MetadataFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataFilter")
            .field("label", &self.label)
            .finish()
    }
}

/// Parameters of one index search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub top_k: usize,
    /// Minimum score (inclusive). `None` keeps every score.
    pub score_threshold: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

impl SearchParams {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            score_threshold: None,
            filter: None,
        }
    }

    pub(crate) fn admits(&self, metadata: &RecordMetadata) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(metadata))
    }

    pub(crate) fn passes_threshold(&self, score: f32) -> bool {
        self.score_threshold.map_or(true, |t| score >= t)
    }
}

/// A record paired with the score it received for one query.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: Arc<VectorRecord>,
    pub score: f32,
}

/// Abstract vector index backend.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Backend identifier for logs and stats (e.g. `"memory"`).
    fn name(&self) -> &str;

    fn capabilities(&self) -> IndexCapabilities;

    /// Insert a batch of records atomically.
    ///
    /// The whole batch is rejected with a configuration error if any record
    /// has empty content, an empty `file_id`, or an embedding whose length
    /// disagrees with the established dimension. Records whose id already
    /// exists replace the previous version. Returns the number inserted.
    async fn add_documents(&self, records: Vec<VectorRecord>) -> Result<usize>;

    /// Rank records by cosine similarity to `query`.
    ///
    /// Ties keep insertion order. An empty index returns no results.
    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<ScoredRecord>>;

    /// Remove every record of `file_id`. Idempotent; returns the count removed.
    async fn delete_documents_by_file_id(&self, file_id: &str) -> Result<usize>;

    /// Replace every record of `file_id` with `records` in one write.
    ///
    /// The batch is validated as in [`add_documents`](Self::add_documents)
    /// and every record must belong to `file_id`. On rejection the file's
    /// previous records stay in place. An empty batch removes them.
    /// Returns the number inserted.
    async fn replace_documents_for_file(&self, file_id: &str, records: Vec<VectorRecord>) -> Result<usize>;

    async fn get_index_info(&self) -> IndexStats;

    /// Reclaim tombstoned slots. Returns the number of slots reclaimed.
    async fn compact(&self) -> Result<usize>;

    /// Drop every record and forget the established dimension.
    async fn rebuild_index(&self) -> Result<()>;

    /// Record ids grouped by file id.
    async fn file_ids(&self) -> BTreeMap<String, Vec<String>>;

    /// Every live record, in insertion order.
    async fn all_records(&self) -> Vec<Arc<VectorRecord>>;

    /// Number of live records.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Token-overlap search over record content, used when no query
    /// embedding is available.
    async fn keyword_search(&self, query: &str, params: &SearchParams) -> Result<Vec<ScoredRecord>> {
        let records = self.all_records().await;
        Ok(crate::search::keyword_rank(query, &records, params))
    }
}
