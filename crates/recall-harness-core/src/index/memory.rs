//! In-memory [`VectorIndex`] implementation.
//!
//! Records live in a slot vector behind a single `std::sync::RwLock`.
//! Deletions leave tombstones (`None` slots) so slot order always equals
//! insertion order; [`compact`](VectorIndex::compact) squeezes them out
//! once sparsity crosses the configured threshold. Vector search is
//! brute-force cosine similarity over all live slots.
//!
//! Records are shared as `Arc<VectorRecord>`: a search that overlaps a
//! mutation sees each record either before or after it, never torn.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::error::{Result, RetrievalError};
use crate::models::{IndexStats, VectorRecord};

use super::{
    IndexCapabilities, ScoredRecord, SearchParams, VectorIndex, DEFAULT_COMPACTION_THRESHOLD,
};

#[derive(Default)]
struct Slots {
    slots: Vec<Option<Arc<VectorRecord>>>,
    by_id: HashMap<String, usize>,
    occupied: usize,
    dimension: Option<usize>,
    last_updated: Option<DateTime<Utc>>,
}

impl Slots {
    fn sparsity(&self) -> f64 {
        if self.slots.is_empty() {
            0.0
        } else {
            (self.slots.len() - self.occupied) as f64 / self.slots.len() as f64
        }
    }

    fn tombstone(&mut self, slot: usize) {
        if self.slots[slot].take().is_some() {
            self.occupied -= 1;
        }
    }

    /// Tombstone every record of `file_id`. Returns the count removed.
    fn remove_file(&mut self, file_id: &str) -> usize {
        let doomed: Vec<(String, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.as_ref()
                    .filter(|r| r.metadata.file_id == file_id)
                    .map(|r| (r.id.clone(), i))
            })
            .collect();
        for (id, slot) in &doomed {
            self.tombstone(*slot);
            self.by_id.remove(id);
        }
        doomed.len()
    }

    /// Append an already validated batch.
    fn insert(&mut self, records: Vec<VectorRecord>, dims: usize) -> usize {
        let count = records.len();
        for rec in records {
            if let Some(old) = self.by_id.get(&rec.id).copied() {
                self.tombstone(old);
            }
            let slot = self.slots.len();
            self.by_id.insert(rec.id.clone(), slot);
            self.slots.push(Some(Arc::new(rec)));
            self.occupied += 1;
        }
        self.dimension = Some(dims);
        self.last_updated = Some(Utc::now());
        count
    }

    fn compact(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(Option::is_some);
        self.by_id = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (r.id.clone(), i)))
            .collect();
        before - self.slots.len()
    }
}

/// In-memory vector index.
pub struct InMemoryIndex {
    inner: RwLock<Slots>,
    compaction_threshold: f64,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::with_compaction_threshold(DEFAULT_COMPACTION_THRESHOLD)
    }

    pub fn with_compaction_threshold(threshold: f64) -> Self {
        Self {
            inner: RwLock::new(Slots::default()),
            compaction_threshold: threshold,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn maybe_compact(&self, slots: &mut Slots) {
        if slots.sparsity() > self.compaction_threshold {
            let reclaimed = slots.compact();
            tracing::debug!(reclaimed, "compacted in-memory index");
        }
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a batch against the established dimension. Returns the batch dimension.
fn validate_batch(records: &[VectorRecord], established: Option<usize>) -> Result<usize> {
    let expected = established.unwrap_or(records[0].embedding.len());
    if expected == 0 {
        return Err(RetrievalError::configuration("embedding dimension must be > 0"));
    }

    let mut seen = HashSet::with_capacity(records.len());
    for rec in records {
        if rec.content.is_empty() {
            return Err(RetrievalError::configuration(format!(
                "record {} has empty content",
                rec.id
            )));
        }
        if rec.metadata.file_id.is_empty() {
            return Err(RetrievalError::configuration(format!(
                "record {} is missing file_id",
                rec.id
            )));
        }
        if rec.embedding.len() != expected {
            return Err(RetrievalError::configuration(format!(
                "dimension mismatch for record {}: expected {}, got {}",
                rec.id,
                expected,
                rec.embedding.len()
            )));
        }
        if rec.embedding.iter().any(|x| !x.is_finite()) {
            return Err(RetrievalError::configuration(format!(
                "record {} has non-finite embedding values",
                rec.id
            )));
        }
        if !seen.insert(rec.id.as_str()) {
            return Err(RetrievalError::configuration(format!(
                "duplicate record id {} in batch",
                rec.id
            )));
        }
    }
    Ok(expected)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> IndexCapabilities {
        IndexCapabilities {
            rebuild: true,
            compaction: true,
            snapshot: true,
        }
    }

    async fn add_documents(&self, records: Vec<VectorRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut slots = self.write();
        let dims = validate_batch(&records, slots.dimension)?;
        let count = slots.insert(records, dims);
        self.maybe_compact(&mut slots);
        Ok(count)
    }

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<ScoredRecord>> {
        let slots = self.read();
        let dims = match slots.dimension {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        if query.len() != dims {
            return Err(RetrievalError::configuration(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                dims
            )));
        }
        if params.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<ScoredRecord> = slots
            .slots
            .iter()
            .flatten()
            .filter(|rec| params.admits(&rec.metadata))
            .filter_map(|rec| {
                let score = cosine_similarity(query, &rec.embedding);
                params.passes_threshold(score).then(|| ScoredRecord {
                    record: Arc::clone(rec),
                    score,
                })
            })
            .collect();
        drop(slots);

        // `sort_by` is stable: equal scores keep insertion order.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(params.top_k);
        Ok(scored)
    }

    async fn delete_documents_by_file_id(&self, file_id: &str) -> Result<usize> {
        let mut slots = self.write();
        let removed = slots.remove_file(file_id);
        if removed == 0 {
            return Ok(0);
        }
        slots.last_updated = Some(Utc::now());
        self.maybe_compact(&mut slots);
        Ok(removed)
    }

    async fn replace_documents_for_file(&self, file_id: &str, records: Vec<VectorRecord>) -> Result<usize> {
        if let Some(stray) = records.iter().find(|r| r.metadata.file_id != file_id) {
            return Err(RetrievalError::configuration(format!(
                "record {} belongs to {}, not {}",
                stray.id, stray.metadata.file_id, file_id
            )));
        }

        let mut slots = self.write();
        let dims = if records.is_empty() {
            None
        } else {
            Some(validate_batch(&records, slots.dimension)?)
        };
        let removed = slots.remove_file(file_id);
        let count = match dims {
            Some(dims) => slots.insert(records, dims),
            None => {
                if removed > 0 {
                    slots.last_updated = Some(Utc::now());
                }
                0
            }
        };
        self.maybe_compact(&mut slots);
        Ok(count)
    }

    async fn get_index_info(&self) -> IndexStats {
        let slots = self.read();
        IndexStats {
            total_slots: slots.slots.len(),
            occupied_slots: slots.occupied,
            sparsity: slots.sparsity(),
            dimension: slots.dimension,
            last_updated: slots.last_updated,
        }
    }

    async fn compact(&self) -> Result<usize> {
        let mut slots = self.write();
        Ok(slots.compact())
    }

    async fn rebuild_index(&self) -> Result<()> {
        let mut slots = self.write();
        *slots = Slots {
            last_updated: Some(Utc::now()),
            ..Slots::default()
        };
        Ok(())
    }

    async fn file_ids(&self) -> BTreeMap<String, Vec<String>> {
        let slots = self.read();
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rec in slots.slots.iter().flatten() {
            map.entry(rec.metadata.file_id.clone())
                .or_default()
                .push(rec.id.clone());
        }
        map
    }

    async fn all_records(&self) -> Vec<Arc<VectorRecord>> {
        self.read().slots.iter().flatten().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.read().occupied
    }
}
