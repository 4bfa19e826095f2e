//! Scoring helpers for the two-stage search pipeline.
//!
//! Everything here is pure: candidate sizing, token-overlap keyword
//! scoring (the degraded path when no query embedding is available), and
//! hybrid fusion. The async orchestration lives in the app crate's
//! `pipeline` module.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Take the vector candidates (cosine similarity) and keyword
//!    candidates (token overlap).
//! 2. Normalize both sets to `[0, 1]` using min-max normalization.
//! 3. Merge: `score = (1 - α) × keyword + α × semantic`.
//! 4. Sort by score (desc); ties keep first-retrieved order.
//! 5. Truncate to `top_k`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;
use crate::index::{ScoredRecord, SearchParams};
use crate::models::VectorRecord;

/// Retrieval mode for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Cosine similarity over embeddings.
    #[default]
    Semantic,
    /// Token overlap only.
    Keyword,
    /// Native fusion of semantic and keyword scores.
    Hybrid,
}

impl SearchMode {
    /// Hybrid mode already fuses two signals and never goes to stage 2.
    pub fn has_builtin_fusion(self) -> bool {
        matches!(self, SearchMode::Hybrid)
    }
}

impl FromStr for SearchMode {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(RetrievalError::configuration(format!(
                "Unknown search mode: {}. Use semantic, keyword, or hybrid.",
                other
            ))),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// Stage-1 headroom when reranking: `max(top_k * multiplier, floor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub multiplier: usize,
    pub floor: usize,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self {
            multiplier: 4,
            floor: 20,
        }
    }
}

/// Number of stage-1 candidates to request.
///
/// Without reranking this is exactly `top_k`. With reranking it is
/// `min(max(top_k * multiplier, floor), corpus_size)`.
///
/// ```rust
/// use recall_harness_core::search::{stage1_candidate_count, CandidatePolicy};
///
/// let policy = CandidatePolicy::default();
/// assert_eq!(stage1_candidate_count(5, 1000, true, policy), 20);
/// assert_eq!(stage1_candidate_count(5, 10, true, policy), 10);
/// assert_eq!(stage1_candidate_count(5, 1000, false, policy), 5);
/// ```
pub fn stage1_candidate_count(
    top_k: usize,
    corpus_size: usize,
    rerank: bool,
    policy: CandidatePolicy,
) -> usize {
    if !rerank {
        return top_k;
    }
    top_k
        .saturating_mul(policy.multiplier)
        .max(policy.floor)
        .min(corpus_size)
}

/// Lowercased alphanumeric tokens of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fraction of distinct query tokens that occur in `content`, in `[0, 1]`.
pub fn keyword_score(query_tokens: &HashSet<String>, content: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens: HashSet<String> = tokenize(content).into_iter().collect();
    let hits = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t))
        .count();
    hits as f32 / query_tokens.len() as f32
}

/// Rank records by token overlap with `query`.
///
/// Records with no overlap are dropped. Ties keep insertion order.
pub fn keyword_rank(
    query: &str,
    records: &[Arc<VectorRecord>],
    params: &SearchParams,
) -> Vec<ScoredRecord> {
    let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
    if query_tokens.is_empty() || params.top_k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<ScoredRecord> = records
        .iter()
        .filter(|r| params.admits(&r.metadata))
        .filter_map(|r| {
            let score = keyword_score(&query_tokens, &r.content);
            (score > 0.0 && params.passes_threshold(score)).then(|| ScoredRecord {
                record: Arc::clone(r),
                score,
            })
        })
        .collect();
    sort_desc_stable(&mut scored, |s| s.score);
    scored.truncate(params.top_k);
    scored
}

/// Stable descending sort by a float key. NaN compares equal.
pub fn sort_desc_stable<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> f32,
{
    items.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let s_min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let s_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f32::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// A hybrid hit with both component scores (normalized).
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub record: Arc<VectorRecord>,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub keyword_score: Option<f32>,
}

/// Merge vector and keyword candidates: `(1 - α) × keyword + α × semantic`.
pub fn fuse_hybrid(
    vector: &[ScoredRecord],
    keyword: &[ScoredRecord],
    alpha: f32,
    top_k: usize,
) -> Vec<FusedHit> {
    let norm_vec = normalize_scores(&vector.iter().map(|s| s.score).collect::<Vec<_>>());
    let norm_kw = normalize_scores(&keyword.iter().map(|s| s.score).collect::<Vec<_>>());

    let mut order: HashMap<&str, usize> = HashMap::new();
    let mut hits: Vec<FusedHit> = Vec::new();

    for (cand, v) in vector.iter().zip(norm_vec) {
        order.insert(cand.record.id.as_str(), hits.len());
        hits.push(FusedHit {
            record: Arc::clone(&cand.record),
            score: 0.0,
            vector_score: Some(v),
            keyword_score: None,
        });
    }
    for (cand, k) in keyword.iter().zip(norm_kw) {
        match order.get(cand.record.id.as_str()) {
            Some(&i) => hits[i].keyword_score = Some(k),
            None => {
                order.insert(cand.record.id.as_str(), hits.len());
                hits.push(FusedHit {
                    record: Arc::clone(&cand.record),
                    score: 0.0,
                    vector_score: None,
                    keyword_score: Some(k),
                });
            }
        }
    }

    for hit in &mut hits {
        let v = hit.vector_score.unwrap_or(0.0);
        let k = hit.keyword_score.unwrap_or(0.0);
        hit.score = (1.0 - alpha) * k + alpha * v;
    }
    sort_desc_stable(&mut hits, |h| h.score);
    hits.truncate(top_k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordMetadata;

    fn rec(id: &str, content: &str) -> Arc<VectorRecord> {
        Arc::new(VectorRecord {
            id: id.to_string(),
            embedding: vec![1.0],
            content: content.to_string(),
            metadata: RecordMetadata {
                file_id: id.to_string(),
                ..Default::default()
            },
        })
    }

    fn scored(id: &str, score: f32) -> ScoredRecord {
        ScoredRecord {
            record: rec(id, "x"),
            score,
        }
    }

    #[test]
    fn test_candidate_count_rerank_headroom() {
        let policy = CandidatePolicy::default();
        assert_eq!(stage1_candidate_count(5, 1000, true, policy), 20);
        assert_eq!(stage1_candidate_count(5, 10, true, policy), 10);
        assert_eq!(stage1_candidate_count(10, 1000, true, policy), 40);
        assert_eq!(stage1_candidate_count(7, 1000, false, policy), 7);
        assert_eq!(stage1_candidate_count(5, 0, true, policy), 0);
    }

    #[test]
    fn test_candidate_policy_is_tunable() {
        let policy = CandidatePolicy {
            multiplier: 2,
            floor: 5,
        };
        assert_eq!(stage1_candidate_count(1, 100, true, policy), 5);
        assert_eq!(stage1_candidate_count(10, 100, true, policy), 20);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert!(SearchMode::Hybrid.has_builtin_fusion());
        assert!(!SearchMode::Semantic.has_builtin_fusion());
    }

    #[test]
    fn test_tokenize_drops_short_tokens() {
        assert_eq!(tokenize("A Rust-based index, v2!"), vec!["rust", "based", "index", "v2"]);
    }

    #[test]
    fn test_keyword_rank_orders_by_overlap() {
        let records = vec![
            rec("a", "nothing relevant here"),
            rec("b", "vector index compaction"),
            rec("c", "the vector store"),
        ];
        let hits = keyword_rank("vector index", &records, &SearchParams::top_k(10));
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_scores() {
        assert!(normalize_scores(&[]).is_empty());
        assert_eq!(normalize_scores(&[3.0, 3.0]), vec![1.0, 1.0]);
        let n = normalize_scores(&[10.0, 5.0, 0.0]);
        assert!((n[1] - 0.5).abs() < 1e-6);
        assert!(n.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn test_hybrid_alpha_extremes() {
        let vector = vec![scored("a", 0.9), scored("b", 0.1)];
        let keyword = vec![scored("b", 1.0), scored("c", 0.2)];

        let semantic_only = fuse_hybrid(&vector, &keyword, 1.0, 10);
        assert_eq!(semantic_only[0].record.id, "a");

        let keyword_only = fuse_hybrid(&vector, &keyword, 0.0, 10);
        assert_eq!(keyword_only[0].record.id, "b");
        assert_eq!(keyword_only.len(), 3);
    }

    #[test]
    fn test_sort_desc_stable_keeps_ties() {
        let mut items = vec![("x", 0.5), ("y", 0.9), ("z", 0.5)];
        sort_desc_stable(&mut items, |i| i.1);
        assert_eq!(items.iter().map(|i| i.0).collect::<Vec<_>>(), vec!["y", "x", "z"]);
    }
}
