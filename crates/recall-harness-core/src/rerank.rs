//! LLM reranking protocol: prompt construction, tolerant response
//! parsing, and final score blending.
//!
//! Candidates are enumerated as `doc-1 … doc-N`. The model is asked for a
//! JSON array of `{"document_id", "relevance_score"}` objects. Responses
//! are parsed permissively: reasoning blocks, code fences, and surrounding
//! prose are ignored, ids may be `"doc-3"`, `"3"`, or `3`, and invalid
//! entries are dropped. An empty result is a [`RetrievalError::Parse`].

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{Result, RetrievalError};
use crate::search::sort_desc_stable;

/// Default characters of each candidate shown to the model.
pub const DEFAULT_EXCERPT_CHARS: usize = 500;

/// One stage-1 candidate offered to the reranker.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub content: String,
    pub vector_score: f32,
}

/// Blend of stage-1 evidence and the model's judgement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankWeights {
    pub vector: f32,
    pub rerank: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            vector: 0.3,
            rerank: 0.7,
        }
    }
}

/// The model's relevance score for one candidate (by position).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Judgement {
    pub index: usize,
    pub relevance: f32,
}

/// A candidate after blending, ready to become a search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reranked {
    pub index: usize,
    pub relevance: f32,
    pub final_score: f32,
}

fn doc_label(index: usize) -> String {
    format!("doc-{}", index + 1)
}

/// Truncate to at most `max_chars` characters, marking the cut.
pub fn excerpt(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}…", head.trim_end())
    } else {
        head
    }
}

/// Build the ranking prompt for `query` over `candidates`.
pub fn build_prompt(
    query: &str,
    candidates: &[RerankCandidate],
    top_k: usize,
    excerpt_chars: usize,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are ranking documents by how well they answer a search query.\n\n",
    );
    prompt.push_str(&format!("Query: {}\n\nDocuments:\n", query.trim()));
    for (i, cand) in candidates.iter().enumerate() {
        let text = excerpt(&cand.content, excerpt_chars).replace('\n', " ");
        prompt.push_str(&format!("[{}] {}\n", doc_label(i), text));
    }
    prompt.push_str(&format!(
        "\nSelect at most {} documents that are relevant to the query, most relevant first. \
         Fewer is fine if fewer are relevant.\n\
         Respond with only a JSON array, for example:\n\
         [{{\"document_id\": \"doc-1\", \"relevance_score\": 0.92}}]\n\
         relevance_score must be a number between 0 and 1.\n",
        top_k
    ));
    prompt
}

/// Parse the model output into judgements over `candidate_count` candidates.
pub fn parse_response(text: &str, candidate_count: usize) -> Result<Vec<Judgement>> {
    let body = match text.rfind("</think>") {
        Some(pos) => &text[pos + "</think>".len()..],
        None => text,
    };

    let items = find_items(body)
        .ok_or_else(|| RetrievalError::Parse("no JSON ranking found in response".to_string()))?;

    let mut seen = HashSet::new();
    let mut judgements = Vec::new();
    for item in &items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let Some(index) = ["document_id", "doc_id", "id"]
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(parse_doc_index)
        else {
            continue;
        };
        let Some(relevance) = ["relevance_score", "score", "relevance"]
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(parse_score)
        else {
            continue;
        };
        if index >= candidate_count || !seen.insert(index) {
            continue;
        }
        judgements.push(Judgement { index, relevance });
    }

    if judgements.is_empty() {
        return Err(RetrievalError::Parse(format!(
            "ranking contained no valid entries ({} items)",
            items.len()
        )));
    }
    Ok(judgements)
}

/// Locate the first JSON array of ranking items in free text.
fn find_items(text: &str) -> Option<Vec<Value>> {
    for (start, ch) in text.char_indices() {
        if ch != '[' && ch != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let value = match stream.next() {
            Some(Ok(v)) => v,
            _ => continue,
        };
        match value {
            Value::Array(items) if items.iter().any(Value::is_object) => return Some(items),
            Value::Object(map) => {
                let nested = ["results", "rankings", "documents", "ranking"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_array));
                if let Some(items) = nested {
                    return Some(items.clone());
                }
            }
            _ => {}
        }
    }
    None
}

/// `"doc-3"`, `"[doc-3]"`, `"3"`, or `3` → index 2.
fn parse_doc_index(value: &Value) -> Option<usize> {
    let n = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => {
            let digits = s
                .trim()
                .trim_matches(|c| c == '[' || c == ']')
                .trim_start_matches(|c: char| c.is_alphabetic() || c == '-' || c == '_' || c == ' ');
            digits.parse::<u64>().ok()?
        }
        _ => return None,
    };
    (n as usize).checked_sub(1)
}

fn parse_score(value: &Value) -> Option<f32> {
    let score = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (score.is_finite() && (0.0..=1.0).contains(&score)).then_some(score as f32)
}

/// Blend scores and order: `vector × vector_score + rerank × relevance`.
pub fn combine_scores(
    candidates: &[RerankCandidate],
    judgements: &[Judgement],
    weights: RerankWeights,
    top_k: usize,
) -> Vec<Reranked> {
    let mut ranked: Vec<Reranked> = judgements
        .iter()
        .filter_map(|j| {
            candidates.get(j.index).map(|c| Reranked {
                index: j.index,
                relevance: j.relevance,
                final_score: weights.vector * c.vector_score + weights.rerank * j.relevance,
            })
        })
        .collect();
    sort_desc_stable(&mut ranked, |r| r.final_score);
    ranked.truncate(top_k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(n: usize) -> Vec<RerankCandidate> {
        (0..n)
            .map(|i| RerankCandidate {
                id: format!("f{}:0", i),
                content: format!("content number {}", i),
                vector_score: 0.5,
            })
            .collect()
    }

    #[test]
    fn test_prompt_enumerates_candidates() {
        let prompt = build_prompt("what is x?", &candidates(3), 2, 100);
        assert!(prompt.contains("[doc-1] content number 0"));
        assert!(prompt.contains("[doc-3] content number 2"));
        assert!(prompt.contains("at most 2 documents"));
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo…");
        assert_eq!(excerpt("short", 10), "short");
    }

    #[test]
    fn test_parse_plain_array() {
        let text = r#"[{"document_id": "doc-2", "relevance_score": 0.9}, {"document_id": "doc-1", "relevance_score": 0.4}]"#;
        let j = parse_response(text, 3).unwrap();
        assert_eq!(j, vec![Judgement { index: 1, relevance: 0.9 }, Judgement { index: 0, relevance: 0.4 }]);
    }

    #[test]
    fn test_parse_wrapped_in_prose_and_fences() {
        let text = "<think>hmm [not json</think>Sure! Here you go:\n```json\n[{\"document_id\": 3, \"relevance_score\": \"0.75\"}]\n```\nHope that helps.";
        let j = parse_response(text, 3).unwrap();
        assert_eq!(j, vec![Judgement { index: 2, relevance: 0.75 }]);
    }

    #[test]
    fn test_parse_object_with_results_key() {
        let text = r#"{"results": [{"id": "2", "score": 1.0}]}"#;
        let j = parse_response(text, 2).unwrap();
        assert_eq!(j[0].index, 1);
    }

    #[test]
    fn test_parse_drops_invalid_entries() {
        let text = r#"[{"document_id": "doc-9", "relevance_score": 0.9},
                       {"document_id": "doc-1", "relevance_score": 1.7},
                       {"document_id": "doc-2", "relevance_score": 0.6},
                       {"document_id": "doc-2", "relevance_score": 0.1}]"#;
        let j = parse_response(text, 3).unwrap();
        assert_eq!(j, vec![Judgement { index: 1, relevance: 0.6 }]);
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(parse_response("I cannot help with that.", 3), Err(RetrievalError::Parse(_))));
        assert!(matches!(parse_response("[]", 3), Err(RetrievalError::Parse(_))));
        assert!(matches!(
            parse_response(r#"[{"document_id": "doc-7", "relevance_score": 0.5}]"#, 3),
            Err(RetrievalError::Parse(_))
        ));
    }

    #[test]
    fn test_combine_scores_weighting() {
        let mut cands = candidates(2);
        cands[0].vector_score = 1.0;
        cands[1].vector_score = 0.0;
        let judgements = vec![
            Judgement { index: 0, relevance: 0.2 },
            Judgement { index: 1, relevance: 1.0 },
        ];
        let ranked = combine_scores(&cands, &judgements, RerankWeights::default(), 5);
        assert_eq!(ranked[0].index, 1);
        assert!((ranked[0].final_score - 0.7).abs() < 1e-6);
        assert!((ranked[1].final_score - 0.44).abs() < 1e-6);
    }
}
