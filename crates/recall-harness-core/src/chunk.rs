//! Paragraph-boundary text chunker.
//!
//! Splits a file's text into [`ChunkInput`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! so each chunk stays semantically coherent; oversized paragraphs are
//! hard-split at the nearest newline or space.
//!
//! Each chunk carries the owning file id, its position, the total chunk
//! count, and a SHA-256 hash of its text.
//!
//! # Example
//!
//! ```rust
//! use recall_harness_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("file-1", "Hello world.\n\nSecond paragraph.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].total_chunks, 1);
//! ```

use sha2::{Digest, Sha256};

use crate::models::ChunkInput;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Whitespace-only text produces no chunks: an empty file has nothing to
/// embed. Chunk indices are contiguous from 0 and every chunk reports the
/// same `total_chunks`.
pub fn chunk_text(file_id: &str, text: &str, max_tokens: usize) -> Vec<ChunkInput> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, content)| ChunkInput {
            file_id: file_id.to_string(),
            chunk_index: i,
            total_chunks: total,
            hash: hash_text(&content),
            content,
        })
        .collect()
}

/// Split an oversized paragraph at newline/space boundaries.
fn hard_split(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let limit = at_least_one_char(remaining, snap_to_char_boundary(remaining, max_chars));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let split_at = at_least_one_char(remaining, split_at);
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Never split at 0: advance by at least one whole character.
fn at_least_one_char(s: &str, index: usize) -> usize {
    if index > 0 {
        return index;
    }
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Hex SHA-256 of a string.
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Hex SHA-256 of raw bytes (file fingerprints).
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("f1", "Hello, world!", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].file_id, "f1");
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_text("f1", "", 700).is_empty());
        assert!(chunk_text("f1", "  \n\n  ", 700).is_empty());
    }

    #[test]
    fn test_paragraphs_exceed_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text("f1", text, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.total_chunks, chunks.len());
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_text("f1", text, 3);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| !c.content.is_empty()));
    }

    #[test]
    fn test_deterministic_hashes() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("f1", text, 5);
        let c2 = chunk_text("f1", text, 5);
        assert_eq!(c1, c2);
        assert_eq!(c1[0].hash, hash_text(&c1[0].content));
    }
}
