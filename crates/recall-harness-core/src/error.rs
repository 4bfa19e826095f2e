//! Error taxonomy for the retrieval engine.
//!
//! Each variant maps to one recovery policy:
//!
//! | Variant | Policy |
//! |---------|--------|
//! | [`Configuration`](RetrievalError::Configuration) | Not retried, surfaced to the caller |
//! | [`ProviderUnavailable`](RetrievalError::ProviderUnavailable) | Retried with backoff, then degraded |
//! | [`Parse`](RetrievalError::Parse) | Stage-1 fallback, logged, never surfaced |
//! | [`IntegrityDrift`](RetrievalError::IntegrityDrift) | Reported and corrected, never fatal |
//! | [`ScanTimeout`](RetrievalError::ScanTimeout) | Scan aborted with partial results |

use std::time::Duration;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Dimension mismatch, missing required field, invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An embedding or language-model backend could not be reached.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A language-model response could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("index drift: {orphaned_vectors} orphaned vectors, {orphaned_files} orphaned files")]
    IntegrityDrift {
        orphaned_vectors: usize,
        orphaned_files: usize,
    },

    #[error("scan timed out after {elapsed:?} ({partial} files seen)")]
    ScanTimeout { elapsed: Duration, partial: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RetrievalError {
    /// Whether the operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetrievalError::ProviderUnavailable(_)
                | RetrievalError::ScanTimeout { .. }
                | RetrievalError::Io(_)
        )
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        RetrievalError::Configuration(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        RetrievalError::ProviderUnavailable(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RetrievalError::unavailable("down").is_retryable());
        assert!(!RetrievalError::configuration("dims").is_retryable());
        assert!(!RetrievalError::Parse("junk".into()).is_retryable());
        assert!(RetrievalError::ScanTimeout {
            elapsed: Duration::from_secs(1),
            partial: 3
        }
        .is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = RetrievalError::IntegrityDrift {
            orphaned_vectors: 2,
            orphaned_files: 1,
        };
        assert_eq!(
            err.to_string(),
            "index drift: 2 orphaned vectors, 1 orphaned files"
        );
    }
}
