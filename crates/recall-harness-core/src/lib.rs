//! # Recall Harness Core
//!
//! Shared, runtime-agnostic logic for Recall Harness: data models, the
//! error taxonomy, chunking, the [`VectorIndex`](index::VectorIndex)
//! abstraction with its in-memory implementation, the authoritative
//! [`FileStore`](files::FileStore) contract, the LLM reranking protocol,
//! and the scoring helpers used by the search pipeline.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or network
//! dependencies. Orchestration (timeouts, retries, scheduling, watching)
//! lives in the `recall-harness` application crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod files;
pub mod index;
pub mod models;
pub mod rerank;
pub mod search;

pub use error::{Result, RetrievalError};
