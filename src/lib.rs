//! # Recall Harness
//!
//! A local retrieval engine for document question answering.
//!
//! Recall Harness watches a set of directories, chunks and embeds the
//! files it finds, keeps the vectors in an in-memory index persisted to
//! SQLite, and answers queries through a two-stage pipeline: vector
//! similarity first, then an optional LLM rerank. A consistency manager
//! keeps the index and the file store in agreement.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │   Watcher   │──▶│  Ingestor   │──▶│ VectorIndex │◀──┐
//! │ notify+scan │   │ chunk+embed │   └──────┬──────┘   │
//! └─────────────┘   └──────┬──────┘          │          │
//!                          ▼                 ▼          │
//!                   ┌─────────────┐   ┌─────────────┐   │
//!                   │  FileStore  │◀──│ Consistency │   │
//!                   │  (SQLite)   │   │   Manager   │   │
//!                   └─────────────┘   └─────────────┘   │
//!                                                       │
//!          query ──▶ SearchPipeline ── stage 1 ─────────┘
//!                          └── stage 2 ──▶ RerankingGateway
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! recall init                    # create database
//! recall index ./docs            # scan and embed
//! recall search "deployment" --rerank
//! recall watch                   # follow changes live
//! recall check                   # report index drift
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding backends and the failover gateway |
//! | [`rerank`] | LLM reranking gateway |
//! | [`pipeline`] | Two-stage search |
//! | [`ingest`] | File ingestion |
//! | [`watcher`] | Filesystem watching and scanning |
//! | [`consistency`] | Index/file-store reconciliation |
//! | [`engine`] | Component wiring |
//! | [`sqlite_store`] | SQLite file store and snapshots |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod commands;
pub mod config;
pub mod consistency;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod rerank;
pub mod sqlite_store;
pub mod stats;
pub mod watcher;
