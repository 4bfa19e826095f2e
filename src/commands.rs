//! CLI command implementations.
//!
//! Each `run_*` function opens an [`Engine`], performs one operation,
//! prints a human-readable (or JSON) summary, and persists the index
//! snapshot when the operation changed it.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use tokio::sync::watch;

use recall_harness_core::index::MetadataFilter;
use recall_harness_core::search::SearchMode;

use crate::config::Config;
use crate::consistency::SyncOptions;
use crate::engine::Engine;
use crate::pipeline::SearchRequest;

/// Flags of `recall search`.
pub struct SearchArgs {
    pub query: String,
    pub mode: Option<String>,
    pub limit: Option<usize>,
    pub rerank: bool,
    pub file_type: Option<String>,
    pub json: bool,
}

pub async fn run_index(config: &Config, root: &Path) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let report = engine.index_root(root).await?;
    engine.save_snapshot().await?;

    println!(
        "Scanned {} files: {} indexed, {} unchanged, {} empty, {} removed.",
        report.scanned, report.indexed, report.unchanged, report.empty, report.removed
    );
    if report.timed_out {
        println!("Scan hit its time limit; run again to pick up the rest.");
    }
    for failure in &report.failures {
        println!("  failed: {}", failure);
    }
    engine.close().await;
    Ok(())
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    if args.query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let mut request = SearchRequest::new(&args.query).with_rerank(args.rerank);
    if let Some(mode) = &args.mode {
        request = request.mode(SearchMode::from_str(mode)?);
    }
    if let Some(limit) = args.limit {
        request = request.top_k(limit);
    }
    if let Some(file_type) = &args.file_type {
        request = request.filter(MetadataFilter::file_type(file_type.as_str()));
    }

    let engine = Engine::open(config.clone()).await?;
    let outcome = engine.search(request).await?;
    engine.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    if outcome.results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    if let Some(degraded) = outcome.degraded {
        println!("(degraded: {:?})", degraded);
    }
    for (i, r) in outcome.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (chunk {}/{})",
            i + 1,
            r.score,
            r.metadata.file_path,
            r.metadata.chunk_index + 1,
            r.metadata.total_chunks
        );
        println!("    {}", snippet(&r.content, 160));
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &flat[..end]),
        None => flat,
    }
}

pub async fn run_check(config: &Config, json: bool) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let report = engine.check_integrity().await?;
    engine.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "{} vectors, {} files checked at {}",
        report.total_vectors,
        report.total_files,
        report.last_checked_at.format("%Y-%m-%d %H:%M:%S")
    );
    if report.is_consistent() {
        println!("Index is consistent.");
    } else {
        println!("  Orphaned vectors: {}", report.orphaned_vector_ids.len());
        println!("  Orphaned files:   {}", report.orphaned_file_ids.len());
        println!("Run `recall sync` to repair.");
    }
    Ok(())
}

pub async fn run_sync(config: &Config, dry_run: bool) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let report = engine
        .force_sync(SyncOptions {
            dry_run,
            file_ids: None,
        })
        .await?;
    if !dry_run && report.changed_anything() {
        engine.save_snapshot().await?;
    }
    engine.close().await;

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{} {} vectors and {} files; {} {} files.",
        verb,
        report.vectors_removed,
        report.files_removed,
        if dry_run { "would re-ingest" } else { "re-ingested" },
        report.files_reingested
    );
    for failure in &report.failures {
        println!("  failed: {}", failure);
    }
    Ok(())
}

pub async fn run_rebuild(config: &Config) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let report = engine.rebuild().await?;
    engine.close().await;
    println!(
        "Rebuilt index: {} files re-embedded, {} removed, {} failures.",
        report.files_reingested,
        report.files_removed,
        report.failures.len()
    );
    Ok(())
}

/// Watch until Ctrl-C.
pub async fn run_watch(config: &Config) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    println!(
        "Watching {} root(s). Press Ctrl-C to stop.",
        config.watcher.roots.len()
    );
    engine.watch(shutdown_rx).await?;
    engine.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n\nb   c", 10), "a b c");
        assert_eq!(snippet("héllo wörld", 5), "héllo...");
    }
}
