//! Database statistics and health overview.
//!
//! Summarizes what the persisted store holds: file and vector counts, the
//! embedding model recorded with the snapshot, and a per-file-type
//! breakdown. Reads the database only, so it works without any embedding
//! backend reachable.

use std::collections::BTreeMap;

use anyhow::Result;
use recall_harness_core::files::FileStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteFileStore;

/// Per-type breakdown of file and byte counts.
#[derive(Default)]
struct TypeStats {
    files: usize,
    bytes: u64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::migrate(&pool).await?;
    let store = SqliteFileStore::new(pool);

    let files = store.list_files().await?;
    let total_vectors = store.vector_count().await?;
    let model = store.stored_model().await?;
    let with_vectors: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT file_id) FROM vectors")
        .fetch_one(store.pool())
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Recall Harness — Database Stats");
    println!("===============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Model:       {}",
        model
            .map(|m| format!("{} ({} dims)", m.name, m.dimensions))
            .unwrap_or_else(|| "none recorded".to_string())
    );
    println!();
    println!("  Files:       {}", files.len());
    println!("  Vectors:     {}", total_vectors);
    println!(
        "  Indexed:     {} / {} ({}%)",
        with_vectors,
        files.len(),
        if files.is_empty() {
            0
        } else {
            (with_vectors as usize * 100) / files.len()
        }
    );

    let mut by_type: BTreeMap<String, TypeStats> = BTreeMap::new();
    for f in &files {
        let entry = by_type.entry(f.file_type()).or_default();
        entry.files += 1;
        entry.bytes += f.size;
    }

    if !by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<12} {:>8} {:>12}", "TYPE", "FILES", "SIZE");
        println!("  {}", "-".repeat(34));
        for (file_type, s) in &by_type {
            println!("  {:<12} {:>8} {:>12}", file_type, s.files, format_bytes(s.bytes));
        }
    }

    if let Some(latest) = files.iter().map(|f| f.modified_at).max() {
        println!();
        println!("  Last change: {}", format_ts_relative(latest.timestamp()));
    }
    println!();

    store.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
