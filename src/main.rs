//! # Recall Harness CLI (`recall`)
//!
//! ## Usage
//!
//! ```bash
//! recall --config ./config/recall.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall init` | Create the SQLite database and run schema migrations |
//! | `recall index <dir>` | Scan a directory and index new or changed files |
//! | `recall search "<query>"` | Search indexed documents |
//! | `recall check` | Report orphaned vectors and files |
//! | `recall sync` | Repair index drift |
//! | `recall watch` | Follow the configured roots live |
//! | `recall rebuild` | Re-embed everything with the active model |
//! | `recall stats` | Database overview |
//! | `recall completions <shell>` | Print shell completions |

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use recall_harness::commands::{self, SearchArgs};
use recall_harness::{config, migrate, stats};

/// Recall Harness CLI: a local retrieval engine with LLM reranking.
#[derive(Parser)]
#[command(
    name = "recall",
    about = "Recall Harness — a local retrieval engine with LLM reranking",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/recall.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Scan a directory and index new or changed files.
    ///
    /// Files removed since the last run are dropped from the index.
    Index {
        /// Directory to scan.
        dir: PathBuf,
    },

    /// Search indexed documents.
    Search {
        query: String,

        /// `semantic`, `keyword`, or `hybrid`. Defaults to `[retrieval].mode`.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Rerank semantic results with the configured language model.
        #[arg(long)]
        rerank: bool,

        /// Only return chunks of files with this extension.
        #[arg(long = "type")]
        file_type: Option<String>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Compare the vector index with the file store.
    Check {
        #[arg(long)]
        json: bool,
    },

    /// Remove orphaned vectors and re-ingest files that lost theirs.
    Sync {
        /// Report what would change without changing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Watch `[watcher].roots` and index changes as they happen.
    Watch,

    /// Clear the index and re-embed every file.
    Rebuild,

    /// Show database statistics.
    Stats,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "recall", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { dir } => {
            commands::run_index(&cfg, &dir).await?;
        }
        Commands::Search {
            query,
            mode,
            limit,
            rerank,
            file_type,
            json,
        } => {
            commands::run_search(
                &cfg,
                SearchArgs {
                    query,
                    mode,
                    limit,
                    rerank,
                    file_type,
                    json,
                },
            )
            .await?;
        }
        Commands::Check { json } => {
            commands::run_check(&cfg, json).await?;
        }
        Commands::Sync { dry_run } => {
            commands::run_sync(&cfg, dry_run).await?;
        }
        Commands::Watch => {
            commands::run_watch(&cfg).await?;
        }
        Commands::Rebuild => {
            commands::run_rebuild(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
