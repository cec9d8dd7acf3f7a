//! revcache: revision cache maintenance tool.
//!
//! Supports:
//! - Building and refreshing a root's cache from a JSON-lines revision log
//! - Browsing cached revisions offline
//! - Listing, removing, exporting and importing caches
//!
//! # Usage
//!
//! ```bash
//! # Fetch everything in the log into the cache
//! revcache refresh --root https://svn.example.org/repo --log repo-log.jsonl
//!
//! # Show the ten newest cached revisions
//! revcache show --root https://svn.example.org/repo --limit 10
//!
//! # List known caches
//! revcache list
//!
//! # Move caches between machines
//! revcache export --dest /tmp/bundle
//! revcache --cache-dir /other/caches import --from /tmp/bundle
//! ```

mod log_file;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log_file::{LogFileSource, OfflineSource};
use revcache_core::{
    CacheLifecycleManager, CacheRegistry, CacheStatus, ConsumerId, LogSource, RepositoryCache,
    RevisionRecord, SkippedRange,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const CONSUMER: ConsumerId = ConsumerId(1);

#[derive(Parser, Debug)]
#[command(name = "revcache")]
#[command(author = "RevCache Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Repository revision cache tool")]
struct Cli {
    /// Directory holding the caches and the registry file
    #[arg(long, global = true, default_value = "./revcache")]
    cache_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build or refresh a root's cache from a revision log
    Refresh {
        /// Repository root URL
        #[arg(short, long)]
        root: String,
        /// JSON-lines revision log
        #[arg(short, long)]
        log: PathBuf,
    },

    /// Print cached revisions, newest first
    Show {
        /// Repository root URL
        #[arg(short, long)]
        root: String,
        /// Show only this revision
        #[arg(long)]
        revision: Option<u64>,
        /// Maximum number of revisions to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List registered caches
    List,

    /// Delete a root's cache files and unregister it
    Remove {
        /// Repository root URL
        #[arg(short, long)]
        root: String,
    },

    /// Copy caches into another directory
    Export {
        /// Destination directory
        #[arg(short, long)]
        dest: PathBuf,
        /// Roots to export (default: all)
        #[arg(short, long)]
        root: Vec<String>,
    },

    /// Register caches exported from another directory
    Import {
        /// Directory written by `export`
        #[arg(long)]
        from: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("revcache=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let registry = CacheRegistry::open(&cli.cache_dir)
        .with_context(|| format!("opening cache directory {}", cli.cache_dir.display()))?;

    match cli.command {
        Commands::Refresh { root, log } => cmd_refresh(&registry, root, log).await,
        Commands::Show {
            root,
            revision,
            limit,
        } => cmd_show(&registry, root, revision, limit).await,
        Commands::List => cmd_list(&registry),
        Commands::Remove { root } => cmd_remove(&registry, root),
        Commands::Export { dest, root } => cmd_export(&registry, dest, root),
        Commands::Import { from } => cmd_import(&registry, from),
    }
}

/// Open `manager` with `source` on the blocking pool, cancelling on Ctrl-C
async fn open_cache<S>(manager: Arc<CacheLifecycleManager>, source: S) -> Result<Arc<RepositoryCache>>
where
    S: LogSource + Send + 'static,
{
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = tokio::task::spawn_blocking(move || manager.open(CONSUMER, &source, &worker_cancel));

    let status = tokio::select! {
        status = worker => status?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, cancelling");
            cancel.cancel();
            return Err(anyhow!("cancelled"));
        }
    };

    match status {
        CacheStatus::Ready(cache) => Ok(cache),
        CacheStatus::Calculating => bail!("cache is being calculated by another consumer"),
        CacheStatus::Broken(Some(err)) => Err(err).context("revision cache is broken"),
        CacheStatus::Broken(None) => bail!("cache is already open"),
    }
}

async fn cmd_refresh(registry: &CacheRegistry, root: String, log: PathBuf) -> Result<()> {
    let source = LogFileSource::load(&log)?;
    println!("Read {} log entries from {}", source.entry_count(), log.display());

    let manager = registry.cache_for(&root)?;
    let cache = open_cache(Arc::clone(&manager), source).await?;
    let meta = manager.metadata();
    manager.close(CONSUMER);

    println!("\nCache refreshed:");
    println!("  Root:           {}", manager.root_url());
    println!("  Last processed: r{}", meta.last_processed_revision);
    println!("  Revisions:      {}", cache.record_count());
    println!("  Paths:          {}", cache.paths().len());
    println!("  Authors:        {}", cache.authors().len().saturating_sub(1));
    println!("  Merges:         {}", cache.merges().len());
    println!("  Phrases:        {}", cache.messages().phrase_count());
    Ok(())
}

async fn cmd_show(registry: &CacheRegistry, root: String, revision: Option<u64>, limit: usize) -> Result<()> {
    let manager = registry
        .get(&root)
        .ok_or_else(|| anyhow!("no cache registered for {}", root))?;
    let cache = open_cache(Arc::clone(&manager), OfflineSource).await?;
    manager.close(CONSUMER);

    match revision {
        Some(revision) => {
            let record = cache
                .revision(revision)
                .ok_or_else(|| anyhow!("r{} is not cached", revision))?;
            print_revision(&cache, record);
        }
        None => {
            for record in cache.revisions().rev().take(limit) {
                print_revision(&cache, record);
            }
        }
    }
    Ok(())
}

fn print_revision(cache: &RepositoryCache, record: &RevisionRecord) {
    let date = chrono::DateTime::from_timestamp_millis(record.timestamp)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| record.timestamp.to_string());
    println!(
        "r{} | {} | {}",
        record.revision,
        cache.author(record).unwrap_or("(no author)"),
        date
    );
    for changed in &record.changed_paths {
        match changed.copied_from {
            Some(source) => println!(
                "   {} {} (from {}@{})",
                changed.action,
                cache.path(changed.path_index),
                cache.path(source.path_index),
                source.revision
            ),
            None => println!("   {} {}", changed.action, cache.path(changed.path_index)),
        }
    }
    if let Some(merged) = cache.merged_from(record.revision) {
        let merged: Vec<String> = merged.iter().map(|rev| format!("r{}", rev)).collect();
        println!("   Merged: {}", merged.join(", "));
    }
    if let Some(message) = cache.message(record) {
        println!();
        for line in message.lines() {
            println!("  {}", line);
        }
    }
    println!();
}

fn cmd_list(registry: &CacheRegistry) -> Result<()> {
    let caches = registry.caches();
    if caches.is_empty() {
        println!("No caches in {}", registry.cache_dir().display());
        return Ok(());
    }
    for manager in caches {
        let meta = manager.metadata();
        println!("{}", manager.root_url());
        println!("  Metadata:       {}", meta.meta_file_name());
        println!("  Last processed: r{}", meta.last_processed_revision);
        println!("  Skipped:        {}", format_range(&meta.skipped));
        println!("  Merge info:     r{}", meta.merge_last_processed_revision);
        println!("  Merge skipped:  {}", format_range(&meta.merge_skipped));
    }
    Ok(())
}

fn format_range(range: &SkippedRange) -> String {
    if range.is_pending() {
        format!("r{}-r{}", range.start, range.end)
    } else {
        "none".to_string()
    }
}

fn cmd_remove(registry: &CacheRegistry, root: String) -> Result<()> {
    let removed = registry.remove(&[root.as_str()])?;
    if removed.is_empty() {
        bail!("{} was not removed (unknown or being calculated)", root);
    }
    println!("Removed cache for {}", removed.join(", "));
    Ok(())
}

fn cmd_export(registry: &CacheRegistry, dest: PathBuf, roots: Vec<String>) -> Result<()> {
    let roots = if roots.is_empty() {
        registry
            .caches()
            .iter()
            .map(|manager| manager.root_url().to_string())
            .collect()
    } else {
        roots
    };
    let roots: Vec<&str> = roots.iter().map(String::as_str).collect();
    let exported = registry
        .export(&dest, &roots)
        .with_context(|| format!("exporting to {}", dest.display()))?;
    println!("Exported {} cache(s) to {}", exported.len(), dest.display());
    for root in exported {
        println!("  {}", root);
    }
    Ok(())
}

fn cmd_import(registry: &CacheRegistry, from: PathBuf) -> Result<()> {
    let imported = registry
        .import(&from)
        .with_context(|| format!("importing from {}", from.display()))?;
    println!("Imported {} cache(s) from {}", imported.len(), from.display());
    for root in imported {
        println!("  {}", root);
    }
    Ok(())
}
