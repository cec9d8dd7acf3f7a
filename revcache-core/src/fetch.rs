//! Fetch pipelines: pull revision logs from a [`LogSource`] into a cache
//!
//! A *create* run prepares a cache (loading the data file if there is one)
//! and then fetches. A *refresh* run only fetches, against an existing
//! cache. Fetching happens in stages:
//!
//! 1. connect, learning the head revision
//! 2. fetch the pending skipped range
//! 3. fetch revisions newer than the last processed one
//! 4. the same two steps for merge info, if the server tracks merges
//! 5. save if anything changed
//!
//! Progress is checkpointed (data file, then metadata) every
//! `save_interval` revisions, so an interrupted run resumes where it stopped.

use crate::cache_info::{CacheMetadata, SkippedRange};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::repository_cache::RepositoryCache;
use crate::revision::{LogEntry, MAX_REVISION};
use std::fs;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the repository reported when we connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    pub has_connection: bool,
    pub head_revision: u64,
    pub supports_merge_info: bool,
}

impl ConnectionInfo {
    pub fn offline() -> Self {
        Self::default()
    }
}

/// Inclusive, ascending revision range to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRequest {
    pub start: u64,
    pub end: u64,
    /// Ask the source to fill `LogEntry::merge_children`
    pub discover_merges: bool,
}

/// Lazily produced log entries; finite and not restartable
pub type LogEntries<'a> = Box<dyn Iterator<Item = Result<LogEntry>> + 'a>;

/// Producer of revision logs, typically a repository client.
///
/// Implementations report their own failures as [`CacheError::Pipeline`]
/// and should stop early once `cancel` fires.
pub trait LogSource {
    fn connect(&self, cancel: &CancellationToken) -> Result<ConnectionInfo>;

    fn fetch_log<'a>(
        &'a self,
        request: LogRequest,
        cancel: &'a CancellationToken,
    ) -> Result<LogEntries<'a>>;
}

/// Statistics of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub connection: ConnectionInfo,
    pub revisions_fetched: u64,
    pub merge_entries_fetched: u64,
    pub checkpoints: u64,
    pub duration_ms: u64,
}

/// One run of the fetch stages against a cache
pub struct FetchPipeline<'a> {
    source: &'a dyn LogSource,
    config: &'a CacheConfig,
    cancel: &'a CancellationToken,
}

impl<'a> FetchPipeline<'a> {
    pub fn new(
        source: &'a dyn LogSource,
        config: &'a CacheConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            source,
            config,
            cancel,
        }
    }

    /// Prepare a cache from disk, then fetch into it
    pub fn create(&self, meta: &mut CacheMetadata) -> Result<(RepositoryCache, FetchSummary)> {
        let mut cache = self.prepare(meta)?;
        let summary = self.refresh(&mut cache, meta)?;
        Ok((cache, summary))
    }

    /// Fetch new revisions and merge info into an existing cache
    pub fn refresh(
        &self,
        cache: &mut RepositoryCache,
        meta: &mut CacheMetadata,
    ) -> Result<FetchSummary> {
        let started = Instant::now();
        let connection = self.connect()?;
        self.fetch(cache, meta, connection, started)
    }

    /// Like [`refresh`](Self::refresh), but copies `cache` only when the
    /// source has something it lacks.
    ///
    /// Returns the updated copy, or `None` when `cache` is already current.
    pub fn refresh_shared(
        &self,
        cache: &RepositoryCache,
        meta: &mut CacheMetadata,
    ) -> Result<(Option<RepositoryCache>, FetchSummary)> {
        let started = Instant::now();
        let connection = self.connect()?;
        if !needs_fetch(&connection, meta) {
            debug!(
                last_processed = meta.last_processed_revision,
                "revision cache is current"
            );
            let summary = FetchSummary {
                connection,
                duration_ms: started.elapsed().as_millis() as u64,
                ..FetchSummary::default()
            };
            return Ok((None, summary));
        }
        let mut working = cache.clone();
        let summary = self.fetch(&mut working, meta, connection, started)?;
        Ok((Some(working), summary))
    }

    fn connect(&self) -> Result<ConnectionInfo> {
        self.check_cancelled()?;
        let connection = self.source.connect(self.cancel).map_err(into_pipeline)?;
        if connection.has_connection {
            info!(head = connection.head_revision, "connected to repository");
        }
        Ok(connection)
    }

    fn fetch(
        &self,
        cache: &mut RepositoryCache,
        meta: &mut CacheMetadata,
        connection: ConnectionInfo,
        started: Instant,
    ) -> Result<FetchSummary> {
        let mut summary = FetchSummary {
            connection,
            ..FetchSummary::default()
        };
        if !connection.has_connection {
            info!(
                last_processed = meta.last_processed_revision,
                "no repository connection, using cached revisions"
            );
            summary.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        self.fetch_skipped(cache, meta, &mut summary)?;
        self.fetch_new(cache, meta, connection.head_revision, &mut summary)?;

        if connection.supports_merge_info {
            self.fetch_skipped_merges(cache, meta, &mut summary)?;
            self.fetch_new_merges(cache, meta, connection.head_revision, &mut summary)?;
        }

        if cache.is_dirty() {
            self.save(cache, meta)?;
        } else {
            meta.save()?;
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            revisions = summary.revisions_fetched,
            merges = summary.merge_entries_fetched,
            duration_ms = summary.duration_ms,
            "fetch pipeline finished"
        );
        Ok(summary)
    }

    /// Load the data file named by `meta`, or start empty.
    ///
    /// A corrupt data file is deleted and its progress forgotten, so the
    /// following fetch rebuilds the history from scratch.
    pub fn prepare(&self, meta: &mut CacheMetadata) -> Result<RepositoryCache> {
        self.check_cancelled()?;
        let data_path = meta.data_path();

        if meta.last_processed_revision > MAX_REVISION
            || meta.merge_last_processed_revision > MAX_REVISION
        {
            warn!(
                last = meta.last_processed_revision,
                merge_last = meta.merge_last_processed_revision,
                "cache metadata is out of range, rebuilding"
            );
            meta.reset();
            meta.save()?;
        }

        let mut cache = if meta.last_processed_revision == 0 {
            RepositoryCache::new()
        } else if !data_path.exists() {
            warn!(path = ?data_path, "cache data file is missing, rebuilding");
            meta.reset();
            meta.save()?;
            RepositoryCache::new()
        } else {
            match RepositoryCache::load(&data_path) {
                Ok(cache) => cache,
                Err(err) if err.is_corruption() => {
                    warn!(error = %err, "discarding corrupt revision cache");
                    fs::remove_file(&data_path)?;
                    meta.reset();
                    meta.save()?;
                    RepositoryCache::new()
                }
                Err(err) => return Err(err),
            }
        };

        cache.expand_revisions_count(meta.last_processed_revision)?;
        debug!(
            slots = cache.slot_count(),
            revisions = cache.record_count(),
            "prepared revision cache"
        );
        Ok(cache)
    }

    fn fetch_skipped(
        &self,
        cache: &mut RepositoryCache,
        meta: &mut CacheMetadata,
        summary: &mut FetchSummary,
    ) -> Result<()> {
        if !meta.skipped.is_pending() {
            return Ok(());
        }
        let SkippedRange { start, end } = meta.skipped;
        info!(start, end, "fetching revisions");

        let request = LogRequest {
            start,
            end,
            discover_merges: false,
        };
        let mut since_checkpoint = 0u64;
        for entry in self.source.fetch_log(request, self.cancel).map_err(into_pipeline)? {
            self.check_cancelled()?;
            let entry = entry.map_err(into_pipeline)?;
            cache.add_entry(&entry)?;
            meta.skipped.start = meta.skipped.start.max(entry.revision.saturating_add(1));
            summary.revisions_fetched += 1;

            since_checkpoint += 1;
            if since_checkpoint >= self.config.save_interval {
                since_checkpoint = 0;
                self.save(cache, meta)?;
                summary.checkpoints += 1;
            }
        }
        self.check_cancelled()?;
        meta.skipped.clear();
        Ok(())
    }

    fn fetch_new(
        &self,
        cache: &mut RepositoryCache,
        meta: &mut CacheMetadata,
        head: u64,
        summary: &mut FetchSummary,
    ) -> Result<()> {
        if head <= meta.last_processed_revision {
            return Ok(());
        }
        cache.expand_revisions_count(head)?;
        meta.skipped = SkippedRange::new(meta.last_processed_revision + 1, head);
        meta.last_processed_revision = head;
        meta.save()?;
        self.fetch_skipped(cache, meta, summary)
    }

    fn fetch_skipped_merges(
        &self,
        cache: &mut RepositoryCache,
        meta: &mut CacheMetadata,
        summary: &mut FetchSummary,
    ) -> Result<()> {
        if !meta.merge_skipped.is_pending() {
            return Ok(());
        }
        let SkippedRange { start, end } = meta.merge_skipped;
        info!(start, end, "fetching merge info");

        let request = LogRequest {
            start,
            end,
            discover_merges: true,
        };
        let mut since_checkpoint = 0u64;
        for entry in self.source.fetch_log(request, self.cancel).map_err(into_pipeline)? {
            self.check_cancelled()?;
            let entry = entry.map_err(into_pipeline)?;
            cache.add_merge_info(entry.revision, &entry.merge_children);
            meta.merge_skipped.start = meta.merge_skipped.start.max(entry.revision.saturating_add(1));
            summary.merge_entries_fetched += 1;

            since_checkpoint += 1;
            if since_checkpoint >= self.config.save_interval {
                since_checkpoint = 0;
                self.save(cache, meta)?;
                summary.checkpoints += 1;
            }
        }
        self.check_cancelled()?;
        meta.merge_skipped.clear();
        Ok(())
    }

    fn fetch_new_merges(
        &self,
        cache: &mut RepositoryCache,
        meta: &mut CacheMetadata,
        head: u64,
        summary: &mut FetchSummary,
    ) -> Result<()> {
        if head <= meta.merge_last_processed_revision {
            return Ok(());
        }
        meta.merge_skipped = SkippedRange::new(meta.merge_last_processed_revision + 1, head);
        meta.merge_last_processed_revision = head;
        meta.save()?;
        self.fetch_skipped_merges(cache, meta, summary)
    }

    /// Data file first, then metadata describing it
    fn save(&self, cache: &mut RepositoryCache, meta: &CacheMetadata) -> Result<()> {
        cache.save(&meta.data_path(), self.config)?;
        meta.save()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(())
    }
}

/// Collaborator failures all surface as pipeline errors
fn into_pipeline(err: CacheError) -> CacheError {
    match err {
        CacheError::Pipeline(_) | CacheError::Cancelled => err,
        other => CacheError::Pipeline(other.to_string()),
    }
}

/// True when `connection` offers revisions or merge info `meta` has not recorded
fn needs_fetch(connection: &ConnectionInfo, meta: &CacheMetadata) -> bool {
    if !connection.has_connection {
        return false;
    }
    let head = connection.head_revision;
    let revisions = meta.skipped.is_pending() || head > meta.last_processed_revision;
    let merges = connection.supports_merge_info
        && (meta.merge_skipped.is_pending() || head > meta.merge_last_processed_revision);
    revisions || merges
}
