//! Per-root cache lifecycle
//!
//! One [`CacheLifecycleManager`] exists per repository root. It makes sure
//! at most one fetch pipeline runs for the root, hands out immutable
//! snapshots of the cache, and keeps the in-memory cache alive exactly as
//! long as at least one consumer holds it open.
//!
//! The state mutex is only held for transitions; pipelines run unlocked.

use crate::cache_info::CacheMetadata;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fetch::{FetchPipeline, LogSource};
use crate::repository_cache::RepositoryCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Identity of a logical cache consumer (a graph view, a CLI command, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

/// Outcome of [`CacheLifecycleManager::open`] and `refresh`
#[derive(Debug)]
pub enum CacheStatus {
    /// Prepared, immutable snapshot
    Ready(Arc<RepositoryCache>),
    /// Another pipeline is running for this root; retry later
    Calculating,
    /// The request was refused or the pipeline failed
    Broken(Option<CacheError>),
}

impl CacheStatus {
    pub fn cache(&self) -> Option<&Arc<RepositoryCache>> {
        match self {
            CacheStatus::Ready(cache) => Some(cache),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CacheStatus::Ready(_))
    }
}

struct LifecycleState {
    calculating: bool,
    ref_count: u32,
    opened_by: HashSet<ConsumerId>,
    cache: Option<Arc<RepositoryCache>>,
    meta: CacheMetadata,
}

/// Owner of one repository root's cache
pub struct CacheLifecycleManager {
    root_url: String,
    meta_path: PathBuf,
    config: CacheConfig,
    state: Mutex<LifecycleState>,
}

/// Clears `calculating` if a pipeline exits without publishing, panics included
struct CalculatingGuard<'a> {
    state: &'a Mutex<LifecycleState>,
    armed: bool,
}

impl CalculatingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CalculatingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().calculating = false;
        }
    }
}

impl CacheLifecycleManager {
    /// Manager for `root_url`, reading progress from `meta_path` if present
    pub fn new(root_url: impl Into<String>, meta_path: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        let meta_path = meta_path.into();
        let meta = CacheMetadata::load(meta_path.clone())?;
        Ok(Self {
            root_url: root_url.into(),
            meta_path,
            config,
            state: Mutex::new(LifecycleState {
                calculating: false,
                ref_count: 0,
                opened_by: HashSet::new(),
                cache: None,
                meta,
            }),
        })
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Copy of the current fetch progress
    pub fn metadata(&self) -> CacheMetadata {
        self.state.lock().meta.clone()
    }

    pub fn is_calculating(&self) -> bool {
        self.state.lock().calculating
    }

    pub fn ref_count(&self) -> u32 {
        self.state.lock().ref_count
    }

    /// Currently published cache, if any consumer holds one open
    pub fn snapshot(&self) -> Option<Arc<RepositoryCache>> {
        self.state.lock().cache.clone()
    }

    /// Open the cache for `consumer`, building or refreshing it first.
    ///
    /// Returns `Broken(None)` if `consumer` already has it open and
    /// `Calculating` if another pipeline is running.
    pub fn open(
        &self,
        consumer: ConsumerId,
        source: &dyn LogSource,
        cancel: &CancellationToken,
    ) -> CacheStatus {
        let previous = {
            let mut state = self.state.lock();
            if state.opened_by.contains(&consumer) {
                warn!(root = %self.root_url, ?consumer, "cache already opened by consumer");
                return CacheStatus::Broken(None);
            }
            if state.calculating {
                return CacheStatus::Calculating;
            }
            state.calculating = true;
            state.cache.clone().map(|cache| (cache, state.meta.clone()))
        };
        let mut guard = CalculatingGuard {
            state: &self.state,
            armed: true,
        };

        let pipeline = FetchPipeline::new(source, &self.config, cancel);
        let result = match previous {
            Some((published, mut meta)) => {
                info!(root = %self.root_url, "refreshing revision cache");
                pipeline
                    .refresh_shared(&published, &mut meta)
                    .map(|(updated, _)| (updated.map_or(published, prepared), meta))
            }
            None => {
                info!(root = %self.root_url, "creating revision cache");
                CacheMetadata::load(self.meta_path.clone()).and_then(|mut meta| {
                    pipeline.create(&mut meta).map(|(cache, _)| (prepared(cache), meta))
                })
            }
        };

        match result {
            Ok((cache, meta)) => {
                let mut state = self.state.lock();
                if state.opened_by.insert(consumer) {
                    state.ref_count += 1;
                }
                state.cache = Some(Arc::clone(&cache));
                state.meta = meta;
                state.calculating = false;
                guard.disarm();
                info!(
                    root = %self.root_url,
                    revisions = cache.record_count(),
                    ref_count = state.ref_count,
                    "revision cache opened"
                );
                CacheStatus::Ready(cache)
            }
            Err(err) => {
                error!(root = %self.root_url, error = %err, "revision cache pipeline failed");
                CacheStatus::Broken(Some(err))
            }
        }
    }

    /// Fetch new revisions into the published cache.
    ///
    /// `Broken(None)` if nothing is published, `Calculating` if a pipeline
    /// is already running. Snapshots handed out earlier stay unchanged.
    pub fn refresh(&self, source: &dyn LogSource, cancel: &CancellationToken) -> CacheStatus {
        let (published, mut meta) = {
            let mut state = self.state.lock();
            let Some(published) = state.cache.clone() else {
                return CacheStatus::Broken(None);
            };
            if state.calculating {
                return CacheStatus::Calculating;
            }
            state.calculating = true;
            (published, state.meta.clone())
        };
        let mut guard = CalculatingGuard {
            state: &self.state,
            armed: true,
        };

        let result =
            FetchPipeline::new(source, &self.config, cancel).refresh_shared(&published, &mut meta);
        match result {
            Ok((updated, summary)) => {
                let cache = updated.map_or(published, prepared);
                let mut state = self.state.lock();
                // A close during the refresh may have released the cache
                if state.ref_count > 0 {
                    state.cache = Some(Arc::clone(&cache));
                }
                state.meta = meta;
                state.calculating = false;
                guard.disarm();
                info!(
                    root = %self.root_url,
                    fetched = summary.revisions_fetched,
                    "revision cache refreshed"
                );
                CacheStatus::Ready(cache)
            }
            Err(err) => {
                error!(root = %self.root_url, error = %err, "revision cache refresh failed");
                CacheStatus::Broken(Some(err))
            }
        }
    }

    /// Release `consumer`'s reference; the last close drops the cache.
    /// Closing a consumer that never opened is a no-op.
    pub fn close(&self, consumer: ConsumerId) {
        let mut state = self.state.lock();
        if !state.opened_by.remove(&consumer) {
            return;
        }
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 {
            state.cache = None;
            info!(root = %self.root_url, "revision cache released");
        }
    }

    /// Delete the metadata and data files. Refused while calculating.
    pub fn remove(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.calculating {
            return Ok(false);
        }
        remove_if_exists(&self.meta_path)?;
        remove_if_exists(&state.meta.data_path())?;
        state.meta = CacheMetadata::new(self.meta_path.clone());
        info!(root = %self.root_url, "revision cache removed");
        Ok(true)
    }

    /// Copy the metadata and data files into `dest`. Refused while
    /// calculating; a cache that was never saved copies nothing.
    pub fn export(&self, dest: &Path) -> Result<bool> {
        let state = self.state.lock();
        if state.calculating {
            return Ok(false);
        }
        let data_path = state.meta.data_path();
        if self.meta_path.exists() && data_path.exists() {
            fs::create_dir_all(dest)?;
            copy_into(&data_path, dest)?;
            copy_into(&self.meta_path, dest)?;
        }
        Ok(true)
    }
}

/// Build the derived indexes and wrap for publication
fn prepared(mut cache: RepositoryCache) -> Arc<RepositoryCache> {
    cache.prepare_model();
    Arc::new(cache)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

fn copy_into(file: &Path, dir: &Path) -> Result<()> {
    let name = file
        .file_name()
        .ok_or_else(|| CacheError::InvalidArgument(format!("{:?} has no file name", file)))?;
    fs::copy(file, dir.join(name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ConnectionInfo, LogEntries, LogRequest};
    use crate::revision::LogEntry;
    use tempfile::TempDir;

    struct StaticSource {
        head: u64,
    }

    impl LogSource for StaticSource {
        fn connect(&self, _cancel: &CancellationToken) -> Result<ConnectionInfo> {
            Ok(ConnectionInfo {
                has_connection: true,
                head_revision: self.head,
                supports_merge_info: false,
            })
        }

        fn fetch_log<'a>(
            &'a self,
            request: LogRequest,
            _cancel: &'a CancellationToken,
        ) -> Result<LogEntries<'a>> {
            Ok(Box::new((request.start..=request.end).map(|rev| {
                let mut entry = LogEntry::new(rev);
                entry.message = Some(format!("r{}", rev));
                Ok(entry)
            })))
        }
    }

    struct FailingSource;

    impl LogSource for FailingSource {
        fn connect(&self, _cancel: &CancellationToken) -> Result<ConnectionInfo> {
            Err(CacheError::Pipeline("host unreachable".to_string()))
        }

        fn fetch_log<'a>(
            &'a self,
            _request: LogRequest,
            _cancel: &'a CancellationToken,
        ) -> Result<LogEntries<'a>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn manager(tmp: &TempDir) -> CacheLifecycleManager {
        CacheLifecycleManager::new("example.org/svn", tmp.path().join("example.meta"), CacheConfig::default())
            .unwrap()
    }

    #[test]
    fn test_open_close_refcount() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();

        let first = mgr.open(ConsumerId(1), &StaticSource { head: 3 }, &cancel);
        assert_eq!(first.cache().unwrap().record_count(), 3);
        let second = mgr.open(ConsumerId(2), &StaticSource { head: 5 }, &cancel);
        assert_eq!(second.cache().unwrap().record_count(), 5);
        // First snapshot is untouched by the refresh
        assert_eq!(first.cache().unwrap().record_count(), 3);
        assert_eq!(mgr.ref_count(), 2);

        mgr.close(ConsumerId(1));
        assert_eq!(mgr.ref_count(), 1);
        assert!(mgr.snapshot().is_some());
        mgr.close(ConsumerId(2));
        assert_eq!(mgr.ref_count(), 0);
        assert!(mgr.snapshot().is_none());
    }

    #[test]
    fn test_current_cache_is_shared_not_copied() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();

        let first = mgr.open(ConsumerId(1), &StaticSource { head: 3 }, &cancel);
        let second = mgr.open(ConsumerId(2), &StaticSource { head: 3 }, &cancel);
        assert!(Arc::ptr_eq(first.cache().unwrap(), second.cache().unwrap()));
        assert_eq!(mgr.ref_count(), 2);

        let refreshed = mgr.refresh(&StaticSource { head: 3 }, &cancel);
        assert!(Arc::ptr_eq(first.cache().unwrap(), refreshed.cache().unwrap()));

        let third = mgr.open(ConsumerId(3), &StaticSource { head: 4 }, &cancel);
        assert!(!Arc::ptr_eq(first.cache().unwrap(), third.cache().unwrap()));
        assert_eq!(third.cache().unwrap().record_count(), 4);
        assert_eq!(first.cache().unwrap().record_count(), 3);
    }

    #[test]
    fn test_reopen_by_same_consumer_is_broken() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();
        assert!(mgr.open(ConsumerId(1), &StaticSource { head: 2 }, &cancel).is_ready());
        assert!(matches!(
            mgr.open(ConsumerId(1), &StaticSource { head: 2 }, &cancel),
            CacheStatus::Broken(None)
        ));
        assert_eq!(mgr.ref_count(), 1);
    }

    #[test]
    fn test_stray_close_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();
        mgr.open(ConsumerId(1), &StaticSource { head: 2 }, &cancel);
        mgr.close(ConsumerId(99));
        assert_eq!(mgr.ref_count(), 1);
        assert!(mgr.snapshot().is_some());
    }

    #[test]
    fn test_failed_pipeline_is_broken_and_clears_calculating() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();
        let status = mgr.open(ConsumerId(1), &FailingSource, &cancel);
        assert!(matches!(status, CacheStatus::Broken(Some(CacheError::Pipeline(_)))));
        assert!(!mgr.is_calculating());
        assert_eq!(mgr.ref_count(), 0);
        assert!(mgr.snapshot().is_none());
    }

    #[test]
    fn test_refresh_requires_published_cache() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();
        assert!(matches!(
            mgr.refresh(&StaticSource { head: 1 }, &cancel),
            CacheStatus::Broken(None)
        ));

        mgr.open(ConsumerId(1), &StaticSource { head: 1 }, &cancel);
        let status = mgr.refresh(&StaticSource { head: 4 }, &cancel);
        assert_eq!(status.cache().unwrap().record_count(), 4);
        assert_eq!(mgr.metadata().last_processed_revision, 4);
        assert_eq!(mgr.ref_count(), 1);
    }

    #[test]
    fn test_remove_and_export() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let cancel = CancellationToken::new();
        mgr.open(ConsumerId(1), &StaticSource { head: 2 }, &cancel);
        mgr.close(ConsumerId(1));

        let dest = tmp.path().join("export");
        assert!(mgr.export(&dest).unwrap());
        assert!(dest.join("example.meta").exists());
        assert!(dest.join("example.data").exists());

        assert!(mgr.remove().unwrap());
        assert!(!tmp.path().join("example.meta").exists());
        assert!(!tmp.path().join("example.data").exists());
        assert_eq!(mgr.metadata().last_processed_revision, 0);
    }
}
