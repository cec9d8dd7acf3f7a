//! Lifecycle and registry integration tests across threads

use parking_lot::Mutex;
use revcache_core::{
    CacheConfig, CacheLifecycleManager, CacheRegistry, CacheStatus, ConnectionInfo, ConsumerId,
    LogEntries, LogEntry, LogRequest, LogSource, Result,
};
use std::sync::mpsc;
use std::thread;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Serves `1..=head`, parking inside `connect` until released
struct GatedSource {
    head: u64,
    entered: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl GatedSource {
    fn new(head: u64) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let source = Self {
            head,
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };
        (source, entered_rx, release_tx)
    }
}

impl LogSource for GatedSource {
    fn connect(&self, _cancel: &CancellationToken) -> Result<ConnectionInfo> {
        let _ = self.entered.send(());
        let _ = self.release.lock().recv();
        Ok(ConnectionInfo {
            has_connection: true,
            head_revision: self.head,
            supports_merge_info: false,
        })
    }

    fn fetch_log<'a>(&'a self, request: LogRequest, _cancel: &'a CancellationToken) -> Result<LogEntries<'a>> {
        Ok(Box::new((request.start..=request.end).map(|revision| {
            Ok(LogEntry {
                author: Some("builder".to_string()),
                message: Some(format!("revision {}", revision)),
                ..LogEntry::new(revision)
            })
        })))
    }
}

struct InstantSource {
    head: u64,
}

impl LogSource for InstantSource {
    fn connect(&self, _cancel: &CancellationToken) -> Result<ConnectionInfo> {
        Ok(ConnectionInfo {
            has_connection: true,
            head_revision: self.head,
            supports_merge_info: false,
        })
    }

    fn fetch_log<'a>(&'a self, request: LogRequest, _cancel: &'a CancellationToken) -> Result<LogEntries<'a>> {
        Ok(Box::new((request.start..=request.end).map(|revision| Ok(LogEntry::new(revision)))))
    }
}

#[test]
fn test_second_open_sees_calculating() {
    let temp_dir = TempDir::new().unwrap();
    let manager = CacheLifecycleManager::new(
        "example.org/svn",
        temp_dir.path().join("example.meta"),
        CacheConfig::default(),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let (gated, entered, release) = GatedSource::new(5);

    thread::scope(|scope| {
        let first = scope.spawn(|| manager.open(ConsumerId(1), &gated, &cancel));
        entered.recv().unwrap();

        assert!(manager.is_calculating());
        let second = manager.open(ConsumerId(2), &InstantSource { head: 5 }, &cancel);
        assert!(matches!(second, CacheStatus::Calculating));
        assert!(!manager.remove().unwrap());
        assert!(!manager.export(&temp_dir.path().join("out")).unwrap());

        release.send(()).unwrap();
        let first = first.join().unwrap();
        assert_eq!(first.cache().unwrap().record_count(), 5);
    });

    assert!(!manager.is_calculating());
    assert_eq!(manager.ref_count(), 1);

    let second = manager.open(ConsumerId(2), &InstantSource { head: 7 }, &cancel);
    assert_eq!(second.cache().unwrap().record_count(), 7);
    assert_eq!(manager.ref_count(), 2);

    manager.close(ConsumerId(1));
    assert_eq!(manager.ref_count(), 1);
    assert!(manager.snapshot().is_some());
    manager.close(ConsumerId(2));
    assert_eq!(manager.ref_count(), 0);
    assert!(manager.snapshot().is_none());
}

#[test]
fn test_close_during_refresh_drops_result() {
    let temp_dir = TempDir::new().unwrap();
    let manager = CacheLifecycleManager::new(
        "example.org/svn",
        temp_dir.path().join("example.meta"),
        CacheConfig::default(),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    assert!(manager.open(ConsumerId(1), &InstantSource { head: 2 }, &cancel).is_ready());

    let (gated, entered, release) = GatedSource::new(4);
    thread::scope(|scope| {
        let refresh = scope.spawn(|| manager.refresh(&gated, &cancel));
        entered.recv().unwrap();
        manager.close(ConsumerId(1));
        release.send(()).unwrap();

        let status = refresh.join().unwrap();
        assert_eq!(status.cache().unwrap().record_count(), 4);
    });

    assert!(manager.snapshot().is_none());
    assert_eq!(manager.metadata().last_processed_revision, 4);
}

#[test]
fn test_reopen_loads_saved_cache() {
    let temp_dir = TempDir::new().unwrap();
    let meta_path = temp_dir.path().join("example.meta");
    let cancel = CancellationToken::new();
    {
        let manager =
            CacheLifecycleManager::new("example.org/svn", &meta_path, CacheConfig::default()).unwrap();
        assert!(manager.open(ConsumerId(1), &InstantSource { head: 6 }, &cancel).is_ready());
        manager.close(ConsumerId(1));
    }

    let manager = CacheLifecycleManager::new("example.org/svn", &meta_path, CacheConfig::default()).unwrap();
    assert_eq!(manager.metadata().last_processed_revision, 6);
    let status = manager.open(ConsumerId(1), &InstantSource { head: 6 }, &cancel);
    assert_eq!(status.cache().unwrap().record_count(), 6);
}

#[test]
fn test_registry_export_import() {
    let temp_dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let origin = CacheRegistry::open(temp_dir.path().join("origin")).unwrap();
    for (root, head) in [("https://one.example.org/svn", 3), ("svn://two.example.org/repo", 4)] {
        let manager = origin.cache_for(root).unwrap();
        assert!(manager.open(ConsumerId(1), &InstantSource { head }, &cancel).is_ready());
        manager.close(ConsumerId(1));
    }

    let bundle = temp_dir.path().join("bundle");
    let exported = origin.export(&bundle, &["svn://two.example.org/repo"]).unwrap();
    assert_eq!(exported, vec!["two.example.org/repo"]);

    let target = CacheRegistry::open(temp_dir.path().join("target")).unwrap();
    let imported = target.import(&bundle).unwrap();
    assert_eq!(imported, vec!["two.example.org/repo"]);

    let manager = target.get("two.example.org/repo").unwrap();
    assert_eq!(manager.metadata().last_processed_revision, 4);
    let status = manager.open(ConsumerId(7), &InstantSource { head: 4 }, &cancel);
    assert_eq!(status.cache().unwrap().record_count(), 4);
}
