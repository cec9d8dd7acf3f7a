//! In-memory revision cache for one repository root
//!
//! Data file layout (little-endian):
//! ```text
//! format_version i32 | codec u8
//! revision blocks            (see block_codec)
//! path strings blob | path pairs blob
//! authors blob
//! messages blob
//! merge index blob           (format_version >= 2)
//! ```

use crate::block_codec::{self, BlockCodec, Compression};
use crate::config::CacheConfig;
use crate::dictionary::{Dictionary, Pair, UNKNOWN_INDEX};
use crate::error::{CacheError, Result};
use crate::message_store::MessageStore;
use crate::path_dictionary::PathDictionary;
use crate::revision::{
    grow_slots, revision_slot, ChangedPath, CopyIndex, CopySource, CopyTarget, LogEntry,
    MergeIndex, RevisionRecord,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};

/// Current data file version. Version 1 files have no merge section.
pub const FORMAT_VERSION: i32 = 2;

/// Revision history of one repository, addressed by revision number
#[derive(Debug, Clone)]
pub struct RepositoryCache {
    /// Slots up to the highest present revision
    revisions: Vec<Option<RevisionRecord>>,
    /// Slot count including trailing gaps, never below `revisions.len()`
    slot_count: usize,
    paths: PathDictionary,
    authors: Dictionary<String>,
    messages: MessageStore,
    merges: MergeIndex,
    copy_index: CopyIndex,
    merge_targets: BTreeMap<u64, BTreeSet<u64>>,
    format_version: i32,
    dirty: bool,
}

impl Default for RepositoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryCache {
    pub fn new() -> Self {
        Self {
            revisions: Vec::new(),
            slot_count: 0,
            paths: PathDictionary::new(),
            authors: Dictionary::strings(),
            messages: MessageStore::new(),
            merges: MergeIndex::new(),
            copy_index: CopyIndex::default(),
            merge_targets: BTreeMap::new(),
            format_version: FORMAT_VERSION,
            dirty: false,
        }
    }

    /// Make room for revisions `0..=last_revision`. Never shrinks.
    ///
    /// Trailing empty slots are only counted; storage grows when a record
    /// is added.
    pub fn expand_revisions_count(&mut self, last_revision: u64) -> Result<()> {
        let slots = revision_slot(last_revision)? + 1;
        self.slot_count = self.slot_count.max(slots);
        Ok(())
    }

    /// Intern a log entry and store it at its revision
    pub fn add_entry(&mut self, entry: &LogEntry) -> Result<()> {
        revision_slot(entry.revision)?;
        let author_index = entry
            .author
            .as_deref()
            .map_or(UNKNOWN_INDEX, |author| self.authors.add_str(author));
        let message_index = self
            .messages
            .set_message(entry.revision, entry.message.as_deref())?;
        let changed_paths = entry
            .changed_paths
            .iter()
            .map(|log_path| {
                let path_index = self.paths.add(&log_path.path);
                let copied_from = match (&log_path.copied_from_path, log_path.copied_from_revision) {
                    (Some(path), Some(revision)) => Some(CopySource {
                        path_index: self.paths.add(path),
                        revision,
                    }),
                    _ => None,
                };
                ChangedPath {
                    path_index,
                    action: log_path.action,
                    copied_from,
                }
            })
            .collect();

        self.add_revision(RevisionRecord {
            revision: entry.revision,
            author_index,
            timestamp: entry.date,
            message_index,
            changed_paths,
        })
    }

    /// Store `record` at `record.revision`, replacing any previous record
    pub fn add_revision(&mut self, record: RevisionRecord) -> Result<()> {
        let slot = revision_slot(record.revision)?;
        grow_slots(&mut self.revisions, slot + 1, || None)?;
        self.slot_count = self.slot_count.max(slot + 1);
        self.revisions[slot] = Some(record);
        self.dirty = true;
        Ok(())
    }

    /// Record that `merged_from` were merged into `revision`
    pub fn add_merge_info(&mut self, revision: u64, merged_from: &[u64]) {
        if merged_from.is_empty() {
            return;
        }
        self.merges.add(revision, merged_from);
        self.dirty = true;
    }

    /// Rebuild the derived copy and merge-target indexes.
    ///
    /// Call after `load` and after a batch of additions, before querying.
    pub fn prepare_model(&mut self) {
        self.copy_index.rebuild(self.revisions.iter().flatten());
        self.merge_targets = self.merges.reversed();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn format_version(&self) -> i32 {
        self.format_version
    }

    /// Number of revision slots, gaps included
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Number of present revisions
    pub fn record_count(&self) -> usize {
        self.revisions.iter().filter(|r| r.is_some()).count()
    }

    pub fn revision(&self, revision: u64) -> Option<&RevisionRecord> {
        usize::try_from(revision)
            .ok()
            .and_then(|slot| self.revisions.get(slot))
            .and_then(Option::as_ref)
    }

    /// Present revisions in ascending order
    pub fn revisions(&self) -> impl DoubleEndedIterator<Item = &RevisionRecord> {
        self.revisions.iter().flatten()
    }

    /// Highest present revision
    pub fn last_revision(&self) -> Option<u64> {
        self.revisions().next_back().map(|r| r.revision)
    }

    pub fn paths(&self) -> &PathDictionary {
        &self.paths
    }

    pub fn authors(&self) -> &Dictionary<String> {
        &self.authors
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn merges(&self) -> &MergeIndex {
        &self.merges
    }

    pub fn author(&self, record: &RevisionRecord) -> Option<&str> {
        self.authors.try_get(record.author_index).map(String::as_str)
    }

    pub fn message(&self, record: &RevisionRecord) -> Option<String> {
        self.messages.get_message(record.message_index)
    }

    pub fn path(&self, path_index: i32) -> String {
        self.paths.get_path(path_index)
    }

    /// Copies made from exactly `path_index`
    pub fn copied_to(&self, path_index: i32) -> &[CopyTarget] {
        self.copy_index.targets(path_index)
    }

    pub fn copy_index(&self) -> &CopyIndex {
        &self.copy_index
    }

    /// Revisions merged into `revision`
    pub fn merged_from(&self, revision: u64) -> Option<&BTreeSet<u64>> {
        self.merges.merged_into(revision)
    }

    /// Revisions that `revision` was merged into
    pub fn merge_targets(&self, revision: u64) -> Option<&BTreeSet<u64>> {
        self.merge_targets.get(&revision)
    }

    /// Compress messages and write the cache to `path`.
    ///
    /// Writes `<path>.tmp` and renames it over `path`, so a failure leaves
    /// the previous file untouched. Clears the dirty flag on success.
    pub fn save(&mut self, path: &Path, config: &CacheConfig) -> Result<()> {
        let replaced = self.messages.compress_with(config.min_pair_count);
        debug!(
            replaced,
            phrases = self.messages.phrase_count(),
            "compressed messages"
        );

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let written = File::create(&tmp_path)
            .map_err(CacheError::from)
            .and_then(|file| {
                let mut w = BufWriter::new(file);
                self.write_to(&mut w, config)?;
                let file = w.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()?;
                Ok(())
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        fs::rename(&tmp_path, path)?;

        self.format_version = FORMAT_VERSION;
        self.dirty = false;
        info!(
            path = ?path,
            revisions = self.record_count(),
            paths = self.paths.len(),
            "saved revision cache"
        );
        Ok(())
    }

    fn write_to(&self, w: &mut impl Write, config: &CacheConfig) -> Result<()> {
        let compression = config.compression;
        block_codec::write_i32(w, FORMAT_VERSION)?;
        block_codec::write_u8(w, compression.code())?;

        BlockCodec::new(config.revisions_in_block, compression).encode(
            w,
            &self.revisions,
            self.slot_count,
        )?;

        block_codec::write_blob(w, compression, &bincode::serialize(self.paths.strings())?)?;
        block_codec::write_blob(w, compression, &bincode::serialize(self.paths.pairs())?)?;
        block_codec::write_blob(w, compression, &bincode::serialize(&self.authors)?)?;
        block_codec::write_blob(w, compression, &self.messages.to_bytes()?)?;
        block_codec::write_blob(w, compression, &bincode::serialize(&self.merges)?)?;
        w.flush()?;
        Ok(())
    }

    /// Read a cache written by [`save`](Self::save).
    ///
    /// Any malformed section makes the whole file [`CacheError::Corrupt`];
    /// a partially decoded cache is never returned.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);
        let mut cache = Self::read_from(&mut r).map_err(|err| {
            if err.is_corruption() {
                CacheError::Corrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            } else {
                err
            }
        })?;
        cache.prepare_model();
        info!(
            path = ?path,
            version = cache.format_version,
            revisions = cache.record_count(),
            "loaded revision cache"
        );
        Ok(cache)
    }

    fn read_from(r: &mut impl Read) -> Result<Self> {
        let format_version = block_codec::read_i32(r, "header")?;
        if !(1..=FORMAT_VERSION).contains(&format_version) {
            return Err(CacheError::decode(
                "header",
                format!("unsupported format version {}", format_version),
            ));
        }
        let compression = Compression::from_code(block_codec::read_u8(r, "header")?)?;

        // Block size is taken from the file header
        let (revisions, slot_count) = BlockCodec::new(1, compression).decode(r)?;

        let strings: Dictionary<String> =
            bincode::deserialize(&block_codec::read_blob(r, compression, "path")?)
                .map_err(|e| CacheError::decode("path", e))?;
        let pairs: Dictionary<Pair> =
            bincode::deserialize(&block_codec::read_blob(r, compression, "path")?)
                .map_err(|e| CacheError::decode("path", e))?;
        let paths = PathDictionary::from_parts(strings, pairs)?;

        let authors: Dictionary<String> =
            bincode::deserialize(&block_codec::read_blob(r, compression, "author")?)
                .map_err(|e| CacheError::decode("author", e))?;

        let messages =
            MessageStore::from_bytes(&block_codec::read_blob(r, compression, "message")?)?;

        let merges = if format_version >= 2 {
            bincode::deserialize(&block_codec::read_blob(r, compression, "merge")?)
                .map_err(|e| CacheError::decode("merge", e))?
        } else {
            MergeIndex::new()
        };

        let mut trailing = [0u8; 1];
        if r.read(&mut trailing)? != 0 {
            return Err(CacheError::decode("file", "trailing bytes after last section"));
        }

        let cache = Self {
            revisions,
            slot_count,
            paths,
            authors,
            messages,
            merges,
            copy_index: CopyIndex::default(),
            merge_targets: BTreeMap::new(),
            format_version,
            dirty: false,
        };
        cache.validate_references()?;
        Ok(cache)
    }

    /// Every index stored in a record must resolve in its dictionary
    fn validate_references(&self) -> Result<()> {
        let path_ok = |index: i32| index >= 0 && (index as usize) < self.paths.len();
        for record in self.revisions() {
            let author_ok = record.author_index == UNKNOWN_INDEX
                || self.authors.try_get(record.author_index).is_some();
            let message_ok = record.message_index >= 0
                && (record.message_index as usize) < self.messages.len();
            let paths_ok = record.changed_paths.iter().all(|cp| {
                path_ok(cp.path_index) && cp.copied_from.is_none_or(|src| path_ok(src.path_index))
            });
            if !(author_ok && message_ok && paths_ok) {
                return Err(CacheError::decode(
                    "revisions",
                    format!("revision {} references unknown dictionary entries", record.revision),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{ChangeAction, LogPath, MAX_REVISION};
    use tempfile::TempDir;

    fn entry(revision: u64, message: &str, paths: Vec<LogPath>) -> LogEntry {
        LogEntry {
            revision,
            author: Some("alice".to_string()),
            date: 1_600_000_000_000 + revision as i64,
            message: Some(message.to_string()),
            changed_paths: paths,
            merge_children: Vec::new(),
        }
    }

    fn sample() -> RepositoryCache {
        let mut cache = RepositoryCache::new();
        cache.expand_revisions_count(6).unwrap();
        cache.add_entry(&entry(1, "init", vec![LogPath::new("/trunk", ChangeAction::Add)])).unwrap();
        cache.add_entry(&entry(
            2,
            "add file",
            vec![LogPath::new("/trunk/a.txt", ChangeAction::Add)],
        )).unwrap();
        cache.add_entry(&entry(
            4,
            "branch",
            vec![LogPath::new("/branches/b1", ChangeAction::Add).copied_from("/trunk", 2)],
        )).unwrap();
        cache.add_entry(&LogEntry::new(5)).unwrap();
        cache.add_merge_info(5, &[4]);
        cache.prepare_model();
        cache
    }

    #[test]
    fn test_add_entry_interns_everything() {
        let cache = sample();
        assert_eq!(cache.slot_count(), 7);
        assert_eq!(cache.record_count(), 4);
        assert!(cache.revision(3).is_none());

        let rec = cache.revision(4).unwrap();
        assert_eq!(cache.author(rec), Some("alice"));
        assert_eq!(cache.message(rec).as_deref(), Some("branch"));
        let copied = rec.changed_paths[0].copied_from.unwrap();
        assert_eq!(cache.path(copied.path_index), "/trunk");
        assert_eq!(copied.revision, 2);

        let anonymous = cache.revision(5).unwrap();
        assert_eq!(anonymous.author_index, UNKNOWN_INDEX);
        assert_eq!(cache.author(anonymous), None);
        assert_eq!(cache.message(anonymous), None);
    }

    #[test]
    fn test_prepare_model_builds_indexes() {
        let cache = sample();
        let trunk = cache.paths().find_path("/trunk").unwrap();
        let copies = cache.copied_to(trunk);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].revision, 4);
        assert_eq!(cache.merge_targets(4).unwrap().iter().copied().collect::<Vec<_>>(), vec![5]);
        assert!(cache.merged_from(5).unwrap().contains(&4));
    }

    #[test]
    fn test_add_revision_overwrites_slot() {
        let mut cache = sample();
        cache.add_entry(&entry(2, "rewritten", vec![])).unwrap();
        assert_eq!(cache.message(cache.revision(2).unwrap()).as_deref(), Some("rewritten"));
        assert_eq!(cache.record_count(), 4);
    }

    #[test]
    fn test_revision_outside_index_space_is_rejected() {
        let mut cache = sample();
        let err = cache.add_entry(&LogEntry::new(MAX_REVISION + 1)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)), "{err}");
        assert!(cache.expand_revisions_count(u64::MAX).is_err());
        assert_eq!(cache.slot_count(), 7);
        assert_eq!(cache.record_count(), 4);
    }

    #[test]
    fn test_expand_counts_slots_without_storing_them() {
        let mut cache = RepositoryCache::new();
        cache.expand_revisions_count(MAX_REVISION).unwrap();
        assert_eq!(cache.slot_count(), MAX_REVISION as usize + 1);
        assert!(cache.revision(MAX_REVISION).is_none());
        cache.add_entry(&LogEntry::new(3)).unwrap();
        assert_eq!(cache.slot_count(), MAX_REVISION as usize + 1);
        assert_eq!(cache.last_revision(), Some(3));
    }

    #[test]
    fn test_dirty_flag() {
        let tmp = TempDir::new().unwrap();
        let mut cache = RepositoryCache::new();
        assert!(!cache.is_dirty());
        cache.add_merge_info(3, &[]);
        assert!(!cache.is_dirty());
        cache.add_merge_info(3, &[1]);
        assert!(cache.is_dirty());
        cache.save(&tmp.path().join("c.data"), &CacheConfig::default()).unwrap();
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repo.data");
        let mut cache = sample();
        cache.save(&path, &CacheConfig::default()).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = RepositoryCache::load(&path).unwrap();
        assert_eq!(loaded.slot_count(), cache.slot_count());
        assert_eq!(loaded.format_version(), FORMAT_VERSION);
        for rec in cache.revisions() {
            let other = loaded.revision(rec.revision).unwrap();
            assert_eq!(other, rec);
            assert_eq!(loaded.message(other), cache.message(rec));
            assert_eq!(loaded.author(other), cache.author(rec));
        }
        assert!(loaded.merged_from(5).unwrap().contains(&4));
        let trunk = loaded.paths().find_path("/trunk").unwrap();
        assert_eq!(loaded.copied_to(trunk).len(), 1);
    }

    #[test]
    fn test_zstd_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("z.data");
        let config = CacheConfig {
            compression: Compression::Zstd,
            ..Default::default()
        };
        let mut cache = sample();
        cache.save(&path, &config).unwrap();
        let loaded = RepositoryCache::load(&path).unwrap();
        assert_eq!(loaded.record_count(), 4);
    }

    #[test]
    fn test_load_truncated_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.data");
        sample().save(&path, &CacheConfig::default()).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        match RepositoryCache::load(&path) {
            Err(CacheError::Corrupt { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected corrupt, got {:?}", other.map(|c| c.record_count())),
        }
    }

    #[test]
    fn test_load_version_one_has_no_merge_section() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("v1.data");
        let mut cache = sample();
        cache.save(&path, &CacheConfig::default()).unwrap();

        // Rewrite as version 1: patch the header and drop the merge blob
        let mut bytes = fs::read(&path).unwrap();
        bytes[..4].copy_from_slice(&1i32.to_le_bytes());
        let merge_blob_len = {
            let mut blob = Vec::new();
            block_codec::write_blob(
                &mut blob,
                Compression::Deflate,
                &bincode::serialize(cache.merges()).unwrap(),
            )
            .unwrap();
            blob.len()
        };
        bytes.truncate(bytes.len() - merge_blob_len);
        fs::write(&path, &bytes).unwrap();

        let loaded = RepositoryCache::load(&path).unwrap();
        assert_eq!(loaded.format_version(), 1);
        assert!(loaded.merges().is_empty());
        assert_eq!(loaded.record_count(), 4);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = RepositoryCache::load(&tmp.path().join("absent.data")).unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
    }
}
