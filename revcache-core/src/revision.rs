//! Revision record model
//!
//! Records reference paths, authors and messages by dictionary index so a
//! single revision stays a few dozen bytes once encoded.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Highest revision a cache can hold. Message indexes are `i32`.
pub const MAX_REVISION: u64 = i32::MAX as u64 - 1;

/// Array slot of `revision`
pub fn revision_slot(revision: u64) -> Result<usize> {
    if revision > MAX_REVISION {
        return Err(CacheError::InvalidArgument(format!(
            "revision {} is above r{}",
            revision, MAX_REVISION
        )));
    }
    Ok(revision as usize)
}

/// Grow `slots` to `len`, returning an error when the allocation fails
pub(crate) fn grow_slots<T>(slots: &mut Vec<T>, len: usize, fill: impl FnMut() -> T) -> Result<()> {
    if len > slots.len() {
        slots.try_reserve_exact(len - slots.len()).map_err(|e| {
            CacheError::InvalidArgument(format!("can not allocate {} slots: {}", len, e))
        })?;
        slots.resize_with(len, fill);
    }
    Ok(())
}

/// Kind of change applied to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    #[serde(rename = "A")]
    Add,
    #[serde(rename = "M")]
    Modify,
    #[serde(rename = "D")]
    Delete,
    #[serde(rename = "R")]
    Replace,
}

impl ChangeAction {
    /// Single letter code, as printed by `svn log -v`
    pub fn as_char(self) -> char {
        match self {
            ChangeAction::Add => 'A',
            ChangeAction::Modify => 'M',
            ChangeAction::Delete => 'D',
            ChangeAction::Replace => 'R',
        }
    }

    pub fn from_char(code: char) -> Result<Self> {
        match code.to_ascii_uppercase() {
            'A' => Ok(ChangeAction::Add),
            'M' => Ok(ChangeAction::Modify),
            'D' => Ok(ChangeAction::Delete),
            'R' => Ok(ChangeAction::Replace),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown change action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Where a copied path came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopySource {
    pub path_index: i32,
    pub revision: u64,
}

/// One path touched by a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path_index: i32,
    pub action: ChangeAction,
    pub copied_from: Option<CopySource>,
}

/// Metadata of one processed revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision: u64,
    /// Author dictionary index, `UNKNOWN_INDEX` when the log had no author
    pub author_index: i32,
    /// Commit time in milliseconds since the Unix epoch
    pub timestamp: i64,
    pub message_index: i32,
    pub changed_paths: Vec<ChangedPath>,
}

impl RevisionRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// A copy of some path, seen from the copy source's side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    pub changed_path: ChangedPath,
    /// Revision that made the copy
    pub revision: u64,
}

/// Reverse of `ChangedPath::copied_from`: source path -> copies made from it
///
/// Derived data. Never persisted, rebuilt with [`CopyIndex::rebuild`].
#[derive(Debug, Clone, Default)]
pub struct CopyIndex {
    targets: HashMap<i32, Vec<CopyTarget>>,
}

impl CopyIndex {
    /// Rebuild from scratch over every present record
    pub fn rebuild<'a>(&mut self, records: impl IntoIterator<Item = &'a RevisionRecord>) {
        self.targets.clear();
        for record in records {
            for changed in &record.changed_paths {
                if let Some(source) = changed.copied_from {
                    self.targets
                        .entry(source.path_index)
                        .or_default()
                        .push(CopyTarget {
                            changed_path: changed.clone(),
                            revision: record.revision,
                        });
                }
            }
        }
    }

    /// Copies whose source is exactly `path_index`
    pub fn targets(&self, path_index: i32) -> &[CopyTarget] {
        self.targets.get(&path_index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Source paths that were copied at least once
    pub fn sources(&self) -> impl Iterator<Item = i32> + '_ {
        self.targets.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// revision -> revisions merged into it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeIndex {
    merges: BTreeMap<u64, BTreeSet<u64>>,
}

impl MergeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `merged_from` into the set for `revision`.
    /// Returns true if anything new was recorded.
    pub fn add(&mut self, revision: u64, merged_from: &[u64]) -> bool {
        if merged_from.is_empty() {
            return false;
        }
        let set = self.merges.entry(revision).or_default();
        let before = set.len();
        set.extend(merged_from.iter().copied());
        set.len() != before
    }

    pub fn merged_into(&self, revision: u64) -> Option<&BTreeSet<u64>> {
        self.merges.get(&revision)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &BTreeSet<u64>)> {
        self.merges.iter().map(|(rev, set)| (*rev, set))
    }

    /// Source -> targets view, the reverse of this index
    pub fn reversed(&self) -> BTreeMap<u64, BTreeSet<u64>> {
        let mut reversed: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for (target, sources) in &self.merges {
            for source in sources {
                reversed.entry(*source).or_default().insert(*target);
            }
        }
        reversed
    }

    /// Number of revisions with merge edges
    pub fn len(&self) -> usize {
        self.merges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

/// One changed path as delivered by a log source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPath {
    pub path: String,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_from_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_from_revision: Option<u64>,
}

impl LogPath {
    pub fn new(path: impl Into<String>, action: ChangeAction) -> Self {
        Self {
            path: path.into(),
            action,
            copied_from_path: None,
            copied_from_revision: None,
        }
    }

    pub fn copied_from(mut self, path: impl Into<String>, revision: u64) -> Self {
        self.copied_from_path = Some(path.into());
        self.copied_from_revision = Some(revision);
        self
    }
}

/// One revision as delivered by a log source
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub revision: u64,
    #[serde(default)]
    pub author: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub changed_paths: Vec<LogPath>,
    /// Revisions merged into this one, filled when merge discovery is on
    #[serde(default)]
    pub merge_children: Vec<u64>,
}

impl LogEntry {
    pub fn new(revision: u64) -> Self {
        Self {
            revision,
            ..Default::default()
        }
    }
}
