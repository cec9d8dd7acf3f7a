//! JSON-lines revision log used as the fetch collaborator.
//!
//! One object per line:
//!
//! ```json
//! {"revision": 4, "author": "alice", "date": "2024-03-01T10:00:00Z",
//!  "message": "Branch for 1.x",
//!  "changed_paths": [{"path": "/branches/1.x", "action": "A",
//!                     "copied_from_path": "/trunk", "copied_from_revision": 3}],
//!  "merge_children": []}
//! ```

use anyhow::{Context, Result};
use revcache_core::{CacheError, ConnectionInfo, LogEntries, LogEntry, LogPath, LogRequest, LogSource};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct LogLine {
    revision: u64,
    #[serde(default)]
    author: Option<String>,
    /// RFC 3339
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    changed_paths: Vec<LogPath>,
    #[serde(default)]
    merge_children: Vec<u64>,
}

impl LogLine {
    fn into_entry(self) -> Result<LogEntry> {
        let date = match &self.date {
            Some(text) => chrono::DateTime::parse_from_rfc3339(text)
                .with_context(|| format!("r{}: invalid date '{}'", self.revision, text))?
                .timestamp_millis(),
            None => 0,
        };
        Ok(LogEntry {
            revision: self.revision,
            author: self.author,
            date,
            message: self.message,
            changed_paths: self.changed_paths,
            merge_children: self.merge_children,
        })
    }
}

/// Log entries read from a file, sorted by revision
pub struct LogFileSource {
    entries: Vec<LogEntry>,
}

impl LogFileSource {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: LogLine =
                serde_json::from_str(line).with_context(|| format!("line {}", number + 1))?;
            entries.push(parsed.into_entry()?);
        }
        entries.sort_by_key(|entry| entry.revision);
        entries.dedup_by_key(|entry| entry.revision);
        Ok(Self { entries })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl LogSource for LogFileSource {
    fn connect(&self, _cancel: &CancellationToken) -> revcache_core::Result<ConnectionInfo> {
        Ok(ConnectionInfo {
            has_connection: true,
            head_revision: self.entries.last().map_or(0, |entry| entry.revision),
            supports_merge_info: self.entries.iter().any(|entry| !entry.merge_children.is_empty()),
        })
    }

    fn fetch_log<'a>(
        &'a self,
        request: LogRequest,
        cancel: &'a CancellationToken,
    ) -> revcache_core::Result<LogEntries<'a>> {
        let first = self.entries.partition_point(|entry| entry.revision < request.start);
        let entries = self.entries[first..]
            .iter()
            .take_while(move |entry| entry.revision <= request.end)
            .map(move |entry| {
                if cancel.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                let mut entry = entry.clone();
                if !request.discover_merges {
                    entry.merge_children.clear();
                }
                Ok(entry)
            });
        Ok(Box::new(entries))
    }
}

/// Source for reading a saved cache without fetching
pub struct OfflineSource;

impl LogSource for OfflineSource {
    fn connect(&self, _cancel: &CancellationToken) -> revcache_core::Result<ConnectionInfo> {
        Ok(ConnectionInfo::offline())
    }

    fn fetch_log<'a>(
        &'a self,
        _request: LogRequest,
        _cancel: &'a CancellationToken,
    ) -> revcache_core::Result<LogEntries<'a>> {
        Ok(Box::new(std::iter::empty()))
    }
}
