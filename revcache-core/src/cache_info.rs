//! Per-repository metadata file
//!
//! Plain `key=value` text next to the data file:
//! ```text
//! start_skipped_revision=0
//! end_skipped_revision=0
//! last_processed_revision=1200
//! merge_start_skipped_revision=0
//! merge_end_skipped_revision=0
//! merge_last_processed_revision=1200
//! data_file_name=example.org_svn.data
//! ```
//! Unknown keys are ignored; missing or unparsable numbers read as 0.

use crate::error::Result;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const START_SKIPPED: &str = "start_skipped_revision";
const END_SKIPPED: &str = "end_skipped_revision";
const LAST_PROCESSED: &str = "last_processed_revision";
const MERGE_START_SKIPPED: &str = "merge_start_skipped_revision";
const MERGE_END_SKIPPED: &str = "merge_end_skipped_revision";
const MERGE_LAST_PROCESSED: &str = "merge_last_processed_revision";
const DATA_FILE_NAME: &str = "data_file_name";

/// Inclusive range of revisions that still have to be fetched.
/// `start == 0` means no pending range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkippedRange {
    pub start: u64,
    pub end: u64,
}

impl SkippedRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn is_pending(&self) -> bool {
        self.start != 0 && self.start <= self.end
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Fetch progress for one repository root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetadata {
    meta_path: PathBuf,
    pub skipped: SkippedRange,
    pub last_processed_revision: u64,
    pub merge_skipped: SkippedRange,
    pub merge_last_processed_revision: u64,
    pub data_file_name: String,
}

/// Data file name derived from a metadata file name: `foo.meta` -> `foo.data`
pub fn data_file_name_for(meta_file_name: &str) -> String {
    let stem = match meta_file_name.rfind('.') {
        Some(dot) => &meta_file_name[..dot],
        None => meta_file_name,
    };
    format!("{}.data", stem)
}

/// True when `name` is one path component: no separators, not `.` or `..`
pub fn is_plain_file_name(name: &str) -> bool {
    Path::new(name).file_name() == Some(OsStr::new(name))
}

impl CacheMetadata {
    /// Fresh metadata for `meta_path`; nothing is read or written.
    pub fn new(meta_path: impl Into<PathBuf>) -> Self {
        let meta_path = meta_path.into();
        let data_file_name = data_file_name_for(&file_name_of(&meta_path));
        Self {
            meta_path,
            skipped: SkippedRange::default(),
            last_processed_revision: 0,
            merge_skipped: SkippedRange::default(),
            merge_last_processed_revision: 0,
            data_file_name,
        }
    }

    /// Read `meta_path` if it exists, otherwise return fresh metadata.
    pub fn load(meta_path: impl Into<PathBuf>) -> Result<Self> {
        let mut meta = Self::new(meta_path);
        if !meta.meta_path.exists() {
            return Ok(meta);
        }
        let text = fs::read_to_string(&meta.meta_path)?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            let number = || value.parse::<u64>().unwrap_or(0);
            match key.trim() {
                START_SKIPPED => meta.skipped.start = number(),
                END_SKIPPED => meta.skipped.end = number(),
                LAST_PROCESSED => meta.last_processed_revision = number(),
                MERGE_START_SKIPPED => meta.merge_skipped.start = number(),
                MERGE_END_SKIPPED => meta.merge_skipped.end = number(),
                MERGE_LAST_PROCESSED => meta.merge_last_processed_revision = number(),
                DATA_FILE_NAME if is_plain_file_name(value) => meta.data_file_name = value.to_string(),
                DATA_FILE_NAME if !value.is_empty() => {
                    warn!(path = ?meta.meta_path, name = value, "ignoring data file name outside the cache directory");
                }
                _ => {}
            }
        }
        Ok(meta)
    }

    /// Write through a temp file so a crash never leaves a half-written file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.meta_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = format!(
            "{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n{}={}\n",
            START_SKIPPED,
            self.skipped.start,
            END_SKIPPED,
            self.skipped.end,
            LAST_PROCESSED,
            self.last_processed_revision,
            MERGE_START_SKIPPED,
            self.merge_skipped.start,
            MERGE_END_SKIPPED,
            self.merge_skipped.end,
            MERGE_LAST_PROCESSED,
            self.merge_last_processed_revision,
            DATA_FILE_NAME,
            self.data_file_name,
        );
        let tmp_path = self.meta_path.with_extension("meta.tmp");
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, &self.meta_path)?;
        Ok(())
    }

    /// Forget all progress, keeping the file names.
    pub fn reset(&mut self) {
        self.skipped.clear();
        self.last_processed_revision = 0;
        self.merge_skipped.clear();
        self.merge_last_processed_revision = 0;
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn meta_file_name(&self) -> String {
        file_name_of(&self.meta_path)
    }

    pub fn data_path(&self) -> PathBuf {
        match self.meta_path.parent() {
            Some(dir) => dir.join(&self.data_file_name),
            None => PathBuf::from(&self.data_file_name),
        }
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
