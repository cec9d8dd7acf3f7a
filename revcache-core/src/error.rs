//! Error types for the revision cache

use std::path::PathBuf;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while building, saving or loading a cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed {section} section: {reason}")]
    Decode { section: &'static str, reason: String },

    #[error("Cache file {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Fetch pipeline failed: {0}")]
    Pipeline(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CacheError {
    pub(crate) fn decode(section: &'static str, reason: impl ToString) -> Self {
        CacheError::Decode {
            section,
            reason: reason.to_string(),
        }
    }

    /// True for errors that mean the bytes on disk can not be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CacheError::Decode { .. } | CacheError::Corrupt { .. })
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::decode("record", err)
    }
}
