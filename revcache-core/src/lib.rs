//! Revision Cache Core Library
//!
//! Local cache of a repository's revision history for revision graphs:
//! - Interning dictionaries for paths, authors and phrase-compressed messages
//! - Block-compressed data file with versioned sections
//! - Key/value metadata tracking fetch progress and skipped ranges
//! - Resumable fetch pipeline over a pluggable log source
//! - Per-root lifecycle with reference counting and a cache registry

pub mod error;
pub mod dictionary;
pub mod path_dictionary;
pub mod message_store;
pub mod revision;
pub mod block_codec;
pub mod repository_cache;
pub mod history;
pub mod config;
pub mod cache_info;
pub mod fetch;
pub mod lifecycle;
pub mod registry;

pub use error::{CacheError, Result};
pub use dictionary::{Dictionary, Pair, UNKNOWN_INDEX};
pub use path_dictionary::{PathDictionary, ROOT_INDEX};
pub use message_store::{MessageStore, MIN_PAIR_COUNT};
pub use revision::{
    ChangeAction, ChangedPath, CopyIndex, CopySource, CopyTarget, LogEntry, LogPath,
    MergeIndex, RevisionRecord, MAX_REVISION,
};
pub use block_codec::{BlockCodec, Compression, DEFAULT_REVISIONS_IN_BLOCK};
pub use repository_cache::{RepositoryCache, FORMAT_VERSION};
pub use config::CacheConfig;
pub use cache_info::{CacheMetadata, SkippedRange};
pub use fetch::{ConnectionInfo, FetchPipeline, FetchSummary, LogEntries, LogRequest, LogSource};
pub use lifecycle::{CacheLifecycleManager, CacheStatus, ConsumerId};
pub use registry::{CacheRegistry, REGISTRY_FILE_NAME};
