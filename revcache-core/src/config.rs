//! Cache configuration stored at `<cache-dir>/cache-config.json`

use crate::block_codec::{Compression, DEFAULT_REVISIONS_IN_BLOCK};
use crate::error::{CacheError, Result};
use crate::message_store::MIN_PAIR_COUNT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File name of the configuration inside a cache directory
pub const CONFIG_FILE_NAME: &str = "cache-config.json";

/// Tuning knobs shared by every cache in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Records per compressed block in the data file.
    pub revisions_in_block: usize,
    /// Codec for newly written data files.
    pub compression: Compression,
    /// Revisions fetched between checkpoint saves.
    pub save_interval: u64,
    /// Occurrences before a message token pair becomes a phrase.
    pub min_pair_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            revisions_in_block: DEFAULT_REVISIONS_IN_BLOCK,
            compression: Compression::Deflate,
            save_interval: 1000,
            min_pair_count: MIN_PAIR_COUNT,
        }
    }
}

impl CacheConfig {
    /// Load from a cache directory, falling back to defaults when absent.
    pub fn load(cache_dir: &Path) -> Result<Self> {
        let config_path = cache_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: CacheConfig = serde_json::from_str(&data)
            .map_err(|e| CacheError::Config(format!("{:?}: {}", config_path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a cache directory.
    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = cache_dir.join(CONFIG_FILE_NAME);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| CacheError::Config(e.to_string()))?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.revisions_in_block == 0 {
            return Err(CacheError::Config("revisions_in_block must be positive".into()));
        }
        if self.save_interval == 0 {
            return Err(CacheError::Config("save_interval must be positive".into()));
        }
        if self.min_pair_count < 2 {
            return Err(CacheError::Config("min_pair_count must be at least 2".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::load(tmp.path()).unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.revisions_in_block, 1000);
        assert_eq!(config.min_pair_count, 5);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig {
            compression: Compression::Zstd,
            save_interval: 50,
            ..Default::default()
        };
        config.save(tmp.path()).unwrap();
        assert!(!tmp.path().join("cache-config.tmp").exists());
        assert_eq!(CacheConfig::load(tmp.path()).unwrap(), config);
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE_NAME), r#"{"compression": "zstd"}"#).unwrap();
        let config = CacheConfig::load(tmp.path()).unwrap();
        assert_eq!(config.compression, Compression::Zstd);
        assert_eq!(config.save_interval, 1000);
    }

    #[test]
    fn test_config_rejects_zero_block() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE_NAME), r#"{"revisions_in_block": 0}"#).unwrap();
        assert!(matches!(
            CacheConfig::load(tmp.path()),
            Err(CacheError::Config(_))
        ));
    }
}
