//! Registry of repository caches in one cache directory
//!
//! `repositories.data` lists every known root as two lines: the root URL
//! without its scheme, then the name of its metadata file. The registry is
//! an ordinary value owned by the application; there is no global instance.

use crate::cache_info::{is_plain_file_name, CacheMetadata};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::lifecycle::CacheLifecycleManager;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

/// Registry file name inside a cache directory
pub const REGISTRY_FILE_NAME: &str = "repositories.data";

const KNOWN_SCHEMES: &[&str] = &["http://", "https://", "svn://", "svn+ssh://", "file:///", "file://"];

static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("file name pattern is valid"));

/// Root URL with a known scheme removed
pub fn repository_root(url: &str) -> &str {
    KNOWN_SCHEMES
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .unwrap_or(url)
}

/// File-system safe name for a root: unsafe characters become `_`, the
/// rest is form-urlencoded.
pub fn escape_root(root: &str) -> String {
    let replaced = UNSAFE_FILE_CHARS.replace_all(root, "_");
    url::form_urlencoded::byte_serialize(replaced.as_bytes()).collect()
}

/// Read `(root, meta file name)` pairs; a dangling last line is ignored
fn read_registry_file(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    let lines: Vec<&str> = text.lines().collect();
    Ok(lines
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect())
}

/// Write pairs, or delete the file when there are none
fn write_registry_file(path: &Path, entries: &[(String, String)]) -> Result<()> {
    if entries.is_empty() {
        if path.exists() {
            fs::remove_file(path)?;
        }
        return Ok(());
    }
    let mut text = String::new();
    for (root, meta_file) in entries {
        text.push_str(root);
        text.push('\n');
        text.push_str(meta_file);
        text.push('\n');
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, text)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

struct RegistryState {
    cache_dir: PathBuf,
    config: CacheConfig,
    caches: BTreeMap<String, Arc<CacheLifecycleManager>>,
}

impl RegistryState {
    fn open(cache_dir: PathBuf) -> Result<Self> {
        let mut state = Self {
            config: CacheConfig::default(),
            cache_dir,
            caches: BTreeMap::new(),
        };
        if !state.cache_dir.exists() {
            fs::create_dir_all(&state.cache_dir)?;
        } else {
            state.load()?;
        }
        Ok(state)
    }

    fn load(&mut self) -> Result<()> {
        self.config = CacheConfig::load(&self.cache_dir)?;
        for (root, meta_file) in read_registry_file(&self.registry_path())? {
            if !is_plain_file_name(&meta_file) {
                warn!(root = %root, meta_file = %meta_file, "registry entry points outside the cache directory, skipped");
                continue;
            }
            let manager =
                CacheLifecycleManager::new(root.clone(), self.cache_dir.join(&meta_file), self.config.clone())?;
            self.caches.insert(root, Arc::new(manager));
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let entries: Vec<(String, String)> = self
            .caches
            .values()
            .map(|m| (m.root_url().to_string(), m.metadata().meta_file_name()))
            .collect();
        write_registry_file(&self.registry_path(), &entries)
    }

    fn registry_path(&self) -> PathBuf {
        self.cache_dir.join(REGISTRY_FILE_NAME)
    }
}

/// All repository caches under one directory
pub struct CacheRegistry {
    state: Mutex<RegistryState>,
}

impl CacheRegistry {
    /// Open `cache_dir`, creating it if missing and loading it otherwise.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let state = RegistryState::open(cache_dir.into())?;
        info!(dir = ?state.cache_dir, caches = state.caches.len(), "opened cache registry");
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state.lock().cache_dir.clone()
    }

    pub fn config(&self) -> CacheConfig {
        self.state.lock().config.clone()
    }

    /// Manager for `root_url`, registering the root on first use
    pub fn cache_for(&self, root_url: &str) -> Result<Arc<CacheLifecycleManager>> {
        let root = repository_root(root_url);
        if root.is_empty() {
            return Err(CacheError::InvalidArgument(format!("empty repository root '{}'", root_url)));
        }
        let mut state = self.state.lock();
        if let Some(manager) = state.caches.get(root) {
            return Ok(Arc::clone(manager));
        }

        let meta_path = state.cache_dir.join(format!("{}.meta", escape_root(root)));
        let manager = Arc::new(CacheLifecycleManager::new(root, meta_path, state.config.clone())?);
        state.caches.insert(root.to_string(), Arc::clone(&manager));
        state.save()?;
        info!(root, "registered repository cache");
        Ok(manager)
    }

    /// Manager for `root_url` if it is registered
    pub fn get(&self, root_url: &str) -> Option<Arc<CacheLifecycleManager>> {
        self.state.lock().caches.get(repository_root(root_url)).cloned()
    }

    /// Snapshot of every registered manager, ordered by root
    pub fn caches(&self) -> Vec<Arc<CacheLifecycleManager>> {
        self.state.lock().caches.values().cloned().collect()
    }

    /// Delete the given roots' files and unregister them.
    ///
    /// Roots that are calculating stay registered. Returns the removed roots.
    pub fn remove(&self, roots: &[&str]) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        for root_url in roots {
            let root = repository_root(root_url);
            let Some(manager) = state.caches.get(root).cloned() else {
                continue;
            };
            if manager.remove()? {
                state.caches.remove(root);
                removed.push(root.to_string());
            } else {
                warn!(root, "cache is calculating, not removed");
            }
        }
        if !removed.is_empty() {
            state.save()?;
        }
        Ok(removed)
    }

    /// Copy the given roots' caches into `dest` along with a registry file
    /// listing them. Returns the exported roots.
    pub fn export(&self, dest: &Path, roots: &[&str]) -> Result<Vec<String>> {
        fs::create_dir_all(dest)?;
        let state = self.state.lock();
        let mut exported = Vec::new();
        let mut entries = Vec::new();
        for root_url in roots {
            let root = repository_root(root_url);
            let Some(manager) = state.caches.get(root) else {
                continue;
            };
            if manager.export(dest)? {
                entries.push((root.to_string(), manager.metadata().meta_file_name()));
                exported.push(root.to_string());
            } else {
                warn!(root, "cache is calculating, not exported");
            }
        }
        write_registry_file(&dest.join(REGISTRY_FILE_NAME), &entries)?;
        info!(dest = ?dest, count = exported.len(), "exported caches");
        Ok(exported)
    }

    /// Copy in every cache listed by `src`'s registry file whose metadata
    /// and data files both exist, and register it. Returns imported roots.
    pub fn import(&self, src: &Path) -> Result<Vec<String>> {
        let listed = read_registry_file(&src.join(REGISTRY_FILE_NAME))?;
        let mut state = self.state.lock();
        let mut imported = Vec::new();
        for (root, meta_file) in listed {
            if !is_plain_file_name(&meta_file) {
                warn!(root = %root, meta_file = %meta_file, "metadata name is not a plain file name, skipped");
                continue;
            }
            let meta_src = src.join(&meta_file);
            if !meta_src.exists() {
                warn!(root = %root, "metadata missing in import directory, skipped");
                continue;
            }
            let data_file = CacheMetadata::load(&meta_src)?.data_file_name;
            if !is_plain_file_name(&data_file) {
                warn!(root = %root, data_file = %data_file, "data file name is not a plain file name, skipped");
                continue;
            }
            let data_src = src.join(&data_file);
            if !data_src.exists() {
                warn!(root = %root, "incomplete cache in import directory, skipped");
                continue;
            }
            fs::copy(&data_src, state.cache_dir.join(&data_file))?;
            fs::copy(&meta_src, state.cache_dir.join(&meta_file))?;

            let manager = CacheLifecycleManager::new(
                root.clone(),
                state.cache_dir.join(&meta_file),
                state.config.clone(),
            )?;
            state.caches.insert(root.clone(), Arc::new(manager));
            state.save()?;
            imported.push(root);
        }
        info!(src = ?src, count = imported.len(), "imported caches");
        Ok(imported)
    }

    /// Forget every manager and reload from `cache_dir`
    pub fn change_cache_dir(&self, cache_dir: impl Into<PathBuf>) -> Result<()> {
        let fresh = RegistryState::open(cache_dir.into())?;
        let mut state = self.state.lock();
        info!(from = ?state.cache_dir, to = ?fresh.cache_dir, "changed cache directory");
        *state = fresh;
        Ok(())
    }
}
