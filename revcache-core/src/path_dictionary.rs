//! Path trie built on interned segments
//!
//! Every repository path is a node `(parent, segment)` in a pair dictionary,
//! so shared prefixes are stored once and a path is a single `i32`.
//! Parents are always inserted before their children, which gives the
//! invariant `parent index < child index` that `is_ancestor` relies on.

use crate::dictionary::{Dictionary, Pair};
use crate::error::{CacheError, Result};

/// Index of the repository root
pub const ROOT_INDEX: i32 = 0;

#[derive(Debug, Clone)]
pub struct PathDictionary {
    strings: Dictionary<String>,
    pairs: Dictionary<Pair>,
}

impl Default for PathDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl PathDictionary {
    pub fn new() -> Self {
        Self {
            strings: Dictionary::strings(),
            pairs: Dictionary::pairs(),
        }
    }

    /// Reassemble a dictionary from its two persisted halves
    ///
    /// Rejects data that breaks the trie invariants instead of producing
    /// paths that loop or point outside the tables.
    pub fn from_parts(strings: Dictionary<String>, pairs: Dictionary<Pair>) -> Result<Self> {
        if strings.try_get(0).map(String::as_str) != Some("") {
            return Err(CacheError::decode("path", "missing empty segment sentinel"));
        }
        if pairs.try_get(0) != Some(&Pair::new(0, 0)) {
            return Err(CacheError::decode("path", "missing root sentinel"));
        }
        for (i, pair) in pairs.values().iter().enumerate().skip(1) {
            if pair.first < 0 || pair.first as usize >= i {
                return Err(CacheError::decode(
                    "path",
                    format!("node {} has invalid parent {}", i, pair.first),
                ));
            }
            if strings.try_get(pair.second).is_none() {
                return Err(CacheError::decode(
                    "path",
                    format!("node {} has invalid segment {}", i, pair.second),
                ));
            }
        }
        Ok(Self { strings, pairs })
    }

    pub fn strings(&self) -> &Dictionary<String> {
        &self.strings
    }

    pub fn pairs(&self) -> &Dictionary<Pair> {
        &self.pairs
    }

    /// Number of path nodes, root included
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.len() <= 1
    }

    /// Intern `path`, creating every missing prefix on the way
    pub fn add(&mut self, path: &str) -> i32 {
        let mut index = ROOT_INDEX;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let segment = self.strings.add_str(segment);
            index = self.pairs.add(Pair::new(index, segment));
        }
        index
    }

    /// Index of `path` if it has been interned
    pub fn find_path(&self, path: &str) -> Option<i32> {
        let mut index = ROOT_INDEX;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let segment = self.strings.find_str(segment)?;
            index = self.pairs.find(&Pair::new(index, segment))?;
        }
        Some(index)
    }

    /// Parent of `index`; the root is its own parent
    pub fn parent(&self, index: i32) -> i32 {
        self.pairs.get(index).first
    }

    /// Full path for `index`, `/` for the root
    pub fn get_path(&self, index: i32) -> String {
        let mut segments = Vec::new();
        let mut current = index;
        while current != ROOT_INDEX {
            let pair = self.pairs.get(current);
            segments.push(self.strings.get(pair.second).as_str());
            current = pair.first;
        }
        if segments.is_empty() {
            return "/".to_string();
        }
        let mut path = String::new();
        for segment in segments.iter().rev() {
            path.push('/');
            path.push_str(segment);
        }
        path
    }

    /// True when `ancestor` is `index` itself or one of its parents
    pub fn is_ancestor(&self, ancestor: i32, index: i32) -> bool {
        if index < ancestor {
            return false;
        }
        if ancestor == ROOT_INDEX {
            return true;
        }
        let mut current = index;
        while current != ROOT_INDEX {
            if current == ancestor {
                return true;
            }
            if current < ancestor {
                return false;
            }
            current = self.pairs.get(current).first;
        }
        false
    }

    /// Segment indices leading from `ancestor` down to `index`
    ///
    /// Empty when `ancestor` is not an ancestor of `index` (or is `index`).
    pub fn relative_segments(&self, ancestor: i32, index: i32) -> Vec<i32> {
        if !self.is_ancestor(ancestor, index) {
            return Vec::new();
        }
        let mut segments = Vec::new();
        let mut current = index;
        while current != ancestor {
            let pair = self.pairs.get(current);
            segments.push(pair.second);
            current = pair.first;
        }
        segments.reverse();
        segments
    }

    /// Graft `segments` under `base`, interning any missing nodes
    pub fn append_segments(&mut self, base: i32, segments: &[i32]) -> i32 {
        segments
            .iter()
            .fold(base, |running, &segment| self.pairs.add(Pair::new(running, segment)))
    }

    /// Lookup-only counterpart of [`append_segments`](Self::append_segments)
    pub fn find_segments(&self, base: i32, segments: &[i32]) -> Option<i32> {
        segments
            .iter()
            .try_fold(base, |running, &segment| self.pairs.find(&Pair::new(running, segment)))
    }
}
