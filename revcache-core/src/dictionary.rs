//! Interning dictionary
//!
//! Maps values to small, permanent, insertion-ordered indices. Used for
//! path segments, authors, message words and index pairs.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::hash::Hash;

/// Index returned for values that are not stored.
pub const UNKNOWN_INDEX: i32 = -1;

/// Pair of indices, used both as (parent path, segment) and (token, token)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub first: i32,
    pub second: i32,
}

impl Pair {
    pub const fn new(first: i32, second: i32) -> Self {
        Self { first, second }
    }
}

/// Bidirectional value <-> index store
///
/// Indices are never reused or removed. Index 0 is reserved for the
/// sentinel passed to [`Dictionary::with_sentinel`].
#[derive(Debug, Clone)]
pub struct Dictionary<T> {
    values: Vec<T>,
    index: HashMap<T, i32>,
}

impl<T: Eq + Hash + Clone> Dictionary<T> {
    /// Create a dictionary whose index 0 holds `sentinel`
    pub fn with_sentinel(sentinel: T) -> Self {
        let mut dict = Self {
            values: Vec::new(),
            index: HashMap::new(),
        };
        dict.add(sentinel);
        dict
    }

    /// Rebuild a dictionary from its value list (as written by `Serialize`)
    pub fn from_values(values: Vec<T>) -> Self {
        let mut index = HashMap::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            index.entry(value.clone()).or_insert(i as i32);
        }
        Self { values, index }
    }

    /// Intern `value`, returning its existing index when already present
    pub fn add(&mut self, value: T) -> i32 {
        if let Some(&i) = self.index.get(&value) {
            return i;
        }
        let i = self.values.len() as i32;
        self.index.insert(value.clone(), i);
        self.values.push(value);
        i
    }

    /// Look up a value without inserting it
    pub fn find(&self, value: &T) -> Option<i32> {
        self.index.get(value).copied()
    }

    /// Value at `index`
    ///
    /// # Panics
    /// Panics when `index` was never handed out by this dictionary.
    pub fn get(&self, index: i32) -> &T {
        &self.values[index as usize]
    }

    /// Value at `index`, or `None` when out of range
    pub fn try_get(&self, index: i32) -> Option<&T> {
        usize::try_from(index).ok().and_then(|i| self.values.get(i))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }
}

impl Dictionary<String> {
    /// String dictionary with the empty string at index 0
    pub fn strings() -> Self {
        Self::with_sentinel(String::new())
    }

    /// Intern a string slice, allocating only for new values
    pub fn add_str(&mut self, value: &str) -> i32 {
        if let Some(&i) = self.index.get(value) {
            return i;
        }
        self.add(value.to_string())
    }

    pub fn find_str(&self, value: &str) -> Option<i32> {
        self.index.get(value).copied()
    }
}

impl Dictionary<Pair> {
    /// Pair dictionary with the root pair `(0, 0)` at index 0
    pub fn pairs() -> Self {
        Self::with_sentinel(Pair::new(0, 0))
    }
}

impl<T: Serialize> Serialize for Dictionary<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Dictionary<T>
where
    T: Deserialize<'de> + Eq + Hash + Clone,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<T>::deserialize(deserializer)?;
        Ok(Self::from_values(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_returns_existing_index() {
        let mut dict = Dictionary::strings();
        let a = dict.add_str("trunk");
        let b = dict.add_str("branches");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(dict.add_str("trunk"), a);
        assert_eq!(dict.len(), 3);
    }

    #[test]
    fn test_empty_string_is_index_zero() {
        let mut dict = Dictionary::strings();
        assert_eq!(dict.add_str(""), 0);
        assert_eq!(dict.get(0), "");
    }

    #[test]
    fn test_find_does_not_insert() {
        let dict = Dictionary::strings();
        assert_eq!(dict.find_str("missing"), None);
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_pair_dictionary_root() {
        let mut pairs = Dictionary::pairs();
        assert_eq!(pairs.find(&Pair::new(0, 0)), Some(0));
        assert_eq!(pairs.add(Pair::new(0, 3)), 1);
        assert_eq!(*pairs.get(1), Pair::new(0, 3));
    }

    #[test]
    fn test_try_get_out_of_range() {
        let dict = Dictionary::strings();
        assert!(dict.try_get(5).is_none());
        assert!(dict.try_get(-1).is_none());
    }

    #[test]
    fn test_bincode_roundtrip_keeps_indices() {
        let mut dict = Dictionary::strings();
        dict.add_str("alice");
        dict.add_str("bob");
        let bytes = bincode::serialize(&dict).unwrap();
        let restored: Dictionary<String> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.find_str("bob"), Some(2));
        assert_eq!(restored.get(1), "alice");
    }
}
