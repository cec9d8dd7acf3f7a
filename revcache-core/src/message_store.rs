//! Commit message storage with phrase compression
//!
//! Messages are split into alternating word/separator tokens which are
//! interned in a string dictionary. [`MessageStore::compress`] then replaces
//! frequently recurring adjacent token pairs with phrase tokens, RePair
//! style, until a pass makes no replacement.
//!
//! Token encoding: `t > 0` is a string index, `t < 0` is phrase `-t`,
//! and `0` only appears transiently while a pass compacts a message.

use crate::dictionary::{Dictionary, Pair};
use crate::error::{CacheError, Result};
use crate::revision::{grow_slots, revision_slot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Default number of occurrences before a token pair becomes a phrase
pub const MIN_PAIR_COUNT: usize = 5;

const EMPTY_TOKEN: i32 = 0;

const SEPARATORS: &[char] = &[
    ' ', '\t', '\n', '\\', '/', '(', ')', '<', '>', '{', '}', '"', '\'', '.', ':', '=', '-', '+',
    '*', '^',
];

fn is_separator(ch: char) -> bool {
    SEPARATORS.contains(&ch)
}

/// Split `text` into alternating word and separator runs
///
/// A single character wedged between two runs of the other class is
/// glued onto the preceding token, so `"fix bug"` yields `"fix "`, `"bug"`.
/// Concatenating the tokens always reproduces `text`.
pub fn tokenize(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let len = chars.len();
    let offset = |pos: usize| chars.get(pos).map_or(text.len(), |&(byte, _)| byte);

    let mut words = Vec::new();
    let Some(&(_, first)) = chars.first() else {
        return words;
    };
    let mut separator = is_separator(first);
    let mut pos = 0;
    while pos < len {
        let mut next = pos + 1;
        while next < len && is_separator(chars[next].1) == separator {
            next += 1;
        }
        separator = !separator;
        if next + 1 < len && is_separator(chars[next + 1].1) != separator {
            next += 1;
            separator = !separator;
        }
        words.push(&text[offset(pos)..offset(next)]);
        pos = next;
    }
    words
}

/// Per-revision commit messages sharing one word and phrase dictionary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStore {
    strings: Dictionary<String>,
    pairs: Dictionary<Pair>,
    messages: Vec<Vec<i32>>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::with_len(0)
    }

    /// Store with `count` empty message slots
    pub fn with_len(count: usize) -> Self {
        Self {
            strings: Dictionary::strings(),
            pairs: Dictionary::pairs(),
            messages: vec![Vec::new(); count],
        }
    }

    /// Number of message slots
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Grow to at least `count` slots; never shrinks
    pub fn expand(&mut self, count: usize) -> Result<()> {
        grow_slots(&mut self.messages, count, Vec::new)
    }

    /// Number of distinct word fragments
    pub fn word_count(&self) -> usize {
        self.strings.len()
    }

    /// Number of phrases, excluding the sentinel
    pub fn phrase_count(&self) -> usize {
        self.pairs.len().saturating_sub(1)
    }

    /// Total number of stored tokens across all messages
    pub fn token_count(&self) -> usize {
        self.messages.iter().map(Vec::len).sum()
    }

    /// Tokenize and store the message for `revision`, returning its index
    pub fn set_message(&mut self, revision: u64, text: Option<&str>) -> Result<i32> {
        let slot = revision_slot(revision)?;
        let index = i32::try_from(slot)
            .map_err(|_| CacheError::InvalidArgument(format!("revision {} has no message index", revision)))?;
        self.expand(slot + 1)?;
        let tokens = text
            .map(|text| {
                tokenize(text)
                    .into_iter()
                    .map(|word| self.strings.add_str(word))
                    .collect()
            })
            .unwrap_or_default();
        self.messages[slot] = tokens;
        Ok(index)
    }

    /// Reconstructed message text, `None` for an empty or unknown slot
    pub fn get_message(&self, index: i32) -> Option<String> {
        let tokens = usize::try_from(index).ok().and_then(|i| self.messages.get(i))?;
        if tokens.is_empty() {
            return None;
        }
        let mut text = String::new();
        for &token in tokens {
            self.expand_token(token, &mut text);
        }
        if text.is_empty() { None } else { Some(text) }
    }

    fn expand_token(&self, token: i32, out: &mut String) {
        if token < 0 {
            let pair = self.pairs.get(-token);
            self.expand_token(pair.first, out);
            self.expand_token(pair.second, out);
        } else {
            out.push_str(self.strings.get(token));
        }
    }

    /// Compress with the default threshold
    pub fn compress(&mut self) -> usize {
        self.compress_with(MIN_PAIR_COUNT)
    }

    /// Run pair compression to convergence, returning the number of
    /// replacements made
    ///
    /// Safe to call repeatedly: later runs reuse existing phrases and only
    /// register pairs that became frequent since.
    pub fn compress_with(&mut self, min_pair_count: usize) -> usize {
        let min_pair_count = min_pair_count.max(1);
        let mut active = vec![true; self.messages.len()];
        let mut total = 0;
        let mut pass = 0;
        loop {
            pass += 1;
            let registered = self.register_frequent_pairs(&active, min_pair_count);
            let replaced = self.replace_pairs(&mut active);
            debug!(
                pass,
                registered,
                replaced,
                phrases = self.phrase_count(),
                "message compression pass"
            );
            if replaced == 0 {
                break;
            }
            total += replaced;
        }
        total
    }

    fn register_frequent_pairs(&mut self, active: &[bool], min_pair_count: usize) -> usize {
        let mut occurrences: HashMap<Pair, usize> = HashMap::new();
        for (tokens, _) in self.messages.iter().zip(active).filter(|(_, a)| **a) {
            for window in tokens.windows(2) {
                *occurrences.entry(Pair::new(window[0], window[1])).or_default() += 1;
            }
        }

        let before = self.pairs.len();
        for (pair, count) in occurrences {
            if count >= min_pair_count {
                self.pairs.add(pair);
            }
        }
        self.pairs.len() - before
    }

    fn replace_pairs(&mut self, active: &mut [bool]) -> usize {
        let mut total = 0;
        for (tokens, flag) in self.messages.iter_mut().zip(active.iter_mut()) {
            if !*flag {
                continue;
            }
            let replaced = replace_in_message(&self.pairs, tokens);
            if replaced == 0 {
                *flag = false;
            } else {
                tokens.retain(|&t| t != EMPTY_TOKEN);
                total += replaced;
            }
        }
        total
    }

    /// Serialize as bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and validate a store written by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let store: Self =
            bincode::deserialize(bytes).map_err(|e| CacheError::decode("message", e))?;
        store.validate()?;
        Ok(store)
    }

    /// Check that every token resolves and phrases only nest earlier phrases
    fn validate(&self) -> Result<()> {
        if self.strings.try_get(0).map(String::as_str) != Some("") {
            return Err(CacheError::decode("message", "missing empty word sentinel"));
        }
        if self.pairs.try_get(0) != Some(&Pair::new(0, 0)) {
            return Err(CacheError::decode("message", "missing phrase sentinel"));
        }
        let token_ok = |token: i32, limit: usize| {
            if token < 0 {
                (-(token as i64)) < limit as i64
            } else {
                token > 0 && (token as usize) < self.strings.len()
            }
        };
        for (i, pair) in self.pairs.values().iter().enumerate().skip(1) {
            if !token_ok(pair.first, i) || !token_ok(pair.second, i) {
                return Err(CacheError::decode(
                    "message",
                    format!("phrase {} references an unknown token", i),
                ));
            }
        }
        for (revision, tokens) in self.messages.iter().enumerate() {
            if let Some(token) = tokens.iter().find(|&&t| !token_ok(t, self.pairs.len())) {
                return Err(CacheError::decode(
                    "message",
                    format!("revision {} has invalid token {}", revision, token),
                ));
            }
        }
        Ok(())
    }
}

/// Left-to-right, non-overlapping replacement of known pairs in one message
fn replace_in_message(pairs: &Dictionary<Pair>, tokens: &mut [i32]) -> usize {
    let mut replaced = 0;
    let mut j = 1;
    while j < tokens.len() {
        match pairs.find(&Pair::new(tokens[j - 1], tokens[j])) {
            Some(index) if index > 0 => {
                tokens[j - 1] = -index;
                tokens[j] = EMPTY_TOKEN;
                replaced += 1;
                j += 2;
            }
            _ => j += 1,
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_glues_single_chars() {
        assert_eq!(tokenize("hello world a"), vec!["hello ", "world ", "a"]);
        assert_eq!(tokenize("a b"), vec!["a ", "b"]);
    }

    #[test]
    fn test_tokenize_keeps_separator_runs() {
        assert_eq!(tokenize("fix  (#12)"), vec!["fix", "  (", "#12", ")"]);
        assert_eq!(tokenize("  lead"), vec!["  ", "lead"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_tokenize_reconstructs_unicode() {
        let text = "Ünïcode — ok/ü.x";
        assert_eq!(tokenize(text).concat(), text);
    }

    #[test]
    fn test_message_roundtrip_before_compress() {
        let mut store = MessageStore::with_len(3);
        let i = store.set_message(1, Some("Fix the build (again)")).unwrap();
        assert_eq!(i, 1);
        assert_eq!(store.get_message(1).as_deref(), Some("Fix the build (again)"));
        assert_eq!(store.get_message(0), None);
        assert_eq!(store.get_message(7), None);
    }

    #[test]
    fn test_empty_message_is_none() {
        let mut store = MessageStore::new();
        store.set_message(0, Some("")).unwrap();
        store.set_message(1, None).unwrap();
        assert_eq!(store.get_message(0), None);
        assert_eq!(store.get_message(1), None);
    }

    #[test]
    fn test_set_message_grows_store() {
        let mut store = MessageStore::new();
        store.set_message(9, Some("late")).unwrap();
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_set_message_rejects_revision_past_i32() {
        let mut store = MessageStore::new();
        let err = store.set_message(i32::MAX as u64, Some("wrapped")).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)), "{err}");
        assert!(store.is_empty());
    }

    #[test]
    fn test_compress_preserves_messages() {
        let messages = [
            "hello world a hello world b",
            "my hello world d hello world g",
            "hello world c",
            "hello world hello world",
        ];
        let mut store = MessageStore::with_len(messages.len());
        for (i, text) in messages.iter().enumerate() {
            store.set_message(i as u64, Some(*text)).unwrap();
        }
        let tokens_before = store.token_count();

        let replaced = store.compress();
        assert!(replaced > 0);
        assert!(store.phrase_count() > 0);
        assert!(store.token_count() < tokens_before);
        for (i, text) in messages.iter().enumerate() {
            assert_eq!(store.get_message(i as i32).as_deref(), Some(*text));
        }
    }

    #[test]
    fn test_below_threshold_no_phrases() {
        let mut store = MessageStore::with_len(2);
        store.set_message(0, Some("hello world a")).unwrap();
        store.set_message(1, Some("hello world b")).unwrap();
        assert_eq!(store.compress(), 0);
        assert_eq!(store.phrase_count(), 0);
    }

    #[test]
    fn test_repeated_compress_is_safe() {
        let mut store = MessageStore::new();
        for rev in 0..20u64 {
            store.set_message(rev, Some("Merged r12 from trunk into release branch")).unwrap();
        }
        store.compress();
        for rev in 20..40u64 {
            store.set_message(rev, Some("Merged r12 from trunk into release branch")).unwrap();
        }
        store.compress();
        store.compress();
        for rev in 0..40 {
            assert_eq!(
                store.get_message(rev).as_deref(),
                Some("Merged r12 from trunk into release branch")
            );
        }
    }

    #[test]
    fn test_phrases_nest() {
        let mut store = MessageStore::new();
        for rev in 0..10u64 {
            store.set_message(rev, Some("one two three four five six")).unwrap();
        }
        store.compress();
        // Nesting collapses each message to a single phrase token
        assert_eq!(store.token_count(), 10);
        assert_eq!(store.get_message(3).as_deref(), Some("one two three four five six"));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut store = MessageStore::new();
        for rev in 0..8u64 {
            store.set_message(rev, Some("update docs for release")).unwrap();
        }
        store.compress();
        let restored = MessageStore::from_bytes(&store.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.len(), 8);
        assert_eq!(restored.get_message(5).as_deref(), Some("update docs for release"));
    }

    #[test]
    fn test_from_bytes_rejects_dangling_token() {
        let mut store = MessageStore::new();
        store.set_message(0, Some("x")).unwrap();
        store.messages[0].push(-42);
        let bytes = bincode::serialize(&store).unwrap();
        let err = MessageStore::from_bytes(&bytes).unwrap_err();
        assert!(err.is_corruption());
    }
}
