//! Incremental substring search over fragmented response bodies.
//!
//! A response body may arrive split into any number of fragments of any size. The
//! [`SearchValidator`] is an immutable, shared description (pattern, failure table,
//! predicate); the per-session cursor lives in a [`MatchState`] stored in the
//! session's resource arena, so a single validator serves every session.
//!
//! After each byte the state holds the length of the longest pattern prefix that is
//! a suffix of everything seen so far. Reaching the full pattern length counts one
//! occurrence and restarts the automaton from zero, so occurrences never overlap:
//! `"barbar"` is found once in `"barbarbar"`.

use serde::{Deserialize, Serialize};

use crate::scenario::ResourceKey;

/// Predicate over the number of occurrences found in one response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchCount {
    Exactly(u32),
    AtLeast(u32),
    AtMost(u32),
}

impl MatchCount {
    pub fn test(self, count: u32) -> bool {
        match self {
            MatchCount::Exactly(n) => count == n,
            MatchCount::AtLeast(n) => count >= n,
            MatchCount::AtMost(n) => count <= n,
        }
    }

    /// Where a response stands after some of its data has been seen.
    pub fn status(self, count: u32) -> MatchStatus {
        match self {
            MatchCount::Exactly(n) if count > n => MatchStatus::Unsatisfiable,
            MatchCount::AtMost(n) if count > n => MatchStatus::Unsatisfiable,
            _ if self.test(count) => MatchStatus::Satisfied,
            _ => MatchStatus::Pending,
        }
    }
}

/// Progress reported after each fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchStatus {
    /// The predicate holds for the data seen so far.
    Satisfied,
    /// The predicate does not hold yet but more data could satisfy it.
    Pending,
    /// No further data can satisfy the predicate.
    Unsatisfiable,
}

/// Per-session cursor of one [`SearchValidator`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchState {
    partial: usize,
    matches: u32,
    consumed: u64,
}

impl MatchState {
    pub fn matches(&self) -> u32 {
        self.matches
    }

    /// Bytes fed since the last reset.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Plain byte-pattern search validator (no regular expressions, no UTF-8 folding).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "SerializedValidator")]
pub struct SearchValidator {
    pattern: Vec<u8>,
    predicate: MatchCount,
    #[serde(skip)]
    failure: Vec<usize>,
    #[serde(skip)]
    key: ResourceKey,
}

/// Wire form of a [`SearchValidator`]. The failure table is rebuilt on the way in.
#[derive(Deserialize)]
struct SerializedValidator {
    pattern: Vec<u8>,
    predicate: MatchCount,
}

impl From<SerializedValidator> for SearchValidator {
    fn from(raw: SerializedValidator) -> Self {
        Self::new(raw.pattern, raw.predicate)
    }
}

impl PartialEq for SearchValidator {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.predicate == other.predicate
    }
}

impl SearchValidator {
    pub fn new(pattern: impl AsRef<[u8]>, predicate: MatchCount) -> Self {
        let pattern = pattern.as_ref().to_vec();
        let failure = failure_table(&pattern);
        Self {
            pattern,
            predicate,
            failure,
            key: ResourceKey::default(),
        }
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub fn predicate(&self) -> MatchCount {
        self.predicate
    }

    /// Arena slot holding this validator's [`MatchState`].
    pub fn key(&self) -> ResourceKey {
        self.key
    }

    /// Binds the validator to its arena slot.
    pub(crate) fn bind(&mut self, key: ResourceKey) {
        self.key = key;
    }

    /// Starts a new response body.
    pub fn before_data(&self, state: &mut MatchState) {
        state.reset();
    }

    /// Feeds one fragment. Work is linear in the fragment length.
    pub fn validate_data(&self, state: &mut MatchState, fragment: &[u8]) -> MatchStatus {
        state.consumed += fragment.len() as u64;
        if self.pattern.is_empty() {
            return self.predicate.status(state.matches);
        }
        let mut k = state.partial;
        for &byte in fragment {
            while k > 0 && self.pattern[k] != byte {
                k = self.failure[k - 1];
            }
            if self.pattern[k] == byte {
                k += 1;
            }
            if k == self.pattern.len() {
                state.matches += 1;
                k = 0;
            }
        }
        state.partial = k;
        self.predicate.status(state.matches)
    }

    /// Evaluates the predicate on the complete body and resets the state.
    pub fn validate(&self, state: &mut MatchState) -> bool {
        let valid = self.predicate.test(state.matches);
        state.reset();
        valid
    }
}

/// `table[i]` is the length of the longest proper prefix of `pattern[..=i]` that is
/// also its suffix.
fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}
