//! Matching strategies for a single candidate against one source document.
//!
//! Strategies are tried in order and the first success wins:
//!   1. exact substring of the normalised text
//!   2. hyphen-insensitive (hyphens as spaces, or hyphens removed)
//!   3. whole-word overlap above a configurable fraction

use std::collections::HashSet;

use rumina_common::MatchStrategy;
use serde::{Deserialize, Serialize};

use crate::normalise::{compact, hyphens_to_spaces, normalise, words};

/// Compact forms this short match too much by accident ("co2" inside "co2h").
const MIN_COMPACT_CHARS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchConfig {
    /// Fraction of a candidate's significant words that must occur as whole words.
    pub min_word_overlap_fraction: f64,
    /// Words shorter than this are ignored by the overlap strategy.
    pub min_word_len: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_word_overlap_fraction: 0.8,
            min_word_len: 3,
        }
    }
}

impl MatchConfig {
    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.min_word_overlap_fraction = fraction;
        self
    }

    /// Fraction clamped into (0, 1]; NaN falls back to the default.
    pub fn effective_fraction(&self) -> f64 {
        let f = self.min_word_overlap_fraction;
        if f.is_nan() {
            return Self::default().min_word_overlap_fraction;
        }
        f.clamp(f64::EPSILON, 1.0)
    }
}

/// Precomputed views of one source text. Build once per document.
#[derive(Debug, Clone)]
pub struct SourceIndex {
    normalised: String,
    spaced: String,
    compact: String,
    words: HashSet<String>,
}

impl SourceIndex {
    pub fn new(text: &str) -> Self {
        let normalised = normalise(text);
        let spaced = hyphens_to_spaces(&normalised);
        let compact = compact(&normalised);
        let words = words(&normalised).map(str::to_string).collect();
        Self { normalised, spaced, compact, words }
    }

    pub fn is_empty(&self) -> bool {
        self.normalised.is_empty()
    }

    pub fn len(&self) -> usize {
        self.normalised.len()
    }

    pub fn contains_word(&self, word: &str) -> bool {
        self.words.contains(word)
    }
}

/// First strategy under which `candidate` is supported by `source`.
pub fn match_candidate(candidate: &str, source: &SourceIndex, cfg: &MatchConfig) -> Option<MatchStrategy> {
    let cand = normalise(candidate);
    if cand.is_empty() || source.is_empty() {
        return None;
    }

    if source.normalised.contains(&cand) {
        return Some(MatchStrategy::Exact);
    }

    if hyphen_insensitive(&cand, source) {
        return Some(MatchStrategy::HyphenInsensitive);
    }

    if word_overlap(&cand, source, cfg) {
        return Some(MatchStrategy::WordOverlap);
    }

    None
}

fn hyphen_insensitive(cand: &str, source: &SourceIndex) -> bool {
    let spaced = hyphens_to_spaces(cand);
    if !spaced.is_empty() && source.spaced.contains(&spaced) {
        return true;
    }
    let packed = compact(cand);
    packed.chars().count() >= MIN_COMPACT_CHARS && source.compact.contains(&packed)
}

fn word_overlap(cand: &str, source: &SourceIndex, cfg: &MatchConfig) -> bool {
    let significant: Vec<&str> = words(cand)
        .filter(|w| w.chars().count() >= cfg.min_word_len)
        .collect();
    if significant.is_empty() {
        return false;
    }
    let matched = significant.iter().filter(|w| source.contains_word(w)).count();
    if matched == 0 {
        return false;
    }
    matched as f64 / significant.len() as f64 >= cfg.effective_fraction()
}
