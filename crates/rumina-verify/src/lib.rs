//! rumina-verify — keeps only extracted entities the source text supports.
//!
//! Candidates are deduplicated (case-insensitive, first occurrence wins) and
//! then matched against a [`SourceIndex`] built once per document. Anything
//! no strategy can ground is dropped and recorded in the verification
//! metadata.

pub mod matcher;
pub mod normalise;

use std::collections::{BTreeMap, HashSet};

use rumina_common::{
    EntityKind, ExtractedEntity, KeptEntity, MatchStrategy, StageName, VerificationMetadata,
    VerifiedAnalysis,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use matcher::{match_candidate, MatchConfig, SourceIndex};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifierConfig {
    pub min_word_overlap_fraction: f64,
    pub min_word_len: usize,
    /// Topics are broad by nature and usually paraphrased; off by default.
    pub verify_topics: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        let m = MatchConfig::default();
        Self {
            min_word_overlap_fraction: m.min_word_overlap_fraction,
            min_word_len: m.min_word_len,
            verify_topics: false,
        }
    }
}

impl VerifierConfig {
    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            min_word_overlap_fraction: self.min_word_overlap_fraction,
            min_word_len: self.min_word_len,
        }
    }
}

/// Result of verifying one batch of candidates of a single kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyOutcome {
    pub kept: Vec<(ExtractedEntity, MatchStrategy)>,
    pub removed: Vec<ExtractedEntity>,
    pub duplicates: usize,
}

impl VerifyOutcome {
    /// Number of distinct candidates that went through matching.
    pub fn candidates(&self) -> usize {
        self.kept.len() + self.removed.len()
    }

    pub fn kept_texts(&self) -> Vec<String> {
        self.kept.iter().map(|(e, _)| e.text.clone()).collect()
    }

    /// Fold this outcome into a document's verification metadata.
    pub fn record(&self, kind: EntityKind, meta: &mut VerificationMetadata) {
        *meta.candidates.entry(kind).or_default() += self.candidates();
        meta.duplicates_collapsed += self.duplicates;
        if !self.removed.is_empty() {
            meta.removed
                .entry(kind)
                .or_default()
                .extend(self.removed.iter().map(|e| e.text.clone()));
        }
        meta.kept.extend(self.kept.iter().map(|(e, strategy)| KeptEntity {
            text: e.text.clone(),
            kind,
            strategy: *strategy,
        }));
    }
}

/// Entities removed from an already persisted analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reverified {
    pub removed: BTreeMap<EntityKind, Vec<String>>,
}

impl Reverified {
    pub fn removed_count(&self) -> usize {
        self.removed.values().map(Vec::len).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Drop case-insensitive duplicates and blank strings, keeping first occurrences.
/// Returns the survivors and the number of duplicates collapsed.
pub fn dedup(candidates: &[ExtractedEntity]) -> (Vec<ExtractedEntity>, usize) {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(candidates.len());
    let mut duplicates = 0;
    for c in candidates {
        let text = c.text.trim();
        if text.is_empty() {
            continue;
        }
        if seen.insert(normalise::normalise(text)) {
            out.push(ExtractedEntity { text: text.to_string(), ..c.clone() });
        } else {
            duplicates += 1;
        }
    }
    (out, duplicates)
}

#[derive(Debug, Clone, Default)]
pub struct Verifier {
    config: VerifierConfig,
    matching: MatchConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        let matching = config.match_config();
        Self { config, matching }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Whether candidates of `kind` go through matching at all.
    pub fn verifies(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Molecule | EntityKind::Keyword => true,
            EntityKind::Topic => self.config.verify_topics,
        }
    }

    pub fn verify(&self, candidates: &[ExtractedEntity], source: &SourceIndex) -> VerifyOutcome {
        let (unique, duplicates) = dedup(candidates);
        let mut outcome = VerifyOutcome { duplicates, ..Default::default() };

        for entity in unique {
            match match_candidate(&entity.text, source, &self.matching) {
                Some(strategy) => outcome.kept.push((entity, strategy)),
                None => {
                    debug!(entity = %entity.text, kind = entity.kind.as_str(), "unsupported by source, dropped");
                    outcome.removed.push(entity);
                }
            }
        }
        outcome
    }

    /// Verify plain strings of one kind, e.g. entity lists read back from an artifact.
    pub fn verify_strings(&self, kind: EntityKind, texts: &[String], source: &SourceIndex) -> VerifyOutcome {
        let stage = match kind {
            EntityKind::Molecule => StageName::Molecules,
            EntityKind::Keyword | EntityKind::Topic => StageName::Topics,
        };
        let entities: Vec<ExtractedEntity> = texts
            .iter()
            .map(|t| ExtractedEntity::new(t.clone(), kind, stage))
            .collect();
        self.verify(&entities, source)
    }

    /// Re-check every verified kind of a persisted analysis, removing what no
    /// longer holds. Metadata is updated in place.
    pub fn reverify(&self, analysis: &mut VerifiedAnalysis, source: &SourceIndex) -> Reverified {
        let mut report = Reverified::default();

        for kind in [EntityKind::Molecule, EntityKind::Keyword, EntityKind::Topic] {
            if !self.verifies(kind) {
                continue;
            }
            let outcome = self.verify_strings(kind, analysis.entities(kind), source);
            if outcome.removed.is_empty() && outcome.duplicates == 0 {
                continue;
            }

            *analysis.entities_mut(kind) = outcome.kept_texts();

            let meta = &mut analysis.verification;
            meta.duplicates_collapsed += outcome.duplicates;
            meta.kept.retain(|k| k.kind != kind);
            meta.kept.extend(outcome.kept.iter().map(|(e, strategy)| KeptEntity {
                text: e.text.clone(),
                kind,
                strategy: *strategy,
            }));

            if !outcome.removed.is_empty() {
                let removed: Vec<String> = outcome.removed.into_iter().map(|e| e.text).collect();
                meta.removed.entry(kind).or_default().extend(removed.iter().cloned());
                report.removed.insert(kind, removed);
            }
        }
        report
    }
}
