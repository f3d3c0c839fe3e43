//! Core data model of the extraction pipeline.
//! Source documents go in, verified analyses come out; everything in between
//! (stage results, extracted entities) is ephemeral.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable external id (PMID when the file name carries one).
    pub id: String,
    pub raw_text: String,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub body: Option<String>,
    pub source_path: Option<PathBuf>,
}

impl SourceDocument {
    /// Plain-text document without structured sections.
    pub fn from_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            raw_text: text.into(),
            title: None,
            abstract_text: None,
            body: None,
            source_path: None,
        }
    }

    pub fn has_sections(&self) -> bool {
        self.title.is_some() || self.abstract_text.is_some() || self.body.is_some()
    }

    /// Text handed to the model, with section labels.
    pub fn full_text(&self) -> String {
        if !self.has_sections() {
            return self.raw_text.clone();
        }
        format!(
            "Title: {}\n\nAbstract:\n{}\n\nFull Text:\n{}",
            self.title.as_deref().unwrap_or(""),
            self.abstract_text.as_deref().unwrap_or(""),
            self.body.as_deref().unwrap_or(""),
        )
    }

    /// Verification reference: the document's own words, without the
    /// section labels `full_text` adds.
    pub fn source_text(&self) -> String {
        if !self.has_sections() {
            return self.raw_text.clone();
        }
        [&self.title, &self.abstract_text, &self.body]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Length of the substantive text (body when present).
    pub fn body_chars(&self) -> usize {
        self.body
            .as_deref()
            .unwrap_or(&self.raw_text)
            .chars()
            .count()
    }

    pub fn file_name(&self) -> Option<String> {
        self.source_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Clean,
    Summary,
    Molecules,
    Topics,
}

impl StageName {
    /// Execution order within one document.
    pub const ALL: [StageName; 4] = [
        StageName::Clean,
        StageName::Summary,
        StageName::Molecules,
        StageName::Topics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Clean     => "clean",
            StageName::Summary   => "summary",
            StageName::Molecules => "molecules",
            StageName::Topics    => "topics",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Raw output of one stage, before verification.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Clean { text: String },
    Summary { text: String },
    Molecules { candidates: Vec<ExtractedEntity> },
    Topics { topics: Vec<ExtractedEntity>, keywords: Vec<ExtractedEntity> },
}

impl StageResult {
    pub fn stage(&self) -> StageName {
        match self {
            StageResult::Clean { .. }     => StageName::Clean,
            StageResult::Summary { .. }   => StageName::Summary,
            StageResult::Molecules { .. } => StageName::Molecules,
            StageResult::Topics { .. }    => StageName::Topics,
        }
    }
}

// ---------------------------------------------------------------------------
// Extracted entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Molecule,
    Keyword,
    Topic,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Molecule => "molecule",
            EntityKind::Keyword  => "keyword",
            EntityKind::Topic    => "topic",
        }
    }
}

/// A candidate fact proposed by a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub text: String,
    pub kind: EntityKind,
    pub stage: StageName,
}

impl ExtractedEntity {
    pub fn new(text: impl Into<String>, kind: EntityKind, stage: StageName) -> Self {
        Self { text: text.into(), kind, stage }
    }

    pub fn molecule(text: impl Into<String>) -> Self {
        Self::new(text, EntityKind::Molecule, StageName::Molecules)
    }

    pub fn keyword(text: impl Into<String>) -> Self {
        Self::new(text, EntityKind::Keyword, StageName::Topics)
    }

    pub fn topic(text: impl Into<String>) -> Self {
        Self::new(text, EntityKind::Topic, StageName::Topics)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    HyphenInsensitive,
    WordOverlap,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Exact             => "exact",
            MatchStrategy::HyphenInsensitive => "hyphen_insensitive",
            MatchStrategy::WordOverlap       => "word_overlap",
        }
    }
}

// ---------------------------------------------------------------------------
// Verified analysis (persisted artifact)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeptEntity {
    pub text: String,
    pub kind: EntityKind,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VerificationMetadata {
    /// Candidate counts per kind before verification (after dedup).
    pub candidates: BTreeMap<EntityKind, usize>,
    /// Strings removed per kind.
    pub removed: BTreeMap<EntityKind, Vec<String>>,
    pub duplicates_collapsed: usize,
    pub kept: Vec<KeptEntity>,
    pub min_word_overlap_fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl VerificationMetadata {
    pub fn removed_count(&self) -> usize {
        self.removed.values().map(Vec::len).sum()
    }

    pub fn removed_of(&self, kind: EntityKind) -> &[String] {
        self.removed.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TextLengths {
    pub title: usize,
    #[serde(rename = "abstract")]
    pub abstract_text: usize,
    pub body: usize,
    pub cleaned: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifiedAnalysis {
    #[serde(alias = "pmid")]
    pub id: String,
    #[serde(default, alias = "xml_file")]
    pub source_file: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    #[serde(rename = "comprehensive_summary")]
    pub summary: String,
    pub molecules: Vec<String>,
    pub keywords: Vec<String>,
    pub topics: Vec<String>,
    #[serde(default)]
    pub text_length: TextLengths,
    #[serde(default)]
    pub verification: VerificationMetadata,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub processing_time_seconds: f64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
}

impl VerifiedAnalysis {
    /// Entities of one kind in their persisted order.
    pub fn entities(&self, kind: EntityKind) -> &[String] {
        match kind {
            EntityKind::Molecule => &self.molecules,
            EntityKind::Keyword  => &self.keywords,
            EntityKind::Topic    => &self.topics,
        }
    }

    pub fn entities_mut(&mut self, kind: EntityKind) -> &mut Vec<String> {
        match kind {
            EntityKind::Molecule => &mut self.molecules,
            EntityKind::Keyword  => &mut self.keywords,
            EntityKind::Topic    => &mut self.topics,
        }
    }
}
