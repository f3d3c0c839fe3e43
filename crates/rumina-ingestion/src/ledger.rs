//! Processing ledger: per-document status persisted as `ledger.json`.
//!
//! Every transition rewrites the file through a temp file + rename, so a
//! crash leaves either the previous or the new ledger on disk, never a torn
//! one. Artifacts stay the source of truth for completion; the ledger adds
//! attempt counts and failure context.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rumina_common::{Result, RuminaError, StageName};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::{write_atomic, ArtifactStore};

pub const LEDGER_FILE: &str = "ledger.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending    => "pending",
            LedgerStatus::InProgress => "in_progress",
            LedgerStatus::Complete   => "complete",
            LedgerStatus::Failed     => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub status: LedgerStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stage: Option<StageName>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn new() -> Self {
        Self {
            status: LedgerStatus::Pending,
            attempts: 0,
            last_error: None,
            last_stage: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct ProcessingLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl ProcessingLedger {
    /// Load the ledger at `path`; a missing file is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let file: LedgerFile = serde_json::from_slice(&bytes)
                    .map_err(|e| RuminaError::Ledger(format!("{}: {e}", path.display())))?;
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "ledger loaded");
        Ok(Self { path, entries })
    }

    /// Ledger stored as `ledger.json` inside `dir`.
    pub fn load_in(dir: &Path) -> Result<Self> {
        Self::load(dir.join(LEDGER_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self, id: &str) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    pub fn status(&self, id: &str) -> LedgerStatus {
        self.entries.get(id).map(|e| e.status).unwrap_or(LedgerStatus::Pending)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LedgerEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut c = LedgerCounts::default();
        for e in self.entries.values() {
            match e.status {
                LedgerStatus::Pending    => c.pending += 1,
                LedgerStatus::InProgress => c.in_progress += 1,
                LedgerStatus::Complete   => c.complete += 1,
                LedgerStatus::Failed     => c.failed += 1,
            }
        }
        c
    }

    /// Start a new attempt.
    pub async fn mark_in_progress(&mut self, id: &str) -> Result<()> {
        let e = self.entries.entry(id.to_string()).or_insert_with(LedgerEntry::new);
        e.status = LedgerStatus::InProgress;
        e.attempts += 1;
        e.updated_at = Utc::now();
        self.save().await
    }

    pub async fn mark_complete(&mut self, id: &str) -> Result<()> {
        self.set_complete(id);
        self.save().await
    }

    pub async fn mark_failed(&mut self, id: &str, stage: Option<StageName>, reason: &str) -> Result<()> {
        let e = self.entries.entry(id.to_string()).or_insert_with(LedgerEntry::new);
        e.status = LedgerStatus::Failed;
        e.last_stage = stage;
        e.last_error = Some(reason.to_string());
        e.updated_at = Utc::now();
        self.save().await
    }

    /// Checkpoint a document stopped by a global abort. It goes back to
    /// `pending` and the interrupted attempt is not counted.
    pub async fn mark_cancelled(&mut self, id: &str, stage: StageName) -> Result<()> {
        let e = self.entries.entry(id.to_string()).or_insert_with(LedgerEntry::new);
        e.status = LedgerStatus::Pending;
        e.attempts = e.attempts.saturating_sub(1);
        e.last_stage = Some(stage);
        e.last_error = Some(crate::stages::CANCELLED.to_string());
        e.updated_at = Utc::now();
        self.save().await
    }

    fn set_complete(&mut self, id: &str) {
        let e = self.entries.entry(id.to_string()).or_insert_with(LedgerEntry::new);
        e.status = LedgerStatus::Complete;
        e.last_error = None;
        e.last_stage = None;
        e.updated_at = Utc::now();
    }

    /// Write the ledger atomically next to its final path.
    pub async fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let file = LedgerFile { version: 1, entries: self.entries.clone() };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(dir, self.path.clone(), bytes).await
    }
}

/// Split of a run's documents into work to do and work to skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet {
    pub pending: Vec<String>,
    /// Artifact already present.
    pub complete: Vec<String>,
    /// Failed `max_document_attempts` times already.
    pub exhausted: Vec<String>,
    /// Ledger entries healed to `complete` because the artifact existed.
    pub healed: usize,
}

/// Decide which of `all` still need processing.
///
/// - a non-empty artifact means done, whatever the ledger says
/// - `in_progress` left by a crashed run counts as pending
/// - `failed` is retried until `attempts` reaches `max_document_attempts`
///   (0 = unlimited)
pub async fn pending_documents(
    all: &[String],
    ledger: &mut ProcessingLedger,
    artifacts: &dyn ArtifactStore,
    max_document_attempts: u32,
) -> Result<PendingSet> {
    let mut set = PendingSet::default();

    for id in all {
        if artifacts.is_complete(id).await {
            if ledger.status(id) != LedgerStatus::Complete {
                ledger.set_complete(id);
                set.healed += 1;
            }
            set.complete.push(id.clone());
            continue;
        }

        match ledger.entry(id) {
            Some(e) if e.status == LedgerStatus::Failed
                && max_document_attempts > 0
                && e.attempts >= max_document_attempts =>
            {
                warn!(doc_id = %id, attempts = e.attempts, last_error = ?e.last_error, "attempts exhausted, skipping");
                set.exhausted.push(id.clone());
            }
            Some(e) if e.status == LedgerStatus::Complete => {
                // ledger says done but the artifact is gone
                warn!(doc_id = %id, "artifact missing for completed document, reprocessing");
                set.pending.push(id.clone());
            }
            _ => set.pending.push(id.clone()),
        }
    }

    if set.healed > 0 {
        info!(healed = set.healed, "ledger healed from existing artifacts");
        ledger.save().await?;
    }
    Ok(set)
}
