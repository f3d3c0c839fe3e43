//! Reconciliation: re-verify persisted analyses against their sources.
//!
//! Runs independently of the pipeline. Each artifact is checked with the same
//! verifier used inline; entities that no longer match are removed and the
//! artifact rewritten. A second pass over the same artifacts removes nothing.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rumina_common::{EntityKind, Result};
use rumina_verify::{SourceIndex, Verifier, VerifierConfig};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::sources::{DocumentStore, FsDocumentStore};

#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Report what would be removed without rewriting anything.
    pub dry_run: bool,
    pub verifier: VerifierConfig,
}

/// Result for one artifact that had something to remove.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactReconciliation {
    pub id: String,
    pub removed: BTreeMap<EntityKind, Vec<String>>,
    pub rewritten: bool,
}

impl ArtifactReconciliation {
    pub fn removed_count(&self) -> usize {
        self.removed.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub checked: usize,
    pub modified: usize,
    pub entities_removed: usize,
    pub artifacts: Vec<ArtifactReconciliation>,
    /// Artifacts skipped, with the reason.
    pub errors: Vec<(String, String)>,
    pub dry_run: bool,
}

/// Re-verify every artifact in `artifact_dir` against its source in `input_dir`.
#[instrument(skip(options), fields(dry_run = options.dry_run))]
pub async fn reconcile(artifact_dir: &Path, input_dir: &Path, options: &ReconcileOptions) -> Result<ReconciliationReport> {
    let artifacts = FsArtifactStore::open(artifact_dir).await?;
    // any source text counts as a reference here, however short
    let sources = FsDocumentStore::open(input_dir, 0).await?;
    reconcile_stores(&artifacts, &sources, options).await
}

pub async fn reconcile_stores(
    artifacts: &dyn ArtifactStore,
    sources: &dyn DocumentStore,
    options: &ReconcileOptions,
) -> Result<ReconciliationReport> {
    let verifier = Verifier::new(options.verifier.clone());
    let mut report = ReconciliationReport { dry_run: options.dry_run, ..Default::default() };

    for id in artifacts.list_ids().await? {
        let mut analysis = match artifacts.read(&id).await {
            Ok(a) => a,
            Err(e) => {
                warn!(doc_id = %id, error = %e, "unreadable artifact, skipping");
                report.errors.push((id, e.to_string()));
                continue;
            }
        };
        let source = match sources.load(&id).await {
            Ok(doc) => SourceIndex::new(&doc.source_text()),
            Err(e) => {
                warn!(doc_id = %id, error = %e, "no usable source for artifact, skipping");
                report.errors.push((id, e.to_string()));
                continue;
            }
        };
        report.checked += 1;

        let before = (analysis.molecules.clone(), analysis.keywords.clone(), analysis.topics.clone());
        let outcome = verifier.reverify(&mut analysis, &source);
        let changed = before != (analysis.molecules.clone(), analysis.keywords.clone(), analysis.topics.clone());
        if !changed {
            debug!(doc_id = %id, "artifact verified, nothing to remove");
            continue;
        }

        let mut rewritten = false;
        if !options.dry_run {
            analysis.verification.reconciled_at = Some(Utc::now());
            analysis.verification.min_word_overlap_fraction = options.verifier.min_word_overlap_fraction;
            match artifacts.write(&analysis).await {
                Ok(()) => rewritten = true,
                Err(e) => {
                    warn!(doc_id = %id, error = %e, "failed to rewrite artifact");
                    report.errors.push((id, e.to_string()));
                    continue;
                }
            }
        }

        info!(doc_id = %id, removed = outcome.removed_count(), rewritten, "artifact reconciled");
        report.modified += 1;
        report.entities_removed += outcome.removed_count();
        report.artifacts.push(ArtifactReconciliation { id, removed: outcome.removed, rewritten });
    }

    info!(
        checked = report.checked,
        modified = report.modified,
        removed = report.entities_removed,
        errors = report.errors.len(),
        "reconciliation finished"
    );
    Ok(report)
}
