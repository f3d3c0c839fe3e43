//! Batch orchestrator.
//!
//! Flow for one run:
//!   1. List source documents and split them into pending / already done /
//!      out of attempts using the ledger and the artifact directory
//!   2. Walk the pending ids in super-batches of `checkpoint_every`
//!   3. Load each super-batch and hand it to the work queue
//!   4. Per document: ledger `in_progress` → stages + verification →
//!      artifact → ledger `complete` (or `failed`)
//!   5. Checkpoint after every super-batch, write the analysis index at the end
//!
//! Per-document failures never abort the run. A global abort stops
//! admissions; documents already running finish their current stage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumina_common::{Result, RuminaError, SourceDocument, VerifiedAnalysis};
use rumina_llm::{with_retry_if, ErrorClass, LlmBackend, RetryPolicy};
use rumina_verify::VerifierConfig;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::budget::TokenBudget;
use crate::ledger::{pending_documents, ProcessingLedger};
use crate::queue::{BatchProgress, DocumentProcessor, Outcome, PipelineProgress, WorkQueue};
use crate::sources::{DocumentStore, FsDocumentStore};
use crate::stages::StagePipeline;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Parameters for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub input_directory: PathBuf,
    pub output_directory: PathBuf,
    pub max_concurrent: usize,
    /// Rolling one-minute token budget; 0 disables it.
    pub token_budget_per_minute: u64,
    pub min_word_overlap_fraction: f64,
    pub min_word_len: usize,
    pub verify_topics: bool,
    /// Attempts per provider call, including the first.
    pub max_retry_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Documents per super-batch.
    pub checkpoint_every: usize,
    /// Runs a failed document is retried across; 0 = unlimited.
    pub max_document_attempts: u32,
    pub min_text_chars: usize,
    pub max_input_chars: usize,
    /// Retries for document reads and artifact writes.
    pub io_retry_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let verifier = VerifierConfig::default();
        Self {
            input_directory: PathBuf::from("data/articles"),
            output_directory: PathBuf::from("data/analyses"),
            max_concurrent: 3,
            token_budget_per_minute: 450_000,
            min_word_overlap_fraction: verifier.min_word_overlap_fraction,
            min_word_len: verifier.min_word_len,
            verify_topics: verifier.verify_topics,
            max_retry_attempts: retry.max_attempts,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            checkpoint_every: 100,
            max_document_attempts: 3,
            min_text_chars: 500,
            max_input_chars: 300_000,
            io_retry_attempts: 2,
        }
    }
}

impl PipelineConfig {
    pub fn new(input_directory: impl Into<PathBuf>, output_directory: impl Into<PathBuf>) -> Self {
        Self {
            input_directory: input_directory.into(),
            output_directory: output_directory.into(),
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            ..Default::default()
        }
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            min_word_overlap_fraction: self.min_word_overlap_fraction,
            min_word_len: self.min_word_len,
            verify_topics: self.verify_topics,
        }
    }

    fn io_retry(&self) -> RetryPolicy {
        // `io_retry_attempts` counts retries, the policy counts attempts
        RetryPolicy::io(self.io_retry_attempts + 1)
    }

    fn budget(&self) -> TokenBudget {
        if self.token_budget_per_minute == 0 {
            TokenBudget::unlimited()
        } else {
            TokenBudget::per_minute(self.token_budget_per_minute)
        }
    }
}

// ── Result summary ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// Documents found in the input directory.
    pub total_documents: usize,
    /// Documents this run tried to process (`succeeded + failed`).
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Pending documents never admitted because the run was aborted.
    pub aborted: usize,
    /// Already complete or out of attempts.
    pub skipped: usize,
    /// Ids skipped because they failed `max_document_attempts` times.
    pub exhausted: Vec<String>,
    /// Candidates removed by verification across all successful documents.
    pub entities_dropped: usize,
    pub outcomes: Vec<Outcome>,
    pub llm_calls: u64,
    pub tokens_used: u64,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

// ── Per-document processor ────────────────────────────────────────────────────

fn io_class(e: &RuminaError) -> ErrorClass {
    if e.is_transient_io() {
        ErrorClass::Retryable { retry_after: None }
    } else {
        ErrorClass::Fatal
    }
}

/// Runs the stages for one document and keeps the ledger in step.
struct LedgeredProcessor {
    stages: StagePipeline,
    artifacts: Arc<dyn ArtifactStore>,
    ledger: Arc<Mutex<ProcessingLedger>>,
    io_retry: RetryPolicy,
}

impl LedgeredProcessor {
    async fn persist(&self, analysis: &VerifiedAnalysis) -> Result<()> {
        let label = format!("{}/artifact", analysis.id);
        with_retry_if(&self.io_retry, &label, io_class, |_| self.artifacts.write(analysis))
            .await
            .map_err(|e| e.into_inner())
    }

}

fn ledger_result(doc_id: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(doc_id, error = %e, "ledger update failed");
    }
}

#[async_trait]
impl DocumentProcessor for LedgeredProcessor {
    async fn process(&self, doc: SourceDocument, cancel: CancellationToken) -> Outcome {
        let id = doc.id.clone();

        if let Err(e) = self.ledger.lock().await.mark_in_progress(&id).await {
            warn!(doc_id = %id, error = %e, "cannot record attempt, skipping document");
            return Outcome::failed(id, None, format!("ledger: {e}"));
        }

        match self.stages.run_stages(&doc, &cancel).await {
            Ok(analysis) => {
                let dropped = analysis.verification.removed_count();
                if let Err(e) = self.persist(&analysis).await {
                    let reason = format!("artifact write failed: {e}");
                    ledger_result(&id, self.ledger.lock().await.mark_failed(&id, None, &reason).await);
                    return Outcome::failed(id, None, reason);
                }
                // a lost `complete` is healed from the artifact on the next run
                ledger_result(&id, self.ledger.lock().await.mark_complete(&id).await);
                Outcome::success(id, dropped)
            }
            Err(failure) if failure.is_cancelled() => {
                ledger_result(&id, self.ledger.lock().await.mark_cancelled(&id, failure.stage).await);
                Outcome::failed(id, Some(failure.stage), failure.message)
            }
            Err(failure) => {
                let reason = failure.to_string();
                ledger_result(
                    &id,
                    self.ledger.lock().await.mark_failed(&id, Some(failure.stage), &reason).await,
                );
                Outcome::failed(id, Some(failure.stage), reason)
            }
        }
    }
}

// ── Pipeline orchestrator ─────────────────────────────────────────────────────

/// Run the pipeline over `config.input_directory`, writing analyses, the
/// ledger and the analysis index into `config.output_directory`.
#[instrument(skip_all, fields(input = %config.input_directory.display(), output = %config.output_directory.display()))]
pub async fn run_pipeline(
    config: &PipelineConfig,
    backend: Arc<dyn LlmBackend>,
    cancel: CancellationToken,
    progress_tx: Option<broadcast::Sender<PipelineProgress>>,
) -> Result<BatchReport> {
    let store = FsDocumentStore::open(&config.input_directory, config.min_text_chars).await?;
    let artifacts = Arc::new(FsArtifactStore::open(&config.output_directory).await?);

    let report = run_with_stores(config, &store, artifacts.clone(), backend, cancel, progress_tx).await?;

    if let Err(e) = artifacts.write_index().await {
        warn!(error = %e, "failed to write analysis index");
    }
    Ok(report)
}

/// Core loop over explicit stores. The ledger lives in
/// `config.output_directory`.
pub async fn run_with_stores(
    config: &PipelineConfig,
    store: &dyn DocumentStore,
    artifacts: Arc<dyn ArtifactStore>,
    backend: Arc<dyn LlmBackend>,
    cancel: CancellationToken,
    progress_tx: Option<broadcast::Sender<PipelineProgress>>,
) -> Result<BatchReport> {
    let run_id = Uuid::new_v4();
    let t0 = std::time::Instant::now();

    tokio::fs::create_dir_all(&config.output_directory).await?;
    let mut ledger = ProcessingLedger::load_in(&config.output_directory)?;

    let all = store.list_ids().await?;
    let set = pending_documents(&all, &mut ledger, artifacts.as_ref(), config.max_document_attempts).await?;
    info!(
        run_id = %run_id,
        total = all.len(),
        pending = set.pending.len(),
        complete = set.complete.len(),
        exhausted = set.exhausted.len(),
        "starting pipeline run"
    );

    let ledger = Arc::new(Mutex::new(ledger));
    let progress = Arc::new(BatchProgress::new(set.pending.len()));
    let mut queue = WorkQueue::new(config.max_concurrent, Arc::new(config.budget()))
        .with_max_input_chars(config.max_input_chars)
        .with_progress(progress.clone())
        .with_run_id(run_id);
    if let Some(tx) = progress_tx {
        queue = queue.with_events(tx);
    }

    let processor = Arc::new(LedgeredProcessor {
        stages: StagePipeline::new(backend, config.retry_policy(), config.verifier_config(), config.max_input_chars),
        artifacts,
        ledger: ledger.clone(),
        io_retry: config.io_retry(),
    });

    let io_retry = config.io_retry();
    let mut outcomes = Vec::with_capacity(set.pending.len());

    for (n, chunk) in set.pending.chunks(config.checkpoint_every.max(1)).enumerate() {
        if cancel.is_cancelled() {
            for id in chunk {
                progress.record(false);
                outcomes.push(Outcome::aborted(id));
            }
            continue;
        }

        let mut documents = Vec::with_capacity(chunk.len());
        for id in chunk {
            let label = format!("{id}/load");
            match with_retry_if(&io_retry, &label, io_class, |_| store.load(id)).await {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    let e = e.into_inner();
                    warn!(doc_id = %id, error = %e, "document could not be loaded");
                    let mut l = ledger.lock().await;
                    let recorded = match l.mark_in_progress(id).await {
                        Ok(()) => l.mark_failed(id, None, &e.to_string()).await,
                        Err(le) => Err(le),
                    };
                    ledger_result(id, recorded);
                    progress.record(false);
                    outcomes.push(Outcome::failed(id.as_str(), None, e.to_string()));
                }
            }
        }

        debug!(batch = n, documents = documents.len(), "super-batch loaded");
        outcomes.extend(queue.process_batch(documents, processor.clone(), &cancel).await);

        ledger.lock().await.save().await?;
        let snap = progress.snapshot();
        info!(
            batch = n,
            completed = snap.completed,
            failed = snap.failed,
            remaining = snap.remaining,
            "checkpoint"
        );
        queue.emit("checkpoint");
    }

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let aborted = outcomes.iter().filter(|o| o.is_aborted()).count();
    let attempted = outcomes.len() - aborted;
    let report = BatchReport {
        run_id,
        total_documents: all.len(),
        attempted,
        succeeded,
        failed: attempted - succeeded,
        aborted,
        skipped: set.complete.len() + set.exhausted.len(),
        exhausted: set.exhausted,
        entities_dropped: outcomes.iter().map(|o| o.entities_dropped).sum(),
        llm_calls: processor.stages.llm_calls(),
        tokens_used: processor.stages.tokens_used(),
        cancelled: cancel.is_cancelled(),
        duration_ms: t0.elapsed().as_millis() as u64,
        outcomes,
    };

    info!(
        run_id = %run_id,
        succeeded = report.succeeded,
        failed = report.failed,
        aborted = report.aborted,
        skipped = report.skipped,
        entities_dropped = report.entities_dropped,
        llm_calls = report.llm_calls,
        duration_ms = report.duration_ms,
        "pipeline run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStatus;
    use pretty_assertions::assert_eq;
    use rumina_common::StageName;
    use rumina_test_utils::{write_text_articles, ScriptRule, ScriptedBackend, ScriptedFailure};

    fn config(dir: &std::path::Path) -> PipelineConfig {
        let input = dir.join("in");
        std::fs::create_dir_all(&input).unwrap();
        PipelineConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..PipelineConfig::new(input, dir.join("out"))
        }
    }

    #[test]
    fn test_defaults() {
        let c = PipelineConfig::default();
        assert_eq!(c.max_concurrent, 3);
        assert_eq!(c.token_budget_per_minute, 450_000);
        assert_eq!(c.min_word_overlap_fraction, 0.8);
        assert_eq!(c.checkpoint_every, 100);
        assert_eq!(c.retry_policy().base_delay, Duration::from_secs(10));
        assert_eq!(c.io_retry().max_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_writes_artifacts_ledger_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let ids = write_text_articles(&cfg.input_directory, 4, 100, "acetate was elevated");
        let backend = Arc::new(ScriptedBackend::new().with_response(StageName::Molecules, r#"["acetate", "ghost"]"#));

        let report = run_pipeline(&cfg, backend, CancellationToken::new(), None).await.unwrap();
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 0);
        assert_eq!(report.entities_dropped, 4);
        assert_eq!(report.llm_calls, 16);

        let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
        for id in &ids {
            assert_eq!(ledger.status(id), LedgerStatus::Complete);
            assert!(cfg.output_directory.join(format!("PMID{id}_analysis.json")).exists());
        }
        assert!(cfg.output_directory.join(crate::artifacts::INDEX_FILE).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_document_fails_without_llm_calls() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::write(cfg.input_directory.join("PMID1.txt"), "too short").unwrap();
        let backend = Arc::new(ScriptedBackend::new());

        let report = run_pipeline(&cfg, backend.clone(), CancellationToken::new(), None).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.outcome("1").unwrap().error.as_deref().unwrap().contains("Insufficient text"));
        assert_eq!(backend.call_count(), 0);

        let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
        assert_eq!(ledger.entry("1").unwrap().status, LedgerStatus::Failed);
        assert_eq!(ledger.entry("1").unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_document_recorded_with_stage() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        write_text_articles(&cfg.input_directory, 2, 1, "propionate");
        let backend = Arc::new(ScriptedBackend::new().with_rule(
            ScriptRule::fail(StageName::Topics, ScriptedFailure::Fatal("content policy".into()))
                .when_contains("marker-2"),
        ));

        let report = run_pipeline(&cfg, backend, CancellationToken::new(), None).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let failed = report.outcome("2").unwrap();
        assert_eq!(failed.stage, Some(StageName::Topics));

        let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
        let entry = ledger.entry("2").unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.last_stage, Some(StageName::Topics));
        assert!(!cfg.output_directory.join("PMID2_analysis.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        write_text_articles(&cfg.input_directory, 3, 1, "butyrate");
        let backend = Arc::new(ScriptedBackend::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_pipeline(&cfg, backend.clone(), cancel, None).await.unwrap();
        assert!(report.cancelled);
        assert_eq!((report.attempted, report.failed, report.aborted), (0, 0, 3));
        assert!(report.outcomes.iter().all(Outcome::is_aborted));
        assert_eq!(backend.call_count(), 0);
        assert!(ProcessingLedger::load_in(&cfg.output_directory).unwrap().is_empty());
    }
}
