//! End-to-end pipeline runs over a temp directory with a scripted backend.
//!
//! ```bash
//! cargo test --package rumina-ingestion --test test_pipeline_e2e
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rumina_common::{Result, RuminaError, SourceDocument, StageName, VerifiedAnalysis};
use rumina_ingestion::artifacts::{ArtifactStore, FsArtifactStore, INDEX_FILE};
use rumina_ingestion::ledger::{LedgerStatus, ProcessingLedger, LEDGER_FILE};
use rumina_ingestion::pipeline::{run_pipeline, run_with_stores, PipelineConfig};
use rumina_ingestion::queue::OutcomeStatus;
use rumina_ingestion::sources::{DocumentStore, FsDocumentStore};
use rumina_test_utils::{write_text_articles, ScriptRule, ScriptedBackend, ScriptedFailure};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn config(root: &Path) -> PipelineConfig {
    let input = root.join("articles");
    std::fs::create_dir_all(&input).unwrap();
    PipelineConfig {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
        ..PipelineConfig::new(input, root.join("analyses"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_ten_documents_one_fatal_clean_failure() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let ids = write_text_articles(&cfg.input_directory, 10, 1, "acetate and propionate rose after feeding");

    let backend = Arc::new(
        ScriptedBackend::new()
            .with_latency_range(Duration::from_millis(100), Duration::from_millis(900))
            .with_response(StageName::Molecules, r#"["acetate", "propionate", "3-nitrooxypropanol"]"#)
            .with_rule(
                ScriptRule::fail(StageName::Clean, ScriptedFailure::Fatal("invalid request".into()))
                    .when_contains("marker-7."),
            ),
    );
    let (tx, mut rx) = broadcast::channel(256);

    let report = run_pipeline(&cfg, backend.clone(), CancellationToken::new(), Some(tx))
        .await
        .unwrap();

    assert_eq!(report.attempted, 10);
    assert_eq!(report.succeeded, 9);
    assert_eq!(report.failed, 1);
    assert_eq!(report.entities_dropped, 9);

    let failure = report.outcome("7").unwrap();
    assert_eq!(failure.status, OutcomeStatus::Failed);
    assert_eq!(failure.stage, Some(StageName::Clean));
    assert!(backend.peak_concurrency() <= 3);
    // the failed document made exactly one call
    assert_eq!(backend.calls_matching(StageName::Clean, "marker-7."), 1);
    assert_eq!(backend.calls_matching(StageName::Summary, "marker-7."), 0);

    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    for id in &ids {
        let expected = if id == "7" { LedgerStatus::Failed } else { LedgerStatus::Complete };
        assert_eq!(ledger.status(id), expected, "doc {id}");
    }
    assert_eq!(ledger.entry("7").unwrap().last_stage, Some(StageName::Clean));

    let index: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(cfg.output_directory.join(INDEX_FILE)).unwrap()).unwrap();
    assert_eq!(index.len(), 9);

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(events.iter().all(|e| e.in_flight <= 3));
    assert_eq!(events.iter().filter(|e| e.event == "completed").count(), 9);
    assert_eq!(events.iter().filter(|e| e.event == "failed").count(), 1);
    let last = events.iter().rev().find(|e| e.event == "checkpoint").unwrap();
    assert_eq!((last.completed, last.failed, last.remaining), (9, 1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_resume_processes_only_unfinished_documents() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_text_articles(&cfg.input_directory, 5, 100, "butyrate increased");

    let flaky = Arc::new(ScriptedBackend::new().with_rule(
        ScriptRule::fail(StageName::Summary, ScriptedFailure::Transient("overloaded".into()))
            .when_contains("marker-102."),
    ));
    let first = run_pipeline(&cfg, flaky.clone(), CancellationToken::new(), None).await.unwrap();
    assert_eq!(first.succeeded, 4);
    let failed = first.outcome("102").unwrap();
    assert_eq!(failed.stage, Some(StageName::Summary));
    // retried up to the policy, then given up
    assert_eq!(flaky.calls_matching(StageName::Summary, "marker-102."), 3);

    let healthy = Arc::new(ScriptedBackend::new());
    let second = run_pipeline(&cfg, healthy.clone(), CancellationToken::new(), None).await.unwrap();
    assert_eq!(second.attempted, 1);
    assert_eq!(second.succeeded, 1);
    assert_eq!(second.skipped, 4);
    assert_eq!(healthy.call_count(), 4);

    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    assert_eq!(ledger.entry("102").unwrap().attempts, 2);
    assert_eq!(ledger.counts().complete, 5);
}

#[tokio::test(start_paused = true)]
async fn test_document_given_up_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { max_document_attempts: 2, ..config(dir.path()) };
    write_text_articles(&cfg.input_directory, 1, 1, "methane");

    let broken = Arc::new(
        ScriptedBackend::new()
            .with_rule(ScriptRule::fail(StageName::Molecules, ScriptedFailure::Fatal("content policy".into()))),
    );
    for _ in 0..2 {
        let r = run_pipeline(&cfg, broken.clone(), CancellationToken::new(), None).await.unwrap();
        assert_eq!(r.failed, 1);
    }

    let third = run_pipeline(&cfg, broken.clone(), CancellationToken::new(), None).await.unwrap();
    assert_eq!(third.attempted, 0);
    assert_eq!(third.exhausted, vec!["1"]);
    assert_eq!(broken.calls_for(StageName::Clean), 2);
}

#[tokio::test(start_paused = true)]
async fn test_crash_mid_stage_leaves_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_text_articles(&cfg.input_directory, 2, 40, "propionate");

    let backend = Arc::new(ScriptedBackend::new());
    let gate = backend.gate(StageName::Molecules);

    let run = {
        let (cfg, backend) = (cfg.clone(), backend.clone());
        tokio::spawn(async move { run_pipeline(&cfg, backend, CancellationToken::new(), None).await })
    };
    gate.wait_entered().await;
    // simulated crash: the run disappears while a document is mid-stage
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    for id in ["40", "41"] {
        assert!(!cfg.output_directory.join(format!("PMID{id}_analysis.json")).exists());
        assert_ne!(ledger.status(id), LedgerStatus::Complete);
    }
    assert!(ledger.iter().any(|(_, e)| e.status == LedgerStatus::InProgress));

    // restart: in-progress documents are picked up again
    let restarted = Arc::new(ScriptedBackend::new());
    let report = run_pipeline(&cfg, restarted, CancellationToken::new(), None).await.unwrap();
    assert_eq!(report.succeeded, 2);
    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    assert_eq!(ledger.counts().complete, 2);
}

#[tokio::test(start_paused = true)]
async fn test_global_abort_checkpoints_in_flight_documents() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { max_concurrent: 1, ..config(dir.path()) };
    write_text_articles(&cfg.input_directory, 3, 1, "acetate");

    let backend = Arc::new(ScriptedBackend::new());
    let gate = backend.gate(StageName::Summary);
    let cancel = CancellationToken::new();

    let run = {
        let (cfg, backend, cancel) = (cfg.clone(), backend.clone(), cancel.clone());
        tokio::spawn(async move { run_pipeline(&cfg, backend, cancel, None).await })
    };
    gate.wait_entered().await;
    cancel.cancel();
    gate.release();

    let report = run.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.succeeded, 0);
    // only the admitted document counts as attempted
    assert_eq!((report.attempted, report.failed, report.aborted), (1, 1, 2));

    let first = report.outcome("1").unwrap();
    assert_eq!(first.stage, Some(StageName::Molecules));
    assert_eq!(first.error.as_deref(), Some("cancelled"));
    assert!(report.outcome("2").unwrap().is_aborted());
    assert!(report.outcome("3").unwrap().is_aborted());

    // the interrupted attempt is not counted; never-admitted documents are untouched
    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    let entry = ledger.entry("1").unwrap();
    assert_eq!(entry.status, LedgerStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert!(ledger.entry("2").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_token_budget_spaces_admissions() {
    let dir = tempfile::tempdir().unwrap();
    // room for two documents per minute
    let cfg = PipelineConfig { token_budget_per_minute: 40_000, max_concurrent: 4, ..config(dir.path()) };
    write_text_articles(&cfg.input_directory, 4, 1, "nitrate");

    let backend = Arc::new(ScriptedBackend::new());
    let report = run_pipeline(&cfg, backend.clone(), CancellationToken::new(), None).await.unwrap();
    assert_eq!(report.succeeded, 4);

    let mut starts: Vec<_> = backend
        .calls()
        .into_iter()
        .filter(|c| c.stage == Some(StageName::Clean))
        .map(|c| c.at)
        .collect();
    starts.sort();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(3) {
        assert!(
            pair[2] - pair[0] >= Duration::from_secs(60),
            "three documents admitted within one budget window"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_ledger_healed_from_existing_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_text_articles(&cfg.input_directory, 3, 1, "acetate");

    run_pipeline(&cfg, Arc::new(ScriptedBackend::new()), CancellationToken::new(), None)
        .await
        .unwrap();
    std::fs::remove_file(cfg.output_directory.join("ledger.json")).unwrap();

    let backend = Arc::new(ScriptedBackend::new());
    let report = run_pipeline(&cfg, backend.clone(), CancellationToken::new(), None).await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(report.skipped, 3);
    assert_eq!(backend.call_count(), 0);
    assert_eq!(ProcessingLedger::load_in(&cfg.output_directory).unwrap().counts().complete, 3);
}

// ── I/O retry ─────────────────────────────────────────────────────────────────

fn disk_hiccup() -> RuminaError {
    RuminaError::Io(std::io::Error::other("disk hiccup"))
}

/// Artifact store whose first `failures` writes fail with a transient I/O error.
struct FlakyArtifacts {
    inner: FsArtifactStore,
    failures: AtomicUsize,
    writes: AtomicUsize,
}

impl FlakyArtifacts {
    async fn new(dir: &Path, failures: usize) -> Self {
        Self {
            inner: FsArtifactStore::open(dir).await.unwrap(),
            failures: AtomicUsize::new(failures),
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifacts {
    async fn write(&self, analysis: &VerifiedAnalysis) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(disk_hiccup());
        }
        self.inner.write(analysis).await
    }

    async fn read(&self, id: &str) -> Result<VerifiedAnalysis> {
        self.inner.read(id).await
    }

    async fn is_complete(&self, id: &str) -> bool {
        self.inner.is_complete(id).await
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        self.inner.list_ids().await
    }
}

/// Document store whose first `failures` loads fail with a transient I/O error.
struct FlakySources {
    inner: FsDocumentStore,
    failures: AtomicUsize,
    loads: AtomicUsize,
}

#[async_trait]
impl DocumentStore for FlakySources {
    async fn list_ids(&self) -> Result<Vec<String>> {
        self.inner.list_ids().await
    }

    async fn load(&self, id: &str) -> Result<SourceDocument> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(disk_hiccup());
        }
        self.inner.load(id).await
    }
}

#[test]
fn test_transient_io_classification() {
    assert!(disk_hiccup().is_transient_io());
    assert!(RuminaError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted)).is_transient_io());
    assert!(!RuminaError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient_io());
    assert!(!RuminaError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).is_transient_io());
    assert!(!RuminaError::DocumentNotFound("1".into()).is_transient_io());
    assert!(!RuminaError::InsufficientText { id: "1".into(), chars: 3, min: 500 }.is_transient_io());
}

#[tokio::test(start_paused = true)]
async fn test_artifact_write_gives_up_after_io_retries() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_text_articles(&cfg.input_directory, 1, 1, "acetate");
    let sources = FsDocumentStore::open(&cfg.input_directory, cfg.min_text_chars).await.unwrap();
    let artifacts = Arc::new(FlakyArtifacts::new(&cfg.output_directory, usize::MAX).await);

    let report = run_with_stores(
        &cfg,
        &sources,
        artifacts.clone(),
        Arc::new(ScriptedBackend::new()),
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    // first write plus `io_retry_attempts` retries
    assert_eq!(artifacts.writes.load(Ordering::SeqCst), cfg.io_retry_attempts as usize + 1);
    assert_eq!(report.failed, 1);
    let outcome = report.outcome("1").unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("artifact write failed"));

    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    assert_eq!(ledger.status("1"), LedgerStatus::Failed);
    assert_eq!(ledger.entry("1").unwrap().attempts, 1);

    // nothing but the ledger on disk
    let names: Vec<String> = std::fs::read_dir(&cfg.output_directory)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![LEDGER_FILE.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_artifact_write_recovers_after_one_failure() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_text_articles(&cfg.input_directory, 1, 1, "acetate");
    let sources = FsDocumentStore::open(&cfg.input_directory, cfg.min_text_chars).await.unwrap();
    let artifacts = Arc::new(FlakyArtifacts::new(&cfg.output_directory, 1).await);

    let report = run_with_stores(
        &cfg,
        &sources,
        artifacts.clone(),
        Arc::new(ScriptedBackend::new()),
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(artifacts.writes.load(Ordering::SeqCst), 2);
    assert_eq!(report.succeeded, 1);
    assert!(artifacts.is_complete("1").await);
    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    assert_eq!(ledger.status("1"), LedgerStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_document_load_retried_on_transient_io() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_text_articles(&cfg.input_directory, 1, 1, "acetate");
    let sources = FlakySources {
        inner: FsDocumentStore::open(&cfg.input_directory, cfg.min_text_chars).await.unwrap(),
        failures: AtomicUsize::new(1),
        loads: AtomicUsize::new(0),
    };
    let artifacts = Arc::new(FsArtifactStore::open(&cfg.output_directory).await.unwrap());

    let report = run_with_stores(
        &cfg,
        &sources,
        artifacts,
        Arc::new(ScriptedBackend::new()),
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(sources.loads.load(Ordering::SeqCst), 2);
    assert_eq!(report.succeeded, 1);
    let ledger = ProcessingLedger::load_in(&cfg.output_directory).unwrap();
    assert_eq!(ledger.status("1"), LedgerStatus::Complete);
}
