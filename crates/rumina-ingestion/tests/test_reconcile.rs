//! Reconciliation over artifacts produced by a real pipeline run.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rumina_common::{EntityKind, StageName};
use rumina_ingestion::artifacts::{ArtifactStore, FsArtifactStore};
use rumina_ingestion::pipeline::{run_pipeline, PipelineConfig};
use rumina_ingestion::reconcile::{reconcile, ReconcileOptions};
use rumina_test_utils::{write_jats_article, write_text_articles, ScriptedBackend};
use tokio_util::sync::CancellationToken;

fn read_dir_bytes(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (e.file_name().to_string_lossy().into_owned(), std::fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_tightens_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("articles");
    let output = dir.path().join("analyses");
    std::fs::create_dir_all(&input).unwrap();
    write_text_articles(&input, 3, 1, "nitrate supplementation lowered methane output");

    // a lenient run lets half-supported candidates through
    let cfg = PipelineConfig { min_word_overlap_fraction: 0.5, ..PipelineConfig::new(&input, &output) };
    let backend = Arc::new(
        ScriptedBackend::new().with_response(StageName::Molecules, r#"["nitrate", "sodium nitrate", "methane"]"#),
    );
    let report = run_pipeline(&cfg, backend, CancellationToken::new(), None).await.unwrap();
    assert_eq!(report.succeeded, 3);

    let store = FsArtifactStore::open(&output).await.unwrap();
    assert_eq!(store.read("1").await.unwrap().molecules, vec!["nitrate", "sodium nitrate", "methane"]);

    let first = reconcile(&output, &input, &ReconcileOptions::default()).await.unwrap();
    assert_eq!(first.checked, 3);
    assert_eq!(first.modified, 3);
    assert_eq!(first.entities_removed, 3);
    for a in &first.artifacts {
        assert_eq!(a.removed[&EntityKind::Molecule], vec!["sodium nitrate"]);
    }
    let after_first = read_dir_bytes(&output);

    let second = reconcile(&output, &input, &ReconcileOptions::default()).await.unwrap();
    assert_eq!(second.checked, 3);
    assert_eq!(second.modified, 0);
    assert_eq!(second.entities_removed, 0);
    assert_eq!(read_dir_bytes(&output), after_first);

    let a = store.read("2").await.unwrap();
    assert_eq!(a.molecules, vec!["nitrate", "methane"]);
    assert!(a.verification.reconciled_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_against_jats_source() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("xml");
    let output = dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_jats_article(
        &input,
        "555",
        "Epigenetic marks in rumen epithelium",
        "Expression of DNA methyltransferases was reduced.",
        &"Ruminal papillae were sampled at slaughter. ".repeat(20),
    );

    let cfg = PipelineConfig::new(&input, &output);
    let backend = Arc::new(ScriptedBackend::new().with_response(
        StageName::Topics,
        r#"{"topics": ["epigenetics"], "keywords": ["DNA-methyltransferases", "histone acetylation"]}"#,
    ));
    let report = run_pipeline(&cfg, backend, CancellationToken::new(), None).await.unwrap();
    assert_eq!(report.succeeded, 1);

    let store = FsArtifactStore::open(&output).await.unwrap();
    let a = store.read("555").await.unwrap();
    assert_eq!(a.keywords, vec!["DNA-methyltransferases"]);
    assert_eq!(a.source_file.as_deref(), Some("Article_PMID555.xml"));

    // inline verification already did the work
    let r = reconcile(&output, &input, &ReconcileOptions::default()).await.unwrap();
    assert_eq!(r.modified, 0);
}
