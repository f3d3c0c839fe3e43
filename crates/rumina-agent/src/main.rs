//! Rumina — verified LLM extraction for scientific articles.
//! Entry point for the `rumina` binary.

mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rumina_ingestion::artifacts::{ArtifactStore, FsArtifactStore};
use rumina_ingestion::ledger::{LedgerStatus, ProcessingLedger};
use rumina_ingestion::sources::{DocumentStore, FsDocumentStore};
use rumina_ingestion::{reconcile, run_pipeline, BatchReport, PipelineProgress, ReconcileOptions};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rumina", version)]
#[command(about = "Summarise scientific articles with an LLM and keep only facts the source supports")]
struct Cli {
    /// Path to rumina.toml
    #[arg(long, global = true, env = "RUMINA_CONFIG")]
    config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every pending article in the input directory
    Run {
        /// Directory of JATS XML / text articles
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Directory for analyses and the ledger
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Articles processed at once
        #[arg(short = 'j', long)]
        max_concurrent: Option<usize>,
    },

    /// Re-verify stored analyses against their source articles
    Reconcile {
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Report removals without rewriting any file
        #[arg(long)]
        dry_run: bool,
    },

    /// Show ledger and artifact counts
    Status {
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rumina=debug,info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = config::Config::load(cli.config.as_deref())?;
    debug!(version = env!("CARGO_PKG_VERSION"), "configuration loaded");

    match cli.command {
        Commands::Run { input, output, max_concurrent } => {
            override_dirs(&mut config, input, output);
            if let Some(n) = max_concurrent {
                config.pipeline.max_concurrent = n.max(1);
            }
            run(&config, cli.json).await
        }
        Commands::Reconcile { input, output, dry_run } => {
            override_dirs(&mut config, input, output);
            run_reconcile(&config, dry_run, cli.json).await
        }
        Commands::Status { input, output } => {
            override_dirs(&mut config, input, output);
            status(&config, cli.json).await
        }
    }
}

fn override_dirs(config: &mut config::Config, input: Option<PathBuf>, output: Option<PathBuf>) {
    if let Some(dir) = input {
        config.pipeline.input_directory = dir;
    }
    if let Some(dir) = output {
        config.pipeline.output_directory = dir;
    }
}

async fn run(config: &config::Config, json: bool) -> anyhow::Result<()> {
    let backend = rumina_llm::backend::build_backend(&config.backend_config())
        .context("could not set up the LLM provider (check [llm] in rumina.toml and the API key)")?;
    let pipeline = config.pipeline_config();
    info!(
        model = backend.model_id(),
        input = %pipeline.input_directory.display(),
        output = %pipeline.output_directory.display(),
        max_concurrent = pipeline.max_concurrent,
        "starting run"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received: finishing in-flight stages, no new articles will start");
                cancel.cancel();
            }
        });
    }

    let (tx, rx) = broadcast::channel(1024);
    tokio::spawn(log_progress(rx));

    let report = run_pipeline(&pipeline, backend, cancel, Some(tx)).await?;
    print_run_report(&report, json)?;
    Ok(())
}

async fn log_progress(mut rx: broadcast::Receiver<PipelineProgress>) {
    loop {
        match rx.recv().await {
            Ok(ev) if ev.event == "checkpoint" => info!(
                completed = ev.completed,
                failed = ev.failed,
                remaining = ev.remaining,
                "progress"
            ),
            Ok(ev) => debug!(
                event = %ev.event,
                doc_id = ev.doc_id.as_deref().unwrap_or(""),
                in_flight = ev.in_flight,
                "progress"
            ),
            Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "progress events dropped"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_run_report(report: &BatchReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Run {}", report.run_id);
    println!("  documents:        {}", report.total_documents);
    println!("  attempted:        {}", report.attempted);
    println!("  succeeded:        {}", report.succeeded);
    println!("  failed:           {}", report.failed);
    if report.aborted > 0 {
        println!("  not started:      {}", report.aborted);
    }
    println!("  skipped:          {}", report.skipped);
    println!("  entities dropped: {}", report.entities_dropped);
    println!("  llm calls:        {} ({} tokens)", report.llm_calls, report.tokens_used);
    println!("  duration:         {:.1}s", report.duration_ms as f64 / 1000.0);
    if report.cancelled {
        println!("  interrupted: unfinished articles stay pending for the next run");
    }
    for o in report.failures() {
        let stage = o.stage.map(|s| s.as_str()).unwrap_or("-");
        println!("  ✗ {} [{}] {}", o.id, stage, o.error.as_deref().unwrap_or(""));
    }
    if !report.exhausted.is_empty() {
        println!("  out of attempts: {}", report.exhausted.join(", "));
    }
    Ok(())
}

async fn run_reconcile(config: &config::Config, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let pipeline = config.pipeline_config();
    let options = ReconcileOptions { dry_run, verifier: pipeline.verifier_config() };
    let report = reconcile(&pipeline.output_directory, &pipeline.input_directory, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let mode = if dry_run { "dry run" } else { "fixed" };
    println!("Reconciliation ({mode})");
    println!("  checked:          {}", report.checked);
    println!("  with removals:    {}", report.modified);
    println!("  entities removed: {}", report.entities_removed);
    println!("  skipped:          {}", report.errors.len());
    for a in &report.artifacts {
        for (kind, removed) in &a.removed {
            println!("  {} {}: -{} ({})", a.id, kind.as_str(), removed.len(), removed.join(", "));
        }
    }
    if dry_run && report.modified > 0 {
        println!("Run without --dry-run to rewrite the affected analyses.");
    }
    Ok(())
}

async fn status(config: &config::Config, json: bool) -> anyhow::Result<()> {
    let p = &config.pipeline;
    let ledger = ProcessingLedger::load_in(&p.output_directory)?;
    let counts = ledger.counts();
    let artifacts = match FsArtifactStore::open_existing(&p.output_directory).await {
        Ok(store) => store.list_ids().await?.len(),
        Err(e) => {
            warn!(error = %e, "artifact directory unavailable");
            0
        }
    };
    let documents = match FsDocumentStore::open(&p.input_directory, 0).await {
        Ok(store) => store.list_ids().await?.len(),
        Err(e) => {
            warn!(error = %e, "input directory unavailable");
            0
        }
    };

    if json {
        let value = serde_json::json!({
            "documents": documents,
            "artifacts": artifacts,
            "ledger": counts,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("Input:  {} ({} articles)", p.input_directory.display(), documents);
    println!("Output: {} ({} analyses)", p.output_directory.display(), artifacts);
    println!(
        "Ledger: {} complete, {} failed, {} in progress, {} pending",
        counts.complete, counts.failed, counts.in_progress, counts.pending
    );
    for (id, entry) in ledger.iter().filter(|(_, e)| e.status == LedgerStatus::Failed) {
        println!(
            "  ✗ {id} after {} attempt(s) [{}] {}",
            entry.attempts,
            entry.last_stage.map(|s| s.as_str()).unwrap_or("-"),
            entry.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
