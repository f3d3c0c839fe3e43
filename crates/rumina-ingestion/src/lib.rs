//! rumina-ingestion — Verified extraction pipeline.
//! - Source documents (JATS XML, plain text)
//! - Work queue with a concurrency governor and token budget
//! - Four-stage LLM extraction with inline verification
//! - Processing ledger, artifacts and resume
//! - Reconciliation of persisted analyses

pub mod artifacts;
pub mod budget;
pub mod ledger;
pub mod pipeline;
pub mod prompts;
pub mod queue;
pub mod reconcile;
pub mod sources;
pub mod stages;

pub use artifacts::{ArtifactStore, FsArtifactStore};
pub use budget::TokenBudget;
pub use ledger::{LedgerStatus, ProcessingLedger};
pub use pipeline::{run_pipeline, BatchReport, PipelineConfig};
pub use queue::{process_batch, DocumentProcessor, Outcome, OutcomeStatus, PipelineProgress, WorkQueue};
pub use reconcile::{reconcile, ReconcileOptions, ReconciliationReport};
pub use sources::{DocumentStore, FsDocumentStore};
pub use stages::{StageFailure, StagePipeline};
