//! Work queue and concurrency governor.
//!
//! Documents are admitted in order. Admission needs a semaphore slot (at
//! most `max_concurrent` documents in flight) and then a token-budget grant.
//! Each admitted document runs on its own tokio task; a finished task frees
//! its slot for the next queued document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::join_all;
use rumina_common::{SourceDocument, StageName};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::budget::{estimate_tokens, TokenBudget};

pub const ABORTED_BEFORE_ADMISSION: &str = "aborted before admission";

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// Result of one document in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub status: OutcomeStatus,
    /// Stage that failed; `None` for failures outside the stage sequence.
    pub stage: Option<StageName>,
    pub error: Option<String>,
    /// Candidates the verifier removed (successful documents only).
    #[serde(default)]
    pub entities_dropped: usize,
}

impl Outcome {
    pub fn success(id: impl Into<String>, entities_dropped: usize) -> Self {
        Self {
            id: id.into(),
            status: OutcomeStatus::Success,
            stage: None,
            error: None,
            entities_dropped,
        }
    }

    pub fn failed(id: impl Into<String>, stage: Option<StageName>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: OutcomeStatus::Failed,
            stage,
            error: Some(error.into()),
            entities_dropped: 0,
        }
    }

    pub fn aborted(id: impl Into<String>) -> Self {
        Self::failed(id, None, ABORTED_BEFORE_ADMISSION)
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn is_aborted(&self) -> bool {
        self.error.as_deref() == Some(ABORTED_BEFORE_ADMISSION)
    }
}

/// Work done for one admitted document. Owns retry/ledger decisions; the
/// queue only bounds concurrency and budget.
#[async_trait]
pub trait DocumentProcessor: Send + Sync + 'static {
    async fn process(&self, doc: SourceDocument, cancel: CancellationToken) -> Outcome;
}

// ── Ownership ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipAction {
    Claimed,
    Released,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipEvent {
    pub doc_id: String,
    pub task: Uuid,
    pub action: OwnershipAction,
}

/// Assigns each live document id to exactly one task.
#[derive(Debug, Default)]
pub struct OwnerRegistry {
    live: Mutex<HashMap<String, Uuid>>,
    log: Mutex<Vec<OwnershipEvent>>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `doc_id` for a new task. `None` if another task holds it.
    /// The claim is released when the returned guard drops.
    pub fn claim(self: &Arc<Self>, doc_id: &str) -> Option<OwnerClaim> {
        let task = Uuid::new_v4();
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let action = if live.contains_key(doc_id) {
            OwnershipAction::Refused
        } else {
            live.insert(doc_id.to_string(), task);
            OwnershipAction::Claimed
        };
        self.record(doc_id, task, action);
        drop(live);

        (action == OwnershipAction::Claimed).then(|| OwnerClaim {
            registry: Arc::clone(self),
            doc_id: doc_id.to_string(),
            task,
        })
    }

    pub fn owner_of(&self, doc_id: &str) -> Option<Uuid> {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).get(doc_id).copied()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every claim, release and refusal in order.
    pub fn audit_log(&self) -> Vec<OwnershipEvent> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn release(&self, doc_id: &str, task: Uuid) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if live.get(doc_id) == Some(&task) {
            live.remove(doc_id);
            self.record(doc_id, task, OwnershipAction::Released);
        }
    }

    fn record(&self, doc_id: &str, task: Uuid, action: OwnershipAction) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(OwnershipEvent { doc_id: doc_id.to_string(), task, action });
    }
}

/// Live ownership of one document; releases on drop (including task abort).
#[derive(Debug)]
pub struct OwnerClaim {
    registry: Arc<OwnerRegistry>,
    doc_id: String,
    task: Uuid,
}

impl OwnerClaim {
    pub fn task(&self) -> Uuid {
        self.task
    }
}

impl Drop for OwnerClaim {
    fn drop(&mut self) {
        self.registry.release(&self.doc_id, self.task);
    }
}

// ── Progress ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub in_flight: usize,
    pub remaining: usize,
    pub failed: usize,
}

/// Lock-free batch counters.
#[derive(Debug, Default)]
pub struct BatchProgress {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        let p = Self::default();
        p.total.store(total, Ordering::SeqCst);
        p
    }

    pub fn add_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    fn admitted(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn finished(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.record(success);
    }

    /// Count a document that never went in flight.
    pub fn record(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        ProgressSnapshot {
            completed,
            in_flight,
            remaining: total.saturating_sub(completed + failed + in_flight),
            failed,
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Progress event emitted during a run (cloneable for broadcast).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    pub run_id: Uuid,
    pub event: String,
    pub doc_id: Option<String>,
    pub completed: usize,
    pub in_flight: usize,
    pub remaining: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl PipelineProgress {
    pub fn new(run_id: Uuid, event: &str, doc_id: Option<&str>, snap: ProgressSnapshot) -> Self {
        Self {
            run_id,
            event: event.to_string(),
            doc_id: doc_id.map(String::from),
            completed: snap.completed,
            in_flight: snap.in_flight,
            remaining: snap.remaining,
            failed: snap.failed,
            error: None,
        }
    }
}

#[derive(Clone)]
struct Emitter {
    run_id: Uuid,
    progress: Arc<BatchProgress>,
    tx: Option<broadcast::Sender<PipelineProgress>>,
}

impl Emitter {
    fn emit(&self, event: &str, doc_id: Option<&str>, error: Option<&str>) {
        if let Some(ref tx) = self.tx {
            let mut ev = PipelineProgress::new(self.run_id, event, doc_id, self.progress.snapshot());
            ev.error = error.map(String::from);
            let _ = tx.send(ev);
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Concurrency governor shared by every super-batch of one run.
pub struct WorkQueue {
    max_concurrent: usize,
    max_input_chars: usize,
    budget: Arc<TokenBudget>,
    owners: Arc<OwnerRegistry>,
    progress: Arc<BatchProgress>,
    events: Option<broadcast::Sender<PipelineProgress>>,
    run_id: Uuid,
}

impl WorkQueue {
    pub fn new(max_concurrent: usize, budget: Arc<TokenBudget>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_input_chars: usize::MAX,
            budget,
            owners: Arc::new(OwnerRegistry::new()),
            progress: Arc::new(BatchProgress::default()),
            events: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    pub fn with_progress(mut self, progress: Arc<BatchProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_events(mut self, tx: broadcast::Sender<PipelineProgress>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_owners(mut self, owners: Arc<OwnerRegistry>) -> Self {
        self.owners = owners;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn owners(&self) -> &Arc<OwnerRegistry> {
        &self.owners
    }

    pub fn progress(&self) -> &Arc<BatchProgress> {
        &self.progress
    }

    pub fn budget(&self) -> &Arc<TokenBudget> {
        &self.budget
    }

    fn emitter(&self) -> Emitter {
        Emitter { run_id: self.run_id, progress: self.progress.clone(), tx: self.events.clone() }
    }

    /// Emit a run-level event (e.g. a checkpoint) on the progress channel.
    pub fn emit(&self, event: &str) {
        self.emitter().emit(event, None, None);
    }

    /// Process `documents`, returning one outcome per document in input order.
    pub async fn process_batch<P>(
        &self,
        documents: Vec<SourceDocument>,
        processor: Arc<P>,
        cancel: &CancellationToken,
    ) -> Vec<Outcome>
    where
        P: DocumentProcessor + ?Sized,
    {
        enum Slot {
            Done(Outcome),
            Running(String, JoinHandle<Outcome>),
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let emitter = self.emitter();
        let mut slots = Vec::with_capacity(documents.len());

        for doc in documents {
            if cancel.is_cancelled() {
                slots.push(Slot::Done(self.reject(Outcome::aborted(&doc.id))));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                slots.push(Slot::Done(self.reject(Outcome::aborted(&doc.id))));
                continue;
            };

            let estimate = estimate_tokens(&doc, self.max_input_chars);
            if !self.budget.acquire_or_cancel(estimate, cancel).await {
                slots.push(Slot::Done(self.reject(Outcome::aborted(&doc.id))));
                continue;
            }

            let Some(claim) = self.owners.claim(&doc.id) else {
                warn!(doc_id = %doc.id, "document already owned by another task");
                slots.push(Slot::Done(self.reject(Outcome::failed(
                    &doc.id,
                    None,
                    "document already owned by another task",
                ))));
                continue;
            };

            self.progress.admitted();
            debug!(doc_id = %doc.id, estimate, task = %claim.task(), "admitted");
            emitter.emit("admitted", Some(&doc.id), None);

            let id = doc.id.clone();
            let processor = processor.clone();
            let cancel = cancel.clone();
            let emitter = emitter.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let _claim = claim;
                let outcome = processor.process(doc, cancel).await;
                emitter.progress.finished(outcome.is_success());
                let event = if outcome.is_success() { "completed" } else { "failed" };
                emitter.emit(event, Some(&outcome.id), outcome.error.as_deref());
                outcome
            });
            slots.push(Slot::Running(id, handle));
        }

        let progress = self.progress.clone();
        join_all(slots.into_iter().map(|slot| {
            let progress = progress.clone();
            async move {
                match slot {
                    Slot::Done(outcome) => outcome,
                    Slot::Running(id, handle) => match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            // task panicked or was aborted before reporting
                            progress.finished(false);
                            warn!(doc_id = %id, error = %e, "document task ended abnormally");
                            Outcome::failed(id, None, format!("task failed: {e}"))
                        }
                    },
                }
            }
        }))
        .await
    }

    fn reject(&self, outcome: Outcome) -> Outcome {
        self.progress.record(false);
        outcome
    }
}

/// Process one batch with a fresh governor.
pub async fn process_batch<P>(
    documents: Vec<SourceDocument>,
    max_concurrent: usize,
    budget: Arc<TokenBudget>,
    processor: Arc<P>,
    cancel: &CancellationToken,
) -> Vec<Outcome>
where
    P: DocumentProcessor + ?Sized,
{
    let queue = WorkQueue::new(max_concurrent, budget);
    queue.progress.add_total(documents.len());
    queue.process_batch(documents, processor, cancel).await
}
