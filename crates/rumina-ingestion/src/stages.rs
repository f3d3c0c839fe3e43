//! The four ordered extraction stages for one document.
//!
//!   1. clean      → cleaned article text (fatal for the document on failure)
//!   2. summary    → comprehensive prose summary
//!   3. molecules  → JSON array of candidate molecule names
//!   4. topics     → JSON object `{ topics, keywords }`
//!
//! Each stage call runs under the retry controller. Output that carries no
//! parseable JSON counts as a retryable failure. Candidates are verified
//! against the raw source text before a `VerifiedAnalysis` is built.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use rumina_common::{
    EntityKind, ExtractedEntity, SourceDocument, StageName, StageResult, TextLengths,
    VerificationMetadata, VerifiedAnalysis,
};
use rumina_llm::audit::LlmAuditEntry;
use rumina_llm::{with_retry, ErrorClass, LlmBackend, LlmError, LlmRequest, RetryPolicy, Retryable};
use rumina_verify::{dedup, SourceIndex, Verifier, VerifierConfig};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::prompts;

/// Message carried by a failure caused by a global abort.
pub const CANCELLED: &str = "cancelled";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure of a single stage attempt.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("malformed {stage} output: {reason}")]
    MalformedOutput { stage: StageName, reason: String },
}

impl Retryable for StageError {
    fn classify(&self) -> ErrorClass {
        match self {
            StageError::Llm(e) => e.classify(),
            StageError::MalformedOutput { .. } => ErrorClass::Retryable { retry_after: None },
        }
    }
}

/// Terminal failure of a document, tagged with the stage that gave up.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{stage} stage failed after {attempts} attempt(s): {message}")]
pub struct StageFailure {
    pub stage: StageName,
    pub message: String,
    pub attempts: u32,
}

impl StageFailure {
    pub fn cancelled(stage: StageName) -> Self {
        Self { stage, message: CANCELLED.to_string(), attempts: 0 }
    }

    pub fn is_cancelled(&self) -> bool {
        self.message == CANCELLED
    }
}

// ── Output parsing ────────────────────────────────────────────────────────────

fn json_array_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").unwrap())
}

fn json_object_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

fn malformed(stage: StageName, reason: impl Into<String>) -> StageError {
    StageError::MalformedOutput { stage, reason: reason.into() }
}

fn strings_only(values: Vec<serde_json::Value>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn non_empty_text(stage: StageName, output: &str) -> Result<String, StageError> {
    let text = output.trim();
    if text.is_empty() {
        return Err(malformed(stage, "empty response"));
    }
    Ok(text.to_string())
}

/// Molecule candidates from the first `[...]` span of the output.
pub fn parse_molecules(output: &str) -> Result<Vec<ExtractedEntity>, StageError> {
    let stage = StageName::Molecules;
    let span = json_array_regex()
        .find(output)
        .ok_or_else(|| malformed(stage, "no JSON array found"))?;
    let values: Vec<serde_json::Value> =
        serde_json::from_str(span.as_str()).map_err(|e| malformed(stage, e.to_string()))?;
    Ok(strings_only(values).into_iter().map(ExtractedEntity::molecule).collect())
}

#[derive(Debug, Deserialize)]
struct TopicsPayload {
    #[serde(default)]
    topics: Vec<serde_json::Value>,
    #[serde(default)]
    keywords: Vec<serde_json::Value>,
}

/// Topic and keyword candidates from the first `{...}` span of the output.
pub fn parse_topics(output: &str) -> Result<(Vec<ExtractedEntity>, Vec<ExtractedEntity>), StageError> {
    let stage = StageName::Topics;
    let span = json_object_regex()
        .find(output)
        .ok_or_else(|| malformed(stage, "no JSON object found"))?;
    let payload: TopicsPayload =
        serde_json::from_str(span.as_str()).map_err(|e| malformed(stage, e.to_string()))?;
    Ok((
        strings_only(payload.topics).into_iter().map(ExtractedEntity::topic).collect(),
        strings_only(payload.keywords).into_iter().map(ExtractedEntity::keyword).collect(),
    ))
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Runs the stage sequence for one document against a provider backend.
pub struct StagePipeline {
    backend: Arc<dyn LlmBackend>,
    retry: RetryPolicy,
    verifier: Verifier,
    max_input_chars: usize,
    calls: AtomicU64,
    tokens: AtomicU64,
}

impl StagePipeline {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        retry: RetryPolicy,
        verifier: VerifierConfig,
        max_input_chars: usize,
    ) -> Self {
        Self {
            backend,
            retry,
            verifier: Verifier::new(verifier),
            max_input_chars,
            calls: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }

    /// Successful provider calls so far.
    pub fn llm_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Provider-reported tokens (prompt + completion) so far.
    pub fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    #[instrument(skip_all, fields(doc_id = %doc.id))]
    pub async fn run_stages(
        &self,
        doc: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<VerifiedAnalysis, StageFailure> {
        let t0 = Instant::now();

        let (input, truncated) = prompts::truncate_input(&doc.full_text(), self.max_input_chars);
        if truncated {
            debug!(max_chars = self.max_input_chars, "input truncated");
        }

        let mut cleaned: Option<String> = None;
        let mut summary = String::new();
        let mut molecules = Vec::new();
        let mut topics = Vec::new();
        let mut keywords = Vec::new();

        for stage in StageName::ALL {
            checkpoint(cancel, stage)?;
            // every stage after clean reads the cleaned text
            let text = cleaned.as_deref().unwrap_or(&input);
            let result = self.run_stage(&doc.id, stage, text).await?;
            match result {
                StageResult::Clean { text } => cleaned = Some(text),
                StageResult::Summary { text } => summary = text,
                StageResult::Molecules { candidates } => molecules = candidates,
                StageResult::Topics { topics: t, keywords: k } => {
                    topics = t;
                    keywords = k;
                }
            }
        }
        let cleaned = cleaned.unwrap_or_default();

        let analysis = self.verify_and_build(doc, cleaned, summary, molecules, topics, keywords, t0);
        info!(
            molecules = analysis.molecules.len(),
            keywords = analysis.keywords.len(),
            topics = analysis.topics.len(),
            removed = analysis.verification.removed_count(),
            elapsed_s = analysis.processing_time_seconds,
            "document analysed"
        );
        Ok(analysis)
    }

    /// Run one stage over `text` (the truncated source for clean, the
    /// cleaned text afterwards).
    pub async fn run_stage(&self, doc_id: &str, stage: StageName, text: &str) -> Result<StageResult, StageFailure> {
        match stage {
            StageName::Clean => {
                self.call(doc_id, stage, prompts::clean(text), |out| {
                    non_empty_text(stage, out).map(|text| StageResult::Clean { text })
                })
                .await
            }
            StageName::Summary => {
                self.call(doc_id, stage, prompts::summary(text, doc_id), |out| {
                    non_empty_text(stage, out).map(|text| StageResult::Summary { text })
                })
                .await
            }
            StageName::Molecules => {
                self.call(doc_id, stage, prompts::molecules(text), |out| {
                    parse_molecules(out).map(|candidates| StageResult::Molecules { candidates })
                })
                .await
            }
            StageName::Topics => {
                self.call(doc_id, stage, prompts::topics(text, doc_id), |out| {
                    parse_topics(out).map(|(topics, keywords)| StageResult::Topics { topics, keywords })
                })
                .await
            }
        }
    }

    /// One provider call for `stage`, retried under the pipeline's policy.
    /// `parse` runs inside the retry loop so malformed output is retried too.
    async fn call<T, P>(&self, doc_id: &str, stage: StageName, prompt: String, parse: P) -> Result<T, StageFailure>
    where
        P: Fn(&str) -> Result<T, StageError>,
    {
        let request = LlmRequest::prompt(prompt, prompts::max_output_tokens(stage)).with_label(stage.as_str());
        let label = format!("{doc_id}/{stage}");
        let parse = &parse;

        with_retry(&self.retry, &label, |attempt| {
            let request = request.clone();
            async move {
                let started = Instant::now();
                let response = self.backend.complete(request).await?;
                let entry = LlmAuditEntry::from_response(
                    doc_id,
                    stage.as_str(),
                    attempt,
                    &response,
                    started.elapsed().as_millis() as u64,
                );
                entry.log();
                self.calls.fetch_add(1, Ordering::Relaxed);
                self.tokens.fetch_add(entry.total_tokens(), Ordering::Relaxed);
                parse(&response.content)
            }
        })
        .await
        .map_err(|e| StageFailure {
            stage,
            attempts: e.attempts(),
            message: e.into_inner().to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_and_build(
        &self,
        doc: &SourceDocument,
        cleaned: String,
        summary: String,
        molecules: Vec<ExtractedEntity>,
        topics: Vec<ExtractedEntity>,
        keywords: Vec<ExtractedEntity>,
        t0: Instant,
    ) -> VerifiedAnalysis {
        // verification reference is the untruncated source, never the model's cleaned text
        let source = SourceIndex::new(&doc.source_text());
        let mut meta = VerificationMetadata {
            min_word_overlap_fraction: self.verifier.config().min_word_overlap_fraction,
            ..Default::default()
        };

        let kept_molecules = self.verifier.verify(&molecules, &source);
        kept_molecules.record(EntityKind::Molecule, &mut meta);

        let kept_keywords = self.verifier.verify(&keywords, &source);
        kept_keywords.record(EntityKind::Keyword, &mut meta);

        let final_topics = if self.verifier.verifies(EntityKind::Topic) {
            let out = self.verifier.verify(&topics, &source);
            out.record(EntityKind::Topic, &mut meta);
            out.kept_texts()
        } else {
            let (unique, duplicates) = dedup(&topics);
            meta.duplicates_collapsed += duplicates;
            *meta.candidates.entry(EntityKind::Topic).or_default() += unique.len();
            unique.into_iter().map(|e| e.text).collect()
        };

        let title = doc.title.clone().unwrap_or_default();
        let abstract_text = doc.abstract_text.clone().unwrap_or_default();
        let elapsed = t0.elapsed().as_secs_f64();

        VerifiedAnalysis {
            id: doc.id.clone(),
            source_file: doc.file_name(),
            text_length: TextLengths {
                title: title.chars().count(),
                abstract_text: abstract_text.chars().count(),
                body: doc.body_chars(),
                cleaned: cleaned.chars().count(),
            },
            title,
            abstract_text,
            summary,
            molecules: kept_molecules.kept_texts(),
            keywords: kept_keywords.kept_texts(),
            topics: final_topics,
            verification: meta,
            model: self.backend.model_id().to_string(),
            processing_time_seconds: (elapsed * 100.0).round() / 100.0,
            created_at: Utc::now(),
        }
    }
}

fn checkpoint(cancel: &CancellationToken, next: StageName) -> Result<(), StageFailure> {
    if cancel.is_cancelled() {
        debug!(next_stage = %next, "abort requested, stopping before stage");
        return Err(StageFailure::cancelled(next));
    }
    Ok(())
}
