//! Scripted LLM backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rumina_common::StageName;
use rumina_llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};
use tokio::sync::Notify;

/// Failure a script can inject. Mirrors the retry-relevant `LlmError` variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedFailure {
    RateLimited(Option<Duration>),
    Timeout,
    Transient(String),
    Fatal(String),
}

impl ScriptedFailure {
    fn to_error(&self) -> LlmError {
        match self {
            ScriptedFailure::RateLimited(retry_after) => LlmError::RateLimited { retry_after: *retry_after },
            ScriptedFailure::Timeout                  => LlmError::Timeout,
            ScriptedFailure::Transient(m)             => LlmError::Transient(m.clone()),
            ScriptedFailure::Fatal(m)                 => LlmError::Fatal(m.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Reply(String),
    Fail(ScriptedFailure),
}

/// One scripted reaction, applied to calls of `stage` (optionally only those
/// whose prompt contains a needle). Unlimited unless `times` is set.
#[derive(Debug, Clone)]
pub struct ScriptRule {
    stage: StageName,
    needle: Option<String>,
    step: Step,
    remaining: Option<usize>,
}

impl ScriptRule {
    pub fn reply(stage: StageName, text: impl Into<String>) -> Self {
        Self { stage, needle: None, step: Step::Reply(text.into()), remaining: None }
    }

    pub fn fail(stage: StageName, failure: ScriptedFailure) -> Self {
        Self { stage, needle: None, step: Step::Fail(failure), remaining: None }
    }

    pub fn when_contains(mut self, needle: impl Into<String>) -> Self {
        self.needle = Some(needle.into());
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn applies(&self, stage: StageName, prompt: &str) -> bool {
        self.stage == stage
            && self.remaining != Some(0)
            && self.needle.as_deref().map_or(true, |n| prompt.contains(n))
    }
}

/// Parks calls for one stage until released.
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
    released: AtomicBool,
    hits: AtomicUsize,
}

impl Gate {
    /// Resolves once a call has reached the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    async fn pass(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let released = self.release.notified();
        self.entered.notify_one();
        if !self.released.load(Ordering::SeqCst) {
            released.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub stage: Option<StageName>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub at: tokio::time::Instant,
}

pub struct ScriptedBackend {
    model: String,
    responses: HashMap<StageName, String>,
    rules: Mutex<Vec<ScriptRule>>,
    gates: Mutex<HashMap<StageName, Arc<Gate>>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<(Duration, Duration)>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            model: "scripted-model".to_string(),
            responses: HashMap::new(),
            rules: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Default reply for every call of `stage` not matched by a rule.
    pub fn with_response(mut self, stage: StageName, text: impl Into<String>) -> Self {
        self.responses.insert(stage, text.into());
        self
    }

    pub fn with_rule(self, rule: ScriptRule) -> Self {
        self.push_rule(rule);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some((latency, latency));
        self
    }

    /// Uniformly random latency per call, to shuffle completion order.
    pub fn with_latency_range(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some((min, max.max(min)));
        self
    }

    pub fn push_rule(&self, rule: ScriptRule) {
        self.rules.lock().unwrap().push(rule);
    }

    /// Gate for `stage`; created on first use.
    pub fn gate(&self, stage: StageName) -> Arc<Gate> {
        self.gates.lock().unwrap().entry(stage).or_default().clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, stage: StageName) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.stage == Some(stage)).count()
    }

    /// Calls of `stage` whose prompt contains `needle`.
    pub fn calls_matching(&self, stage: StageName, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stage == Some(stage) && c.prompt.contains(needle))
            .count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, stage: StageName, prompt: &str) -> Step {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.applies(stage, prompt)) {
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return rule.step.clone();
        }
        drop(rules);

        let text = match self.responses.get(&stage) {
            Some(text) => text.clone(),
            None => default_reply(stage, prompt),
        };
        Step::Reply(text)
    }

    fn pick_latency(&self) -> Option<Duration> {
        let (min, max) = self.latency?;
        if min == max {
            return Some(min);
        }
        let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Some(Duration::from_millis(ms))
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn default_reply(stage: StageName, prompt: &str) -> String {
    match stage {
        // echo the article back as its own cleaned version
        StageName::Clean => prompt
            .rsplit_once("Article text:\n")
            .map(|(_, text)| text.to_string())
            .unwrap_or_else(|| prompt.to_string()),
        StageName::Summary   => "The article reports the measured outcomes of the trial.".to_string(),
        StageName::Molecules => "[]".to_string(),
        StageName::Topics    => r#"{"topics": [], "keywords": []}"#.to_string(),
    }
}

/// Decrements the in-flight counter even when the calling task is aborted.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let stage: Option<StageName> = req.label.as_deref().and_then(|l| l.parse().ok());
        let prompt = req.user_prompt().to_string();

        self.calls.lock().unwrap().push(RecordedCall {
            stage,
            prompt: prompt.clone(),
            max_tokens: req.max_tokens,
            at: tokio::time::Instant::now(),
        });

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let Some(stage) = stage else {
            return Err(LlmError::Fatal("request carries no stage label".to_string()));
        };

        let gate = self.gates.lock().unwrap().get(&stage).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if let Some(latency) = self.pick_latency() {
            tokio::time::sleep(latency).await;
        }

        match self.next_step(stage, &prompt) {
            Step::Reply(content) => Ok(LlmResponse {
                prompt_tokens: (prompt.len() / 4) as u32,
                completion_tokens: (content.len() / 4) as u32,
                content,
                model: self.model.clone(),
            }),
            Step::Fail(failure) => Err(failure.to_error()),
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn is_local(&self) -> bool {
        true
    }

    fn max_output_tokens(&self) -> usize {
        8192
    }
}
