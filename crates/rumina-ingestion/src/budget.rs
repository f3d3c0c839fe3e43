//! Rolling token budget for document admission.
//!
//! A sliding-window log of `(admitted_at, tokens)` under a single mutex.
//! Every admission is one check-and-consume, so two callers can never both
//! see the same headroom. A request larger than the whole budget is admitted
//! only into an empty window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rumina_common::SourceDocument;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::prompts;

/// Stages whose prompt carries the full (cleaned) article text.
const TEXT_READING_STAGES: u64 = 4;

/// Admissions kept for inspection after they leave the window.
const HISTORY_LEN: usize = 1024;

/// Rough token cost of pushing one document through every stage.
pub fn estimate_tokens(doc: &SourceDocument, max_input_chars: usize) -> u64 {
    let chars = doc.full_text().chars().count().min(max_input_chars) as u64;
    (chars / 4) * TEXT_READING_STAGES + prompts::total_output_ceiling()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub at: Instant,
    pub tokens: u64,
}

#[derive(Debug, Default)]
struct Window {
    live: VecDeque<Admission>,
    history: VecDeque<Admission>,
}

#[derive(Debug)]
pub struct TokenBudget {
    /// Tokens allowed per window; 0 disables the budget.
    capacity: u64,
    window: Duration,
    state: Mutex<Window>,
}

impl TokenBudget {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self { capacity, window, state: Mutex::new(Window::default()) }
    }

    pub fn per_minute(capacity: u64) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // the window is plain data; a poisoned lock still holds a usable log
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit `tokens` now if the window allows it; otherwise return the
    /// instant at which enough budget will have expired.
    pub fn try_consume(&self, tokens: u64) -> Result<(), Instant> {
        let now = Instant::now();
        let mut w = self.lock();

        while let Some(front) = w.live.front() {
            if front.at + self.window <= now {
                w.live.pop_front();
            } else {
                break;
            }
        }

        let used: u64 = w.live.iter().map(|a| a.tokens).sum();
        if self.capacity == 0 || w.live.is_empty() || used + tokens <= self.capacity {
            let admission = Admission { at: now, tokens };
            w.live.push_back(admission);
            if w.history.len() == HISTORY_LEN {
                w.history.pop_front();
            }
            w.history.push_back(admission);
            return Ok(());
        }

        // earliest instant at which expiring entries leave enough headroom
        let mut remaining = used;
        for a in &w.live {
            remaining -= a.tokens;
            if remaining + tokens <= self.capacity {
                return Err(a.at + self.window);
            }
        }
        // oversized request: wait for the window to drain completely
        let last = w.live.back().map(|a| a.at).unwrap_or(now);
        Err(last + self.window)
    }

    /// Suspend until `tokens` can be admitted.
    pub async fn acquire(&self, tokens: u64) {
        loop {
            match self.try_consume(tokens) {
                Ok(()) => return,
                Err(at) => {
                    debug!(tokens, wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64, "token budget exhausted, waiting");
                    tokio::time::sleep_until(at).await;
                }
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up when `cancel` fires.
    /// Returns `false` if nothing was consumed.
    pub async fn acquire_or_cancel(&self, tokens: u64, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.acquire(tokens) => true,
        }
    }

    /// Tokens admitted within the current window.
    pub fn in_window(&self) -> u64 {
        let now = Instant::now();
        self.lock()
            .live
            .iter()
            .filter(|a| a.at + self.window > now)
            .map(|a| a.tokens)
            .sum()
    }

    /// The most recent admissions, oldest first.
    pub fn admissions(&self) -> Vec<Admission> {
        self.lock().history.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sum of admissions inside the window ending at each admission never
    /// exceeds capacity, unless that admission was alone in the window.
    fn assert_respected(budget: &TokenBudget) {
        let log = budget.admissions();
        for (i, a) in log.iter().enumerate() {
            let in_window: Vec<&Admission> = log[..=i]
                .iter()
                .filter(|b| b.at + budget.window() > a.at)
                .collect();
            let sum: u64 = in_window.iter().map(|b| b.tokens).sum();
            assert!(
                sum <= budget.capacity() || in_window.len() == 1,
                "window ending at admission {i} holds {sum} tokens"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_until_full_then_waits_for_expiry() {
        let budget = TokenBudget::per_minute(1000);
        let t0 = Instant::now();
        budget.acquire(400).await;
        budget.acquire(400).await;
        assert_eq!(t0.elapsed(), Duration::ZERO);

        budget.acquire(400).await;
        assert_eq!(t0.elapsed(), Duration::from_secs(60));
        assert_respected(&budget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_needs_empty_window() {
        let budget = TokenBudget::per_minute(1000);
        budget.acquire(100).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let t = Instant::now();
        budget.acquire(5000).await;
        // first admission expires 50s later
        assert_eq!(t.elapsed(), Duration::from_secs(50));

        // and blocks everything else for a full window
        assert!(budget.try_consume(1).is_err());
        assert_respected(&budget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_respect_budget() {
        let budget = std::sync::Arc::new(TokenBudget::per_minute(1000));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let b = budget.clone();
            handles.push(tokio::spawn(async move { b.acquire(300).await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(budget.admissions().len(), 10);
        assert_respected(&budget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let budget = TokenBudget::per_minute(100);
        budget.acquire(100).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!budget.acquire_or_cancel(50, &cancel).await);
        assert_eq!(budget.admissions().len(), 1);
    }

    #[test]
    fn test_unlimited_never_blocks() {
        let budget = TokenBudget::unlimited();
        for _ in 0..100 {
            assert!(budget.try_consume(1_000_000).is_ok());
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let budget = TokenBudget::unlimited();
        for i in 0..(HISTORY_LEN as u64 + 10) {
            budget.try_consume(i).unwrap();
        }
        let log = budget.admissions();
        assert_eq!(log.len(), HISTORY_LEN);
        assert_eq!(log[0].tokens, 10);
    }

    #[test]
    fn test_estimate_tokens() {
        let doc = SourceDocument::from_text("1", "a".repeat(4000));
        assert_eq!(estimate_tokens(&doc, 300_000), 4000 + prompts::total_output_ceiling());
        // capped by the truncation limit
        assert_eq!(estimate_tokens(&doc, 400), 400 + prompts::total_output_ceiling());
    }
}
