//! Retry/backoff controller for provider calls (and bounded IO retries).
//!
//! Each attempt is reduced to a `CallOutcome`; the policy decides what to do
//! from the outcome alone. Backoff is exponential with jitter, except when
//! the provider told us how long to wait.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable { retry_after: Option<Duration> },
    Fatal,
}

/// Errors that know their own retry class.
pub trait Retryable {
    fn classify(&self) -> ErrorClass;
}

/// Result of a single attempt, classified.
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    Success(T),
    RetryableFailure { error: E, retry_after: Option<Duration> },
    FatalFailure(E),
}

impl<T, E> CallOutcome<T, E> {
    pub fn from_result(result: Result<T, E>, classify: impl Fn(&E) -> ErrorClass) -> Self {
        match result {
            Ok(v) => CallOutcome::Success(v),
            Err(e) => match classify(&e) {
                ErrorClass::Retryable { retry_after } => CallOutcome::RetryableFailure { error: e, retry_after },
                ErrorClass::Fatal => CallOutcome::FatalFailure(e),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a provider-suggested delay.
    pub max_retry_after: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(120),
            max_retry_after: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, ..Default::default() }
    }

    /// Short policy for local IO (document reads, artifact writes).
    pub fn io(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Deterministic part of the delay after the `attempt`-th failure (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay to wait before the next attempt.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_retry_after);
        }
        let backoff = self.backoff_delay(attempt);
        if !self.jitter {
            return backoff;
        }
        let half_ms = (backoff.as_millis() / 2) as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=half_ms);
        backoff + Duration::from_millis(jitter_ms)
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error stopped the loop.
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Fatal { error, .. } => write!(f, "non-retryable failure: {error}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `op` under `policy`, classifying errors through [`Retryable`].
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_if(policy, label, |e: &E| e.classify(), op).await
}

/// Run `op` under `policy` with an explicit classifier. `op` receives the
/// 1-based attempt number.
pub async fn with_retry_if<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    label: &str,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    C: Fn(&E) -> ErrorClass,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match CallOutcome::from_result(op(attempt).await, &classify) {
            CallOutcome::Success(v) => {
                if attempt > 1 {
                    debug!(label, attempt, "succeeded after retry");
                }
                return Ok(v);
            }
            CallOutcome::FatalFailure(error) => {
                warn!(label, attempt, error = %error, "non-retryable failure");
                return Err(RetryError::Fatal { attempt, error });
            }
            CallOutcome::RetryableFailure { error, retry_after } => {
                if attempt >= max_attempts {
                    warn!(label, attempt, error = %error, "retry budget exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: error });
                }
                let delay = policy.delay_for(attempt, retry_after);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    provider_hint = retry_after.is_some(),
                    error = %error,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(1)).without_jitter()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_delay: Duration::from_secs(30),
            ..fast_policy(10)
        };
        assert_eq!(p.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(p.backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half_delay() {
        let p = RetryPolicy::new(5, Duration::from_millis(1000));
        for _ in 0..100 {
            let d = p.delay_for(2, None);
            assert!(d >= Duration::from_millis(2000));
            assert!(d <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let p = fast_policy(3);
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(42))), Duration::from_secs(42));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(9999))), p.max_retry_after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let t0 = Instant::now();
        let out = with_retry(&fast_policy(3), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 { Err(LlmError::Timeout) } else { Ok("done") }
            }
        })
        .await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(t0.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast_policy(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Fatal("invalid x-api-key".into())) }
        })
        .await;
        let err = out.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast_policy(4), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Transient("connection reset".into())) }
        })
        .await;
        let err = out.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("gave up after 4 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honours_provider_delay() {
        let t0 = Instant::now();
        let out = with_retry(&fast_policy(2), "test", |attempt| async move {
            if attempt == 1 {
                Err(LlmError::RateLimited { retry_after: Some(Duration::from_secs(17)) })
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_secs(17));
        assert!(waited < Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let out: Result<(), RetryError<std::io::Error>> = with_retry_if(
            &fast_policy(2),
            "io",
            |e: &std::io::Error| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Retryable { retry_after: None }
                }
            },
            |_| async { Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")) },
        )
        .await;
        assert_eq!(out.unwrap_err().attempts(), 1);
    }
}
