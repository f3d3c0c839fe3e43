//! rumina-llm — LLM provider abstraction and the retry/backoff controller.
//! Providers sit behind the `LlmBackend` trait; `retry` turns their failures
//! into explicit outcomes and decides when to try again.

pub mod backend;
pub mod retry;
pub mod audit;

pub use backend::{LlmBackend, LlmError, LlmRequest, LlmResponse};
pub use retry::{with_retry, with_retry_if, CallOutcome, ErrorClass, RetryError, RetryPolicy, Retryable};
