//! rumina-test-utils — test doubles and fixtures shared by the workspace tests.
//!
//! `ScriptedBackend` stands in for a real provider: per-stage canned replies,
//! scripted failures keyed on prompt content, a call log, and gates that park
//! a call mid-stage so tests can simulate a crash.

pub mod fixtures;
pub mod scripted;

pub use fixtures::{article_body, sample_analysis, write_jats_article, write_text_articles};
pub use scripted::{Gate, RecordedCall, ScriptRule, ScriptedBackend, ScriptedFailure};
