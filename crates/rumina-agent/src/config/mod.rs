//! Configuration loading for Rumina.
//! Reads rumina.toml from the current directory or the path in RUMINA_CONFIG.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rumina_ingestion::PipelineConfig;
use rumina_llm::backend::{BackendConfig, BackendKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "rumina.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub verification: VerificationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_input_directory")]
    pub input_directory: PathBuf,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget_per_minute: u64,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_max_document_attempts")]
    pub max_document_attempts: u32,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_io_retry_attempts")]
    pub io_retry_attempts: u32,
}

fn default_input_directory()       -> PathBuf { PathBuf::from("data/articles") }
fn default_output_directory()      -> PathBuf { PathBuf::from("data/analyses") }
fn default_max_concurrent()        -> usize   { 3 }
fn default_token_budget()          -> u64     { 450_000 }
fn default_checkpoint_every()      -> usize   { 100 }
fn default_max_document_attempts() -> u32     { 3 }
fn default_min_text_chars()        -> usize   { 500 }
fn default_max_input_chars()       -> usize   { 300_000 }
fn default_io_retry_attempts()     -> u32     { 2 }

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            input_directory: default_input_directory(),
            output_directory: default_output_directory(),
            max_concurrent: default_max_concurrent(),
            token_budget_per_minute: default_token_budget(),
            checkpoint_every: default_checkpoint_every(),
            max_document_attempts: default_max_document_attempts(),
            min_text_chars: default_min_text_chars(),
            max_input_chars: default_max_input_chars(),
            io_retry_attempts: default_io_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: BackendKind,
    #[serde(default = "default_model")]
    pub model: String,
    /// Falls back to the provider's environment variable when empty.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provider()             -> BackendKind { BackendKind::Anthropic }
fn default_model()                -> String      { "claude-sonnet-4-20250514".to_string() }
fn default_request_timeout_secs() -> u64         { 300 }

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
}

fn default_max_retry_attempts() -> u32 { 3 }
fn default_base_delay_secs()    -> f64 { 10.0 }
fn default_max_delay_secs()     -> f64 { 120.0 }

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_retry_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSection {
    #[serde(default = "default_min_word_overlap_fraction")]
    pub min_word_overlap_fraction: f64,
    #[serde(default = "default_min_word_len")]
    pub min_word_len: usize,
    #[serde(default)]
    pub verify_topics: bool,
}

fn default_min_word_overlap_fraction() -> f64   { 0.8 }
fn default_min_word_len()              -> usize { 3 }

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            min_word_overlap_fraction: default_min_word_overlap_fraction(),
            min_word_len: default_min_word_len(),
            verify_topics: false,
        }
    }
}


/// Environment variables consulted, in order, when no key is configured.
fn api_key_env_vars(kind: BackendKind) -> &'static [&'static str] {
    match kind {
        BackendKind::Anthropic        => &["RUMINA_ANTHROPIC_API_KEY", "CLAUDE_API_KEY"],
        BackendKind::OpenAi           => &["RUMINA_OPENAI_API_KEY"],
        BackendKind::OpenAiCompatible => &["RUMINA_OPENAI_API_KEY"],
        BackendKind::Ollama           => &[],
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Load configuration from rumina.toml.
    /// Checks RUMINA_CONFIG first, then the current directory. A missing
    /// default file means built-in defaults; a missing explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var_os("RUMINA_CONFIG").map(PathBuf::from);
        let (path, required) = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(p) => (p, true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !path.exists() {
            if required {
                anyhow::bail!(
                    "Config file not found: {}\n\
                     Copy rumina.example.toml to rumina.toml and edit it.",
                    path.display()
                );
            }
            tracing::debug!("no {} found, using defaults", DEFAULT_CONFIG_PATH);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let f = self.verification.min_word_overlap_fraction;
        if !(f > 0.0 && f <= 1.0) {
            anyhow::bail!("verification.min_word_overlap_fraction must be in (0, 1], got {f}");
        }
        if self.pipeline.max_concurrent == 0 {
            anyhow::bail!("pipeline.max_concurrent must be at least 1");
        }
        Ok(())
    }

    /// API key from the config file, else the provider's environment variables.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    fn resolve_api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        if let Some(key) = self.llm.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        api_key_env_vars(self.llm.provider)
            .iter()
            .find_map(|name| lookup(name).filter(|v| !v.is_empty()))
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            kind: self.llm.provider,
            model: self.llm.model.clone(),
            api_key: self.resolve_api_key(),
            base_url: self.llm.base_url.clone(),
            request_timeout: Duration::from_secs(self.llm.request_timeout_secs),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let p = &self.pipeline;
        PipelineConfig {
            input_directory: p.input_directory.clone(),
            output_directory: p.output_directory.clone(),
            max_concurrent: p.max_concurrent,
            token_budget_per_minute: p.token_budget_per_minute,
            min_word_overlap_fraction: self.verification.min_word_overlap_fraction,
            min_word_len: self.verification.min_word_len,
            verify_topics: self.verification.verify_topics,
            max_retry_attempts: self.retry.max_attempts,
            base_delay: secs(self.retry.base_delay_secs),
            max_delay: secs(self.retry.max_delay_secs),
            checkpoint_every: p.checkpoint_every,
            max_document_attempts: p.max_document_attempts,
            min_text_chars: p.min_text_chars,
            max_input_chars: p.max_input_chars,
            io_retry_attempts: p.io_retry_attempts,
        }
    }
}
