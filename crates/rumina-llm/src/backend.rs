//! LLM backend trait and concrete implementations.
//!
//! Backends:
//!   AnthropicBackend        — Anthropic Messages API (claude-*)
//!   OpenAiCompatibleBackend — OpenAI or any OpenAI-compatible endpoint
//!                             (LMStudio, TogetherAI, Groq, OpenRouter, vLLM, …)
//!   OllamaBackend           — local Ollama (OpenAI-compatible route)
//!
//! Every backend maps provider failures onto the same small taxonomy so the
//! retry controller can classify them without knowing the provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{ErrorClass, Retryable};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Rate limit exceeded (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Provider request timed out")]
    Timeout,
    #[error("Transient provider error: {0}")]
    Transient(String),
    #[error("Provider rejected request: {0}")]
    Fatal(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable { .. })
    }
}

impl Retryable for LlmError {
    fn classify(&self) -> ErrorClass {
        match self {
            LlmError::RateLimited { retry_after } => ErrorClass::Retryable { retry_after: *retry_after },
            LlmError::Timeout | LlmError::Transient(_) => ErrorClass::Retryable { retry_after: None },
            // A builder error is a malformed request; everything else on the wire is worth another try.
            LlmError::Http(e) if e.is_builder() => ErrorClass::Fatal,
            LlmError::Http(_) => ErrorClass::Retryable { retry_after: None },
            // Garbled response body from the provider.
            LlmError::Serde(_) => ErrorClass::Retryable { retry_after: None },
            LlmError::Fatal(_) => ErrorClass::Fatal,
        }
    }
}

// ── Request / Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,   // "system" | "user" | "assistant"
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Caller-side tag (pipeline stage); never sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl LlmRequest {
    /// Single user-turn prompt, the shape every extraction stage uses.
    pub fn prompt(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            messages: vec![Message { role: "user".to_string(), content: prompt.into() }],
            model: None,
            max_tokens: Some(max_tokens),
            temperature: None,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn user_prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.messages.insert(0, Message { role: "system".to_string(), content: system.into() });
        self
    }

    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError>;
    fn model_id(&self) -> &str;
    fn is_local(&self) -> bool;
    fn max_output_tokens(&self) -> usize;
}

// ── HTTP helpers ──────────────────────────────────────────────────────────────

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("rumina/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Parse `retry-after` (seconds) or `retry-after-ms` headers.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_millis(ms));
    }
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0 && *secs < 86_400.0)
        .map(Duration::from_secs_f64)
}

/// Map an HTTP status + provider message onto the error taxonomy.
pub fn classify_status(status: u16, message: String, retry_after: Option<Duration>) -> LlmError {
    match status {
        429 => LlmError::RateLimited { retry_after },
        408 | 504 => LlmError::Timeout,
        // 529 is Anthropic's "overloaded".
        500..=599 => LlmError::Transient(format!("[{status}] {message}")),
        _ => LlmError::Fatal(format!("[{status}] {message}")),
    }
}

fn map_send_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() { LlmError::Timeout } else { LlmError::Http(e) }
}

async fn check_response_status(resp: reqwest::Response) -> Result<serde_json::Value, LlmError> {
    let status = resp.status().as_u16();
    let retry_after = parse_retry_after(resp.headers());
    let text = resp.text().await.map_err(map_send_error)?;

    if status >= 400 {
        let body: serde_json::Value = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
        let msg = body["error"]["message"]
            .as_str()
            .or_else(|| body["message"].as_str())
            .unwrap_or("unknown API error")
            .to_string();
        return Err(classify_status(status, msg, retry_after));
    }
    Ok(serde_json::from_str(&text)?)
}

fn parse_openai_response(json: &serde_json::Value, fallback_model: &str) -> Result<LlmResponse, LlmError> {
    let choice = &json["choices"][0];
    if choice["finish_reason"].as_str() == Some("content_filter") {
        return Err(LlmError::Fatal("completion blocked by content filter".to_string()));
    }
    let content = choice["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::Transient("response carried no message content".to_string()))?;
    Ok(LlmResponse {
        content: content.to_string(),
        model: json["model"].as_str().unwrap_or(fallback_model).to_string(),
        prompt_tokens:     json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

// ── 1. Anthropic (claude-*) ───────────────────────────────────────────────────

pub struct AnthropicBackend {
    pub model: String,
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://api.anthropic.com".to_string(),
            client: http_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        // Messages API takes the system prompt out of band
        let system = req.messages.iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let messages: Vec<serde_json::Value> = req.messages.iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let model = req.model.as_deref().unwrap_or(&self.model);
        let mut body = serde_json::json!({
            "model":      model,
            "messages":   messages,
            "max_tokens": req.max_tokens.unwrap_or(4096),
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.to_string());
        }
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let resp = self.client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let json = check_response_status(resp).await?;

        if json["stop_reason"].as_str() == Some("refusal") {
            return Err(LlmError::Fatal("model refused the request".to_string()));
        }

        let content: String = json["content"]
            .as_array()
            .map(|blocks| {
                blocks.iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            model: json["model"].as_str().unwrap_or(model).to_string(),
            prompt_tokens:     json["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    fn model_id(&self) -> &str { &self.model }
    fn is_local(&self) -> bool { false }
    fn max_output_tokens(&self) -> usize { 8_192 }
}

// ── 2. OpenAI / OpenAI-compatible ─────────────────────────────────────────────

pub struct OpenAiCompatibleBackend {
    pub base_url: String,
    pub model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: http_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// api.openai.com with a bearer key.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new("https://api.openai.com", model, Some(api_key.into()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(k) => req.bearer_auth(k),
            None    => req,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model":       req.model.as_deref().unwrap_or(&self.model),
            "messages":    req.messages,
            "max_tokens":  req.max_tokens.unwrap_or(4096),
            "temperature": req.temperature.unwrap_or(0.1),
        });
        let resp = self.auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;
        let json = check_response_status(resp).await?;
        parse_openai_response(&json, &self.model)
    }

    fn model_id(&self) -> &str { &self.model }
    fn is_local(&self) -> bool { false }
    fn max_output_tokens(&self) -> usize { 16_384 }
}

// ── 3. Ollama (local) ─────────────────────────────────────────────────────────

pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client: http_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Local models on modest hardware can take minutes per stage.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = http_client(timeout);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model":       req.model.as_deref().unwrap_or(&self.model),
            "messages":    req.messages,
            "max_tokens":  req.max_tokens.unwrap_or(4096),
            "temperature": req.temperature.unwrap_or(0.1),
        });
        let resp = self.client.post(&url).json(&body).send().await.map_err(map_send_error)?;
        let json = check_response_status(resp).await?;
        parse_openai_response(&json, &self.model)
    }

    fn model_id(&self) -> &str { &self.model }
    fn is_local(&self) -> bool { true }
    fn max_output_tokens(&self) -> usize { 8_192 }
}

// ── Construction from config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    Ollama,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

/// Build the configured provider. Remote providers without a key are a
/// configuration error, reported as fatal.
pub fn build_backend(cfg: &BackendConfig) -> Result<Arc<dyn LlmBackend>, LlmError> {
    let key = cfg.api_key.clone().filter(|k| !k.is_empty());
    let backend: Arc<dyn LlmBackend> = match cfg.kind {
        BackendKind::Anthropic => {
            let key = key.ok_or_else(|| LlmError::Fatal("Anthropic API key missing".to_string()))?;
            let mut b = AnthropicBackend::new(key, &cfg.model).with_timeout(cfg.request_timeout);
            if let Some(url) = &cfg.base_url {
                b = b.with_base_url(url);
            }
            Arc::new(b)
        }
        BackendKind::OpenAi => {
            let key = key.ok_or_else(|| LlmError::Fatal("OpenAI API key missing".to_string()))?;
            Arc::new(OpenAiCompatibleBackend::openai(key, &cfg.model).with_timeout(cfg.request_timeout))
        }
        BackendKind::OpenAiCompatible => {
            let url = cfg.base_url.clone()
                .ok_or_else(|| LlmError::Fatal("base_url required for openai_compatible".to_string()))?;
            Arc::new(OpenAiCompatibleBackend::new(url, &cfg.model, key).with_timeout(cfg.request_timeout))
        }
        BackendKind::Ollama => {
            let url = cfg.base_url.clone().unwrap_or_else(|| "http://localhost:11434".to_string());
            Arc::new(OllamaBackend::new(url, &cfg.model).with_timeout(cfg.request_timeout))
        }
    };
    Ok(backend)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
