//! Audit record for every provider call made by the pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::backend::LlmResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAuditEntry {
    pub id: Uuid,
    pub document_id: String,
    pub stage: String,
    pub attempt: u32,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub output_hash: String,
    pub latency_ms: u64,
    pub called_at: chrono::DateTime<Utc>,
}

impl LlmAuditEntry {
    pub fn from_response(
        document_id: &str,
        stage: &str,
        attempt: u32,
        response: &LlmResponse,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            stage: stage.to_string(),
            attempt,
            model: response.model.clone(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            output_hash: output_hash(&response.content),
            latency_ms,
            called_at: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens as u64 + self.completion_tokens as u64
    }

    /// Emit the entry on the `rumina::audit` target.
    pub fn log(&self) {
        tracing::debug!(
            target: "rumina::audit",
            doc_id = %self.document_id,
            stage = %self.stage,
            attempt = self.attempt,
            model = %self.model,
            prompt_tokens = self.prompt_tokens,
            completion_tokens = self.completion_tokens,
            output_hash = %self.output_hash,
            latency_ms = self.latency_ms,
            "LLM call"
        );
    }
}

/// Hex SHA-256 of a completion, so outputs can be correlated without storing them.
pub fn output_hash(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    format!("{:x}", hasher.finalize())
}
