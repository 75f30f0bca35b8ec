//! Backend abstraction: one logical "complete this prompt n times" call.

use crate::models::{BackendError, Endpoint, GenerationConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Request for `n` independent completions of one prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub n: usize,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(generation: &GenerationConfig, prompt: impl Into<String>, n: usize) -> Self {
        Self {
            model: generation.model.clone(),
            prompt: prompt.into(),
            n,
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
        }
    }
}

/// One completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub text: String,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Typed response holding exactly `n` choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<Choice>,
    /// Model reported by the backend (may differ from requested)
    pub model: String,
    pub usage: Option<TokenUsage>,
}

impl CompletionResponse {
    /// Response texts in choice order.
    pub fn texts(&self) -> Vec<String> {
        self.choices.iter().map(|c| c.text.clone()).collect()
    }

    pub fn into_texts(self) -> Vec<String> {
        self.choices.into_iter().map(|c| c.text).collect()
    }
}

/// Anything that can serve completion requests for a given endpoint.
///
/// Implementations perform exactly one attempt; retrying is the caller's job.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        endpoint: &Endpoint,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, BackendError>;
}
