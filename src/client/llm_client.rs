//! HTTP backend for OpenAI-compatible endpoints.
//!
//! Speaks `POST {base_url}/chat/completions` with `n` choices per request.
//! Works against vLLM, SGLang, TGI, Ollama and hosted aggregators.

use crate::client::{Choice, CompletionBackend, CompletionRequest, CompletionResponse, TokenUsage};
use crate::models::{BackendError, Endpoint, EvalError, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    n: usize,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    // Some servers send null content for empty generations
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// HTTP client shared by every endpoint in the pool.
///
/// One connection pool serves all endpoints; per-endpoint auth and headers
/// are applied on each request.
pub struct LLMClient {
    client: reqwest::Client,
    /// Request timeout
    timeout: Duration,
}

impl LLMClient {
    /// Create a new client with the given per-request timeout.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvalError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, timeout })
    }

    /// Build headers for a request to `endpoint`.
    fn headers(endpoint: &Endpoint) -> std::result::Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();

        if let Some(ref api_key) = endpoint.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
                BackendError::InvalidRequest {
                    endpoint: endpoint.name.clone(),
                    status: 0,
                    message: "API key is not a valid header value".to_string(),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (key, value) in &endpoint.headers {
            match (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(val)) => {
                    headers.insert(name, val);
                }
                _ => warn!(endpoint = %endpoint.name, header = %key, "Skipping invalid header"),
            }
        }

        Ok(headers)
    }

    fn transport_error(&self, endpoint: &Endpoint, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout {
                endpoint: endpoint.name.clone(),
                timeout: self.timeout,
            }
        } else {
            BackendError::Network {
                endpoint: endpoint.name.clone(),
                source: e,
            }
        }
    }

    /// Health check: ping the /models endpoint.
    pub async fn health_check(&self, endpoint: &Endpoint) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/models", endpoint.base_url);

        let headers = match Self::headers(endpoint) {
            Ok(h) => h,
            Err(e) => {
                return HealthCheckResult {
                    endpoint: endpoint.name.clone(),
                    status: HealthStatus::Unhealthy,
                    latency_ms: None,
                    error: Some(e.to_string()),
                };
            }
        };

        match self
            .client
            .get(&url)
            .headers(headers)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    HealthCheckResult {
                        endpoint: endpoint.name.clone(),
                        status: HealthStatus::Healthy,
                        latency_ms: Some(latency_ms),
                        error: None,
                    }
                } else {
                    HealthCheckResult {
                        endpoint: endpoint.name.clone(),
                        status: HealthStatus::Unhealthy,
                        latency_ms: Some(latency_ms),
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: endpoint.name.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl CompletionBackend for LLMClient {
    async fn complete(
        &self,
        endpoint: &Endpoint,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, BackendError> {
        let start = Instant::now();
        let url = format!("{}/chat/completions", endpoint.base_url);
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: vec![Message::user(request.prompt.as_str())],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            n: request.n,
        };

        let response = self
            .client
            .post(&url)
            .headers(Self::headers(endpoint)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        let status = response.status().as_u16();

        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .map(|api_error| api_error.error.message)
                .unwrap_or(error_body);
            return Err(BackendError::from_status(&endpoint.name, status, message));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        let body: ChatCompletionResponse =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::MalformedResponse {
                endpoint: endpoint.name.clone(),
                message: format!("Failed to parse response: {e}"),
            })?;

        if body.choices.len() != request.n {
            return Err(BackendError::MalformedResponse {
                endpoint: endpoint.name.clone(),
                message: format!(
                    "expected {} choices, got {}",
                    request.n,
                    body.choices.len()
                ),
            });
        }

        debug!(
            endpoint = %endpoint.name,
            choices = body.choices.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );

        Ok(CompletionResponse {
            choices: body
                .choices
                .into_iter()
                .map(|c| Choice {
                    text: c.message.content.unwrap_or_default(),
                })
                .collect(),
            model: body.model.unwrap_or_else(|| request.model.clone()),
            usage: body.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Endpoint name
    pub endpoint: String,
    /// Health status
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Endpoint is responding normally
    Healthy,
    /// Endpoint is responding but with errors
    Unhealthy,
    /// Endpoint is not reachable
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}
