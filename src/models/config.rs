//! Configuration models for evalpool.
//!
//! Every tunable of a run lives here and is loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Upper bound accepted for any retry wait (one day).
pub const MAX_DELAY_SECS: f64 = 86_400.0;

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid"));

/// Top-level configuration for evalpool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inference endpoints, in round-robin order
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// HTTP client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Retry policy for backend calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Request parameters sent to every endpoint
    pub generation: GenerationConfig,

    /// Concurrency settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Scoring settings
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// Configuration for one OpenAI-compatible endpoint.
///
/// Works for vLLM, SGLang, TGI, Ollama or any hosted aggregator that speaks
/// the chat completions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name used in logs and usage stats
    pub name: String,

    /// Base URL for the API (e.g., "http://localhost:8000/v1")
    pub base_url: String,

    /// API key (optional, can be omitted for local endpoints)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom headers to include in requests
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    1800
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
        }
    }
}

/// Retry configuration.
///
/// The wait before retry `k` is `min(max_delay, base_delay * 2^(k-1))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait before the first retry, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    /// Upper bound on any single wait, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    /// Pick a fresh endpoint from the pool on every attempt
    #[serde(default)]
    pub rotate_endpoints: bool,
}

fn default_max_attempts() -> u32 {
    20
}

fn default_base_delay() -> f64 {
    5.0
}

fn default_max_delay() -> f64 {
    90.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            rotate_endpoints: false,
        }
    }
}

impl RetryConfig {
    /// Saturates at `Duration::MAX` and clamps negative or NaN values to zero;
    /// `Config::validate` rejects both before a run.
    pub fn base_delay(&self) -> Duration {
        saturating_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        saturating_secs(self.max_delay_secs)
    }
}

fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Generation request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Model name as served by the endpoints
    pub model: String,

    /// Maximum completion tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Completions per prompt when a sample does not set `n`
    #[serde(default = "default_samples_per_prompt")]
    pub samples_per_prompt: usize,
}

fn default_max_tokens() -> u32 {
    40960 - 1024
}

fn default_temperature() -> f64 {
    1.0
}

fn default_samples_per_prompt() -> usize {
    4
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of samples evaluated at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    2048
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Which scoring policy to apply to each response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPolicy {
    /// Require the end-of-reasoning delimiter, grade the text after it
    #[default]
    StrictReasoning,
    /// Grade the full response
    NoReasoning,
}

/// Scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub policy: ScoringPolicy,

    /// End-of-reasoning delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    "</think>".to_string()
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            policy: ScoringPolicy::default(),
            delimiter: default_delimiter(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Results file path (JSONL)
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("results.jsonl")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

/// A resolved endpoint, ready to be placed in a pool.
///
/// Secrets and headers are expanded; nothing here changes after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Endpoint {
    /// Endpoint without credentials or extra headers.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::EmptyEndpointPool);
        }

        let mut names: Vec<&str> = self.endpoints.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.name",
                reason: format!("duplicate endpoint name '{}'", dup[0]),
            });
        }

        if let Some(ep) = self.endpoints.iter().find(|e| e.base_url.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.base_url",
                reason: format!("endpoint '{}' has an empty base_url", ep.name),
            });
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.client.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "client.timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.retry.base_delay_secs > 0.0 && self.retry.base_delay_secs <= MAX_DELAY_SECS) {
            return Err(ConfigError::InvalidValue {
                field: "retry.base_delay_secs",
                reason: format!("must be positive and at most {MAX_DELAY_SECS} seconds"),
            });
        }
        if !(self.retry.max_delay_secs >= self.retry.base_delay_secs
            && self.retry.max_delay_secs <= MAX_DELAY_SECS)
        {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_delay_secs",
                reason: format!("must be between base_delay_secs and {MAX_DELAY_SECS} seconds"),
            });
        }
        if self.generation.samples_per_prompt == 0 {
            return Err(ConfigError::InvalidValue {
                field: "generation.samples_per_prompt",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scoring.delimiter.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "scoring.delimiter",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve API keys and headers for every configured endpoint.
    pub fn resolve_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.endpoints
            .iter()
            .map(|ep| {
                Ok(Endpoint {
                    name: ep.name.clone(),
                    base_url: ep.base_url.trim_end_matches('/').to_string(),
                    api_key: resolve_api_key(ep)?,
                    headers: expand_headers(&ep.headers),
                })
            })
            .collect()
    }
}

/// Resolve the API key for one endpoint.
///
/// An explicit `api_key` wins over `api_key_env`; neither is valid for local
/// endpoints without auth.
fn resolve_api_key(endpoint: &EndpointConfig) -> Result<Option<String>, ConfigError> {
    if let Some(key) = &endpoint.api_key {
        return Ok(Some(expand_env_vars(key)));
    }

    match &endpoint.api_key_env {
        Some(env_var) => std::env::var(env_var)
            .map(Some)
            .map_err(|_| ConfigError::MissingApiKey {
                endpoint: endpoint.name.clone(),
                env_var: env_var.clone(),
            }),
        None => Ok(None),
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    ENV_VAR_RE
        .replace_all(s, |cap: &regex::Captures<'_>| {
            std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
        })
        .into_owned()
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Endpoint pool is empty: configure at least one [[endpoints]] entry")]
    EmptyEndpointPool,

    #[error(
        "Missing API key for endpoint '{endpoint}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { endpoint: String, env_var: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
