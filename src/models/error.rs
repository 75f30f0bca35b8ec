//! Error types for evalpool.
//!
//! Taxonomy:
//! - Configuration: bad or missing settings, fatal at startup
//! - Backend: one failed call to an inference endpoint, transient or fatal
//! - Terminal per-task: fatal backend error or retries exhausted
//! - Infrastructure: IO, parsing, internal invariants

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for evalpool.
#[derive(Debug, Error)]
pub enum EvalError {
    // ═══════════════════════════════════════════════════════════════════
    // STARTUP: the run cannot begin
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    // ═══════════════════════════════════════════════════════════════════
    // PER-TASK: recorded against a single sample; the batch continues
    // ═══════════════════════════════════════════════════════════════════
    #[error("Fatal backend error: {0}")]
    FatalBackend(#[source] BackendError),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: BackendError,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════════════════════════════
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single call to an inference backend.
///
/// Every variant is either transient (worth another attempt) or fatal
/// (cannot succeed on retry). See [`BackendError::is_transient`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Network error on {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("Rate limited by {endpoint}")]
    RateLimited { endpoint: String },

    #[error("Server error from {endpoint} (status {status}): {message}")]
    Server {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Malformed response from {endpoint}: {message}")]
    MalformedResponse { endpoint: String, message: String },

    #[error("Authentication failed for {endpoint} (status {status})")]
    AuthenticationFailed { endpoint: String, status: u16 },

    #[error("Invalid request to {endpoint} (status {status}): {message}")]
    InvalidRequest {
        endpoint: String,
        status: u16,
        message: String,
    },
}

/// Retry classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl BackendError {
    /// Classify this failure for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::MalformedResponse { .. } => ErrorClass::Transient,
            Self::AuthenticationFailed { .. } | Self::InvalidRequest { .. } => ErrorClass::Fatal,
        }
    }

    /// Check if another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Name of the endpoint that produced the failure.
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Network { endpoint, .. }
            | Self::Timeout { endpoint, .. }
            | Self::RateLimited { endpoint }
            | Self::Server { endpoint, .. }
            | Self::MalformedResponse { endpoint, .. }
            | Self::AuthenticationFailed { endpoint, .. }
            | Self::InvalidRequest { endpoint, .. } => endpoint,
        }
    }

    /// Map an HTTP error status to a backend error.
    ///
    /// 429 and 5xx are transient; 401/403 and remaining 4xx are fatal.
    pub fn from_status(endpoint: &str, status: u16, message: String) -> Self {
        let endpoint = endpoint.to_string();
        match status {
            429 => Self::RateLimited { endpoint },
            401 | 403 => Self::AuthenticationFailed { endpoint, status },
            400..=499 => Self::InvalidRequest {
                endpoint,
                status,
                message,
            },
            _ => Self::Server {
                endpoint,
                status,
                message,
            },
        }
    }
}

impl EvalError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The backend failure behind a terminal task error, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::FatalBackend(e) | Self::RetryExhausted { last_error: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for evalpool.
pub type Result<T> = std::result::Result<T, EvalError>;
