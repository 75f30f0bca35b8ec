//! Per-endpoint call accounting.
//!
//! Every attempt made by the retrying client lands here, keyed by endpoint
//! name, so the final report can show how load and failures were spread
//! across the pool.

use crate::client::CompletionResponse;
use crate::models::{BackendError, EndpointUsage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a single endpoint.
#[derive(Debug, Default)]
struct EndpointCounters {
    attempts: u64,
    successes: u64,
    transient_failures: u64,
    fatal_failures: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Thread-safe usage tracker shared by all tasks.
#[derive(Debug, Default)]
pub struct UsageTracker {
    endpoints: DashMap<String, EndpointCounters>,
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful attempt.
    pub fn record_success(&self, endpoint: &str, response: &CompletionResponse) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        let mut counters = self.endpoints.entry(endpoint.to_string()).or_default();
        counters.attempts += 1;
        counters.successes += 1;
        if let Some(usage) = &response.usage {
            counters.prompt_tokens += u64::from(usage.prompt_tokens);
            counters.completion_tokens += u64::from(usage.completion_tokens);
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, endpoint: &str, error: &BackendError) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        let mut counters = self.endpoints.entry(endpoint.to_string()).or_default();
        counters.attempts += 1;
        if error.is_transient() {
            counters.transient_failures += 1;
        } else {
            counters.fatal_failures += 1;
        }
    }

    /// Record that a retry was scheduled.
    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::Relaxed)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Snapshot of all endpoints, sorted by name.
    pub fn snapshot(&self) -> Vec<EndpointUsage> {
        let mut usage: Vec<EndpointUsage> = self
            .endpoints
            .iter()
            .map(|entry| {
                let c = entry.value();
                EndpointUsage {
                    endpoint: entry.key().clone(),
                    attempts: c.attempts,
                    successes: c.successes,
                    transient_failures: c.transient_failures,
                    fatal_failures: c.fatal_failures,
                    prompt_tokens: c.prompt_tokens,
                    completion_tokens: c.completion_tokens,
                }
            })
            .collect();
        usage.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Choice, TokenUsage};

    fn response() -> CompletionResponse {
        CompletionResponse {
            choices: vec![Choice { text: "ok".into() }],
            model: "m".into(),
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 90,
            }),
        }
    }

    #[test]
    fn test_records_per_endpoint() {
        let tracker = UsageTracker::new();
        tracker.record_success("b", &response());
        tracker.record_failure(
            "a",
            &BackendError::RateLimited {
                endpoint: "a".into(),
            },
        );
        tracker.record_failure(
            "a",
            &BackendError::AuthenticationFailed {
                endpoint: "a".into(),
                status: 401,
            },
        );
        tracker.record_retry();

        let usage = tracker.snapshot();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].endpoint, "a");
        assert_eq!(usage[0].attempts, 2);
        assert_eq!(usage[0].transient_failures, 1);
        assert_eq!(usage[0].fatal_failures, 1);
        assert_eq!(usage[1].successes, 1);
        assert_eq!(usage[1].prompt_tokens, 10);
        assert_eq!(usage[1].completion_tokens, 90);
        assert_eq!(tracker.total_attempts(), 3);
        assert_eq!(tracker.total_retries(), 1);
    }
}
