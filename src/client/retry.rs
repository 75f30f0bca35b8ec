//! Retry policy and the retrying client built on it.
//!
//! A call is attempted up to `max_attempts` times. Transient failures wait
//! `min(max_delay, base_delay * 2^(attempt-1))` before the next attempt;
//! fatal failures are returned at once.

use crate::client::{
    BackendPool, CompletionBackend, CompletionRequest, CompletionResponse, UsageTracker,
};
use crate::models::{BackendError, Endpoint, EvalError, RetryConfig, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether and when a failed call is attempted again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Which failures are worth another attempt
    pub retryable: fn(&BackendError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(90),
            retryable: BackendError::is_transient,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            ..Self::default()
        }
    }
}

/// One failed iteration of the retry loop, kept only long enough to log.
#[derive(Debug)]
pub struct CallAttempt<'a> {
    /// 1-based attempt number that failed
    pub attempt: u32,
    /// Wait before the next attempt
    pub wait: Duration,
    pub last_error: &'a BackendError,
}

impl RetryPolicy {
    /// Wait after the failure of 1-based `attempt`.
    ///
    /// Exponential in the attempt number, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` under this policy.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` observes every
    /// retry that is scheduled, before the wait starts.
    pub async fn run<F, Fut, T, O>(&self, mut op: F, mut on_retry: O) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
        O: FnMut(&CallAttempt<'_>),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.retryable)(&err) {
                debug!(attempt, error = %err, "Fatal backend error, not retrying");
                return Err(EvalError::FatalBackend(err));
            }
            if attempt >= max_attempts {
                return Err(EvalError::RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let record = CallAttempt {
                attempt,
                wait: self.backoff(attempt),
                last_error: &err,
            };
            warn!(
                attempt = record.attempt,
                max_attempts,
                endpoint = %record.last_error.endpoint(),
                wait_secs = record.wait.as_secs_f64(),
                error = %record.last_error,
                "Retrying after transient error"
            );
            on_retry(&record);
            tokio::time::sleep(record.wait).await;
            attempt += 1;
        }
    }
}

/// Backend wrapper that retries transient failures under a [`RetryPolicy`].
pub struct RetryingClient {
    backend: Arc<dyn CompletionBackend>,
    policy: RetryPolicy,
    usage: UsageTracker,
}

impl RetryingClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            usage: UsageTracker::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Single attempt against `endpoint`, recorded in the usage tracker.
    ///
    /// A response with a choice count other than `request.n` counts as a
    /// malformed (transient) failure whatever the backend.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, BackendError> {
        let outcome = self
            .backend
            .complete(endpoint, request)
            .await
            .and_then(|response| {
                if response.choices.len() == request.n {
                    Ok(response)
                } else {
                    Err(BackendError::MalformedResponse {
                        endpoint: endpoint.name.clone(),
                        message: format!(
                            "expected {} choices, got {}",
                            request.n,
                            response.choices.len()
                        ),
                    })
                }
            });

        match outcome {
            Ok(response) => {
                self.usage.record_success(&endpoint.name, &response);
                Ok(response)
            }
            Err(e) => {
                self.usage.record_failure(&endpoint.name, &e);
                Err(e)
            }
        }
    }

    /// Request `request.n` completions from `endpoint`, retrying transient failures.
    pub async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        self.policy
            .run(
                |_| self.attempt(endpoint, request),
                |_| self.usage.record_retry(),
            )
            .await
    }

    /// Like [`invoke`](Self::invoke), but every attempt takes the next endpoint from `pool`.
    pub async fn invoke_rotating(
        &self,
        pool: &BackendPool,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        self.policy
            .run(
                |_| self.attempt(pool.next(), request),
                |_| self.usage.record_retry(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Choice;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct FaultInjector {
        failures: u32,
        error: fn(&str) -> BackendError,
        calls: AtomicU32,
        call_times: Mutex<Vec<Instant>>,
        endpoints_seen: Mutex<Vec<String>>,
    }

    impl FaultInjector {
        fn new(failures: u32, error: fn(&str) -> BackendError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicU32::new(0),
                call_times: Mutex::new(Vec::new()),
                endpoints_seen: Mutex::new(Vec::new()),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let times = self.call_times.lock().unwrap();
            times.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl CompletionBackend for FaultInjector {
        async fn complete(
            &self,
            endpoint: &Endpoint,
            request: &CompletionRequest,
        ) -> std::result::Result<CompletionResponse, BackendError> {
            self.call_times.lock().unwrap().push(Instant::now());
            self.endpoints_seen.lock().unwrap().push(endpoint.name.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)(&endpoint.name));
            }
            Ok(CompletionResponse {
                choices: (0..request.n)
                    .map(|i| Choice {
                        text: format!("answer {i}"),
                    })
                    .collect(),
                model: request.model.clone(),
                usage: None,
            })
        }
    }

    fn transient(endpoint: &str) -> BackendError {
        BackendError::Server {
            endpoint: endpoint.to_string(),
            status: 503,
            message: "overloaded".to_string(),
        }
    }

    fn fatal(endpoint: &str) -> BackendError {
        BackendError::AuthenticationFailed {
            endpoint: endpoint.to_string(),
            status: 401,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".to_string(),
            prompt: "p".to_string(),
            n: 3,
            max_tokens: 16,
            temperature: 1.0,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let secs: Vec<u64> = (1..=8).map(|k| policy.backoff(k).as_secs()).collect();
        assert_eq!(secs, [5, 10, 20, 40, 80, 90, 90, 90]);
        assert_eq!(policy.backoff(19), Duration::from_secs(90));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(90));
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_secs: 0.5,
            max_delay_secs: 1.5,
            rotate_endpoints: false,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        for failures in [0u32, 1, 5, 7, 19] {
            let backend = Arc::new(FaultInjector::new(failures, transient));
            let client = RetryingClient::new(backend.clone(), RetryPolicy::default());
            let endpoint = Endpoint::new("ep-0", "http://unused");

            let response = client.invoke(&endpoint, &request()).await.unwrap();
            assert_eq!(response.choices.len(), 3);
            assert_eq!(backend.calls.load(Ordering::SeqCst), failures + 1);

            let expected: Vec<Duration> = (1..=failures)
                .map(|k| Duration::from_secs((5u64 << (k - 1)).min(90)))
                .collect();
            assert_eq!(backend.gaps(), expected, "failures={failures}");
            assert_eq!(client.usage().total_retries(), u64::from(failures));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let backend = Arc::new(FaultInjector::new(u32::MAX, transient));
        let client = RetryingClient::new(backend.clone(), RetryPolicy::default());
        let endpoint = Endpoint::new("ep-0", "http://unused");

        let err = client.invoke(&endpoint, &request()).await.unwrap_err();
        assert!(matches!(err, EvalError::RetryExhausted { attempts: 20, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 20);
        assert_eq!(backend.gaps().len(), 19);

        let usage = client.usage().snapshot();
        assert_eq!(usage[0].attempts, 20);
        assert_eq!(usage[0].transient_failures, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let backend = Arc::new(FaultInjector::new(u32::MAX, fatal));
        let client = RetryingClient::new(backend.clone(), RetryPolicy::default());
        let endpoint = Endpoint::new("ep-0", "http://unused");

        let start = Instant::now();
        let err = client.invoke(&endpoint, &request()).await.unwrap_err();
        assert!(matches!(
            err,
            EvalError::FatalBackend(BackendError::AuthenticationFailed { .. })
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_after_transient_stops_immediately() {
        struct FlipBackend(AtomicU32);

        #[async_trait]
        impl CompletionBackend for FlipBackend {
            async fn complete(
                &self,
                endpoint: &Endpoint,
                _request: &CompletionRequest,
            ) -> std::result::Result<CompletionResponse, BackendError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient(&endpoint.name))
                } else {
                    Err(fatal(&endpoint.name))
                }
            }
        }

        let backend = Arc::new(FlipBackend(AtomicU32::new(0)));
        let client = RetryingClient::new(backend.clone(), RetryPolicy::default());
        let err = client
            .invoke(&Endpoint::new("ep-0", "http://unused"), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::FatalBackend(_)));
        assert_eq!(backend.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotating_invoke_moves_through_pool() {
        let backend = Arc::new(FaultInjector::new(3, transient));
        let client = RetryingClient::new(backend.clone(), RetryPolicy::default());
        let pool = BackendPool::new(vec![
            Endpoint::new("a", "http://a"),
            Endpoint::new("b", "http://b"),
        ])
        .unwrap();

        client.invoke_rotating(&pool, &request()).await.unwrap();
        assert_eq!(*backend.endpoints_seen.lock().unwrap(), ["a", "b", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_response_is_retried() {
        struct ShortOnce(AtomicU32);

        #[async_trait]
        impl CompletionBackend for ShortOnce {
            async fn complete(
                &self,
                _endpoint: &Endpoint,
                request: &CompletionRequest,
            ) -> std::result::Result<CompletionResponse, BackendError> {
                let n = if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    request.n - 1
                } else {
                    request.n
                };
                Ok(CompletionResponse {
                    choices: (0..n)
                        .map(|_| Choice {
                            text: "x".to_string(),
                        })
                        .collect(),
                    model: request.model.clone(),
                    usage: None,
                })
            }
        }

        let backend = Arc::new(ShortOnce(AtomicU32::new(0)));
        let client = RetryingClient::new(backend.clone(), RetryPolicy::default());
        let start = Instant::now();
        let response = client
            .invoke(&Endpoint::new("ep-0", "http://unused"), &request())
            .await
            .unwrap();

        assert_eq!(response.choices.len(), 3);
        assert_eq!(backend.0.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        let usage = client.usage().snapshot();
        assert_eq!(usage[0].transient_failures, 1);
        assert_eq!(usage[0].successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_retry_predicate() {
        let backend = Arc::new(FaultInjector::new(u32::MAX, transient));
        let policy = RetryPolicy {
            retryable: |_| false,
            ..RetryPolicy::default()
        };
        let client = RetryingClient::new(backend.clone(), policy);
        let err = client
            .invoke(&Endpoint::new("ep-0", "http://unused"), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::FatalBackend(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
