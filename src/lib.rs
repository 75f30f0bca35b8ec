//! evalpool - Concurrent evaluation of LLM endpoints against ground-truth answers.
//!
//! ## Architecture
//!
//! - **Backend Pool**: fixed endpoint list with a lock-free round-robin cursor
//! - **Retrying Client**: exponential backoff for transient failures, fatal
//!   errors surface at once
//! - **Bounded Scheduler**: at most K tasks in flight, results in input order
//! - **Scorer**: strict-reasoning or no-reasoning reward of +1.0 / -1.0
//!
//! ## Pipeline
//!
//! Samples → one task per sample → scheduler → pool + client → scorer →
//! per-sample records (JSONL, written atomically) + aggregate report

pub mod client;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod scoring;

// Re-exports for convenience
pub use client::{BackendPool, CompletionBackend, LLMClient, RetryPolicy, RetryingClient};
pub use models::{AggregateReport, Config, EvalError, Result, Sample, SampleRecord};
pub use output::ResultsWriter;
pub use pipeline::{EvalPipeline, EvalReport};
pub use pool::{BoundedScheduler, Progress};
pub use scoring::{AnswerGrader, BoxedAnswerGrader, Scorer};
