//! Evaluation harness.
//!
//! Pipeline flow:
//! Samples → EvaluationTask per sample → Bounded Scheduler → Retrying Client
//! → Scorer → SampleRecords (input order) → AggregateReport + JSONL

use crate::client::{
    BackendPool, CompletionBackend, CompletionRequest, LLMClient, RetryPolicy, RetryingClient,
};
use crate::models::{
    AggregateReport, Config, EvalError, EvaluationResult, EvaluationTask, GenerationConfig, Result,
    Sample, SampleRecord,
};
use crate::output::ResultsWriter;
use crate::pool::{BoundedScheduler, Progress};
use crate::scoring::Scorer;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a single task needs, cloned into each spawned future.
#[derive(Clone)]
struct TaskContext {
    pool: Arc<BackendPool>,
    client: Arc<RetryingClient>,
    scorer: Arc<Scorer>,
    generation: Arc<GenerationConfig>,
    rotate_endpoints: bool,
}

impl TaskContext {
    async fn evaluate(self, task: EvaluationTask) -> Result<EvaluationResult> {
        if task.n == 0 {
            return Err(EvalError::InvalidInput(format!(
                "sample {} requests zero completions",
                task.index
            )));
        }

        let request = CompletionRequest::new(&self.generation, task.prompt, task.n);
        let response = if self.rotate_endpoints {
            self.client.invoke_rotating(&self.pool, &request).await?
        } else {
            let endpoint = self.pool.next();
            debug!(index = task.index, endpoint = %endpoint.name, "Dispatching task");
            self.client.invoke(endpoint, &request).await?
        };

        let responses = response.into_texts();
        let scores = self.scorer.score_all(&responses, &task.ground_truth);
        let result = EvaluationResult::new(responses, scores);

        debug!(
            index = task.index,
            mean_score = result.mean_score,
            correct = result.correct_count(),
            "Task finished"
        );
        Ok(result)
    }
}

/// Output of one evaluation run.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub report: AggregateReport,
    /// One record per input sample, in input order
    pub records: Vec<SampleRecord>,
}

/// Evaluates a batch of samples against a pool of backends.
pub struct EvalPipeline {
    context: TaskContext,
    max_concurrency: usize,
    show_progress: bool,
    progress: Progress,
}

impl EvalPipeline {
    /// Create a pipeline over `pool`, sending requests through `backend`.
    pub fn new(pool: BackendPool, backend: Arc<dyn CompletionBackend>, config: &Config) -> Self {
        let client = RetryingClient::new(backend, RetryPolicy::from(&config.retry));
        Self {
            context: TaskContext {
                pool: Arc::new(pool),
                client: Arc::new(client),
                scorer: Arc::new(Scorer::from_config(&config.scoring)),
                generation: Arc::new(config.generation.clone()),
                rotate_endpoints: config.retry.rotate_endpoints,
            },
            max_concurrency: config.scheduler.max_concurrency,
            show_progress: true,
            progress: Progress::default(),
        }
    }

    /// Create a pipeline talking HTTP to the configured endpoints.
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = BackendPool::new(config.resolve_endpoints()?)?;
        let backend = Arc::new(LLMClient::new(config.client.timeout_secs)?);
        Ok(Self::new(pool, backend, config))
    }

    /// Override the concurrency limit.
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Draw a progress bar on stderr while evaluating (on by default).
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Live task counters, readable from another task while `evaluate` runs.
    ///
    /// Totals accumulate over every run of this pipeline.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    pub fn pool(&self) -> &BackendPool {
        &self.context.pool
    }

    pub fn client(&self) -> &RetryingClient {
        &self.context.client
    }

    /// Load samples from a JSONL file.
    pub fn load_samples(path: &Path) -> Result<Vec<Sample>> {
        let file = File::open(path).map_err(|e| EvalError::io("opening samples file", e))?;
        let reader = BufReader::new(file);
        let mut samples = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| EvalError::io("reading samples file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(&line)
                .map_err(|e| EvalError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            if sample.n == Some(0) {
                return Err(EvalError::ParseError(format!(
                    "Line {}: n must be at least 1",
                    line_num + 1
                )));
            }
            samples.push(sample);
        }

        info!(count = samples.len(), path = %path.display(), "Loaded samples");
        Ok(samples)
    }

    /// Completions requested for `sample`.
    fn samples_for(&self, sample: &Sample) -> usize {
        sample.n.unwrap_or(self.context.generation.samples_per_prompt)
    }

    /// One task per sample, indexed by input position.
    pub fn build_tasks(&self, samples: &[Sample]) -> Vec<EvaluationTask> {
        samples
            .iter()
            .enumerate()
            .map(|(index, sample)| EvaluationTask {
                index,
                prompt: sample.prompt.clone(),
                n: self.samples_for(sample),
                ground_truth: sample.ground_truth.clone(),
            })
            .collect()
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }

    /// Evaluate every sample and aggregate the scores.
    ///
    /// Never fails as a whole: a sample whose task ends in an error is
    /// recorded with the penalty as its mean and the error message.
    pub async fn evaluate(&self, samples: Vec<Sample>) -> EvalReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();
        let total = samples.len();

        info!(
            run_id = %run_id,
            samples = total,
            endpoints = self.context.pool.len(),
            max_concurrency = self.max_concurrency,
            policy = ?self.context.scorer.policy(),
            "Starting evaluation"
        );

        let pb = self.progress_bar(total);
        let scheduler = BoundedScheduler::new(self.max_concurrency)
            .with_progress(self.progress.clone())
            .with_progress_bar(pb.clone());

        let tasks = self.build_tasks(&samples);
        let sizes: Vec<usize> = tasks.iter().map(|t| t.n).collect();
        let results = scheduler
            .run_all(tasks.into_iter().map(|task| self.context.clone().evaluate(task)))
            .await;

        let records: Vec<SampleRecord> = samples
            .into_iter()
            .zip(sizes)
            .zip(results)
            .enumerate()
            .map(|(index, ((sample, n), result))| match result {
                Ok(result) => SampleRecord::completed(index, sample, n, result),
                Err(e) => {
                    warn!(index, id = ?sample.id, error = %e, "Sample failed");
                    SampleRecord::failed(index, sample, n, e.to_string())
                }
            })
            .collect();

        let report = AggregateReport::from_records(
            run_id,
            started_at,
            &records,
            start.elapsed().as_secs_f64(),
            self.context.client.usage().snapshot(),
        );

        pb.finish_with_message(format!(
            "mean score {:.4}, {} failed",
            report.mean_score, report.failed_samples
        ));
        info!(
            run_id = %report.run_id,
            samples = report.total_samples,
            failed = report.failed_samples,
            correct = report.correct_responses,
            responses = report.total_responses,
            mean_score = report.mean_score,
            retries = self.context.client.usage().total_retries(),
            runtime_secs = report.runtime_secs,
            "Evaluation complete"
        );

        EvalReport { report, records }
    }

    /// Evaluate `samples` and write the records to `output_path`.
    ///
    /// The file is written once, after every task has finished.
    pub async fn run(&self, samples: Vec<Sample>, output_path: &Path) -> Result<EvalReport> {
        let eval = self.evaluate(samples).await;
        ResultsWriter::new(output_path).write_all(&eval.records)?;
        Ok(eval)
    }
}
