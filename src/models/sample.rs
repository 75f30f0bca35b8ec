//! Sample, result and report types for evalpool.
//!
//! These types carry a batch through the harness: `Sample` in,
//! `EvaluationTask` per sample, `EvaluationResult` per finished task,
//! `SampleRecord` per output line and one `AggregateReport` per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reward for a response judged equivalent to the ground truth.
pub const CORRECT_REWARD: f64 = 1.0;

/// Reward for a wrong, unparseable or missing response.
pub const PENALTY: f64 = -1.0;

/// Input sample for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Optional identifier, passed through to output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The prompt sent to the model as a single user message
    pub prompt: String,

    /// Completions to request; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,

    /// Expected answer
    pub ground_truth: String,

    /// Optional metadata (passed through to output)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Sample {
    pub fn new(prompt: impl Into<String>, ground_truth: impl Into<String>) -> Self {
        Self {
            id: None,
            prompt: prompt.into(),
            n: None,
            ground_truth: ground_truth.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_n(mut self, n: usize) -> Self {
        self.n = Some(n);
        self
    }
}

/// One unit of work: evaluate a prompt `n` times against its ground truth.
///
/// Built once per sample and consumed exactly once by the scheduler.
#[derive(Debug, Clone)]
pub struct EvaluationTask {
    /// Position of the sample in the input batch
    pub index: usize,
    pub prompt: String,
    pub n: usize,
    pub ground_truth: String,
}

/// Outcome of a successful evaluation task.
///
/// `responses` and `scores` always have the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub responses: Vec<String>,
    pub scores: Vec<f64>,
    pub mean_score: f64,
}

impl EvaluationResult {
    pub fn new(responses: Vec<String>, scores: Vec<f64>) -> Self {
        debug_assert_eq!(responses.len(), scores.len());
        let mean_score = mean(&scores).unwrap_or(PENALTY);
        Self {
            responses,
            scores,
            mean_score,
        }
    }

    /// Number of responses that earned the full reward.
    pub fn correct_count(&self) -> usize {
        self.scores.iter().filter(|&&s| s >= CORRECT_REWARD).count()
    }
}

/// One line of the results log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Position of the sample in the input batch
    pub index: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub prompt: String,

    pub ground_truth: String,

    /// Completions requested
    pub n: usize,

    /// Raw response texts (empty if the sample failed)
    pub responses: Vec<String>,

    /// Per-response scores (empty if the sample failed)
    pub scores: Vec<f64>,

    /// Mean of `scores`, or the penalty if the sample failed
    pub mean_score: f64,

    /// Terminal error for failed samples
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl SampleRecord {
    /// Record for a sample whose task succeeded.
    pub fn completed(index: usize, sample: Sample, n: usize, result: EvaluationResult) -> Self {
        Self {
            index,
            id: sample.id,
            prompt: sample.prompt,
            ground_truth: sample.ground_truth,
            n,
            responses: result.responses,
            scores: result.scores,
            mean_score: result.mean_score,
            error: None,
            metadata: sample.metadata,
        }
    }

    /// Record for a sample whose task ended in a terminal error.
    pub fn failed(index: usize, sample: Sample, n: usize, error: String) -> Self {
        Self {
            index,
            id: sample.id,
            prompt: sample.prompt,
            ground_truth: sample.ground_truth,
            n,
            responses: Vec::new(),
            scores: Vec::new(),
            mean_score: PENALTY,
            error: Some(error),
            metadata: sample.metadata,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-endpoint call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub attempts: u64,
    pub successes: u64,
    pub transient_failures: u64,
    pub fatal_failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Unique identifier of this run
    pub run_id: String,

    pub started_at: DateTime<Utc>,

    /// Samples in the batch
    pub total_samples: usize,

    /// Samples that ended in a terminal error
    pub failed_samples: usize,

    /// Responses received across all samples
    pub total_responses: usize,

    /// Responses that earned the full reward
    pub correct_responses: usize,

    /// Mean over per-sample mean scores, each sample weighted equally
    pub mean_score: f64,

    /// Wall-clock duration in seconds
    pub runtime_secs: f64,

    /// Samples per hour throughput
    pub throughput_per_hour: f64,

    /// Call statistics per endpoint
    #[serde(default)]
    pub usage: Vec<EndpointUsage>,
}

impl AggregateReport {
    /// Derive the report from finished records.
    pub fn from_records(
        run_id: String,
        started_at: DateTime<Utc>,
        records: &[SampleRecord],
        runtime_secs: f64,
        usage: Vec<EndpointUsage>,
    ) -> Self {
        let means: Vec<f64> = records.iter().map(|r| r.mean_score).collect();
        let total_samples = records.len();
        let throughput_per_hour = if runtime_secs > 0.0 {
            total_samples as f64 / runtime_secs * 3600.0
        } else {
            0.0
        };

        Self {
            run_id,
            started_at,
            total_samples,
            failed_samples: records.iter().filter(|r| r.is_failed()).count(),
            total_responses: records.iter().map(|r| r.responses.len()).sum(),
            correct_responses: records
                .iter()
                .flat_map(|r| r.scores.iter())
                .filter(|&&s| s >= CORRECT_REWARD)
                .count(),
            mean_score: mean(&means).unwrap_or(0.0),
            runtime_secs,
            throughput_per_hour,
            usage,
        }
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_deserialize_defaults() {
        let sample: Sample =
            serde_json::from_str(r#"{"prompt": "1+1?", "ground_truth": "2"}"#).unwrap();
        assert_eq!(sample.id, None);
        assert_eq!(sample.n, None);
        assert!(sample.metadata.is_null());

        let sample: Sample = serde_json::from_str(
            r#"{"id": "aime-1", "prompt": "p", "n": 8, "ground_truth": "70", "metadata": {"year": 2024}}"#,
        )
        .unwrap();
        assert_eq!(sample.n, Some(8));
        assert_eq!(sample.metadata["year"], 2024);
    }

    #[test]
    fn test_evaluation_result_mean() {
        let result = EvaluationResult::new(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            vec![1.0, 1.0, -1.0, -1.0],
        );
        assert_eq!(result.mean_score, 0.0);
        assert_eq!(result.correct_count(), 2);
    }

    #[test]
    fn test_failed_record_uses_penalty() {
        let record = SampleRecord::failed(3, Sample::new("p", "gt"), 4, "boom".to_string());
        assert!(record.is_failed());
        assert_eq!(record.mean_score, PENALTY);
        assert!(record.responses.is_empty());
        assert!(record.scores.is_empty());
    }

    #[test]
    fn test_report_weights_samples_equally() {
        let records = vec![
            SampleRecord::completed(
                0,
                Sample::new("p0", "1"),
                2,
                EvaluationResult::new(vec!["x".into(), "y".into()], vec![1.0, 1.0]),
            ),
            SampleRecord::failed(1, Sample::new("p1", "2"), 8, "fatal".to_string()),
        ];

        let report = AggregateReport::from_records("run".into(), Utc::now(), &records, 2.0, vec![]);
        assert_eq!(report.total_samples, 2);
        assert_eq!(report.failed_samples, 1);
        assert_eq!(report.total_responses, 2);
        assert_eq!(report.correct_responses, 2);
        assert_eq!(report.mean_score, 0.0);
        assert_eq!(report.throughput_per_hour, 3600.0);
    }

    #[test]
    fn test_empty_report() {
        let report = AggregateReport::from_records("run".into(), Utc::now(), &[], 0.0, vec![]);
        assert_eq!(report.mean_score, 0.0);
        assert_eq!(report.throughput_per_hour, 0.0);
    }
}
