//! Response scoring policies.

use crate::models::{CORRECT_REWARD, PENALTY, ScoringConfig, ScoringPolicy};
use crate::scoring::{AnswerGrader, BoxedAnswerGrader};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Why no answer could be taken from a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringError {
    #[error("response has no end-of-reasoning delimiter '{0}'")]
    MissingDelimiter(String),
}

/// Text after the first occurrence of `delimiter`.
pub fn answer_span<'a>(response: &'a str, delimiter: &str) -> Result<&'a str, ScoringError> {
    response
        .split_once(delimiter)
        .map(|(_, after)| after)
        .ok_or_else(|| ScoringError::MissingDelimiter(delimiter.to_string()))
}

/// Maps a response and its ground truth to a reward of +1.0 or -1.0.
///
/// Stateless apart from its configuration, so one scorer is shared by all
/// tasks.
#[derive(Clone)]
pub struct Scorer {
    policy: ScoringPolicy,
    delimiter: String,
    grader: Arc<dyn AnswerGrader>,
}

impl Scorer {
    pub fn new(
        policy: ScoringPolicy,
        delimiter: impl Into<String>,
        grader: Arc<dyn AnswerGrader>,
    ) -> Self {
        Self {
            policy,
            delimiter: delimiter.into(),
            grader,
        }
    }

    /// Scorer using the configured policy and [`BoxedAnswerGrader`].
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self::new(
            config.policy,
            config.delimiter.clone(),
            Arc::new(BoxedAnswerGrader),
        )
    }

    pub fn policy(&self) -> ScoringPolicy {
        self.policy
    }

    /// The part of `response` handed to the grader under this policy.
    pub fn extract<'a>(&self, response: &'a str) -> Result<&'a str, ScoringError> {
        match self.policy {
            ScoringPolicy::StrictReasoning => answer_span(response, &self.delimiter),
            ScoringPolicy::NoReasoning => Ok(response),
        }
    }

    /// Score one response. Total over all inputs.
    pub fn score(&self, response: &str, ground_truth: &str) -> f64 {
        match self.extract(response) {
            Ok(answer) if self.grader.is_equivalent(answer, ground_truth) => CORRECT_REWARD,
            Ok(_) => PENALTY,
            Err(e) => {
                trace!(error = %e, "Scoring with penalty");
                PENALTY
            }
        }
    }

    /// Score every response against the same ground truth.
    pub fn score_all(&self, responses: &[String], ground_truth: &str) -> Vec<f64> {
        responses
            .iter()
            .map(|r| self.score(r, ground_truth))
            .collect()
    }
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("policy", &self.policy)
            .field("delimiter", &self.delimiter)
            .finish_non_exhaustive()
    }
}
