//! Scoring of model responses against ground truth.

mod grader;
mod scorer;

pub use grader::*;
pub use scorer::*;
