//! Pipeline module - batch evaluation harness.

mod eval;

pub use eval::*;
