//! Bounded concurrent execution of evaluation tasks.

mod scheduler;

pub use scheduler::*;
