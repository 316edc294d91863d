//! Scheduled jobs.

mod urgent_tasks;

pub use urgent_tasks::*;
