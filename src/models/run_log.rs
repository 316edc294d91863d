use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a job run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every batch was dispatched.
    Completed,
    /// Finished, but at least one batch failed to dispatch.
    CompletedWithFailures,
    /// Stopped at a batch boundary after a cancellation request.
    Cancelled,
    /// Another run held the lock; nothing was done.
    Skipped,
    /// The run could not load its input.
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "completed_with_failures" => Some(Self::CompletedWithFailures),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One failed delivery (or the fatal error of a failed run).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFailure {
    pub recipient: String,
    pub reason: String,
}

/// Counters and failures gathered during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    /// Open tasks loaded from the store.
    pub scanned: u32,
    pub urgent: u32,
    pub overdue: u32,
    /// Tasks included in a successfully dispatched batch.
    pub notified: u32,
    /// Tasks left out: already notified today, invalid, or unroutable.
    pub skipped: u32,
    /// Batches whose dispatch failed.
    pub failed: u32,
    pub failures: Vec<RunFailure>,
}

/// An append-only run log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLogEntry {
    pub id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    #[serde(flatten)]
    pub counts: RunCounts,
}
