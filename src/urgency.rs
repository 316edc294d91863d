//! Deadline classification.
//!
//! The same thresholds drive the daily reminder job and the urgency badge
//! returned by the task API, so both always agree on what "urgent" means.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Task;

/// Default width of the urgent window.
pub const DEFAULT_URGENT_WINDOW_DAYS: i64 = 14;

/// Widest urgent window accepted from configuration.
pub const MAX_URGENT_WINDOW_DAYS: i64 = 3650;

/// How close a task is to its deadline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
    Normal,
    Urgent,
    Overdue,
}

impl UrgencyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
            Self::Overdue => "overdue",
        }
    }
}

impl std::fmt::Display for UrgencyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("task {task_id} has no due date")]
    InvalidTask { task_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Tasks due within this window from now (inclusive) are urgent.
    pub urgent_window: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            urgent_window: Duration::days(DEFAULT_URGENT_WINDOW_DAYS),
        }
    }
}

impl Thresholds {
    /// Window of `days`, clamped to `0..=MAX_URGENT_WINDOW_DAYS`.
    pub fn with_urgent_days(days: i64) -> Self {
        Self {
            urgent_window: Duration::days(days.clamp(0, MAX_URGENT_WINDOW_DAYS)),
        }
    }

    /// Latest due date that still counts as urgent at `now`. Saturates at
    /// the largest representable instant.
    pub fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.urgent_window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Classify `task` at `now`. First match wins: overdue, urgent, normal.
    pub fn classify(&self, task: &Task, now: DateTime<Utc>) -> Result<UrgencyTier, ClassifyError> {
        let due = task
            .due_date
            .ok_or(ClassifyError::InvalidTask { task_id: task.id })?;

        Ok(if due < now {
            UrgencyTier::Overdue
        } else if due <= self.horizon(now) {
            UrgencyTier::Urgent
        } else {
            UrgencyTier::Normal
        })
    }
}

/// Classify with the default 14-day window.
pub fn classify(task: &Task, now: DateTime<Utc>) -> Result<UrgencyTier, ClassifyError> {
    Thresholds::default().classify(task, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task_due(due_date: Option<DateTime<Utc>>) -> Task {
        Task {
            id: Uuid::new_v4(),
            matter_id: Uuid::new_v4(),
            info: "File response".to_string(),
            detail: None,
            due_date,
            assigned_to: None,
            done: false,
            done_at: None,
            created_at: Utc::now(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_past_due_is_overdue() {
        for offset in [Duration::nanoseconds(1), Duration::days(1), Duration::days(400)] {
            let task = task_due(Some(now() - offset));
            assert_eq!(classify(&task, now()), Ok(UrgencyTier::Overdue));
        }
    }

    #[test]
    fn test_window_bounds_are_urgent() {
        let task = task_due(Some(now()));
        assert_eq!(classify(&task, now()), Ok(UrgencyTier::Urgent));

        let task = task_due(Some(now() + Duration::days(14)));
        assert_eq!(classify(&task, now()), Ok(UrgencyTier::Urgent));

        let task = task_due(Some(now() + Duration::days(3)));
        assert_eq!(classify(&task, now()), Ok(UrgencyTier::Urgent));
    }

    #[test]
    fn test_beyond_window_is_normal() {
        let task = task_due(Some(now() + Duration::days(14) + Duration::seconds(1)));
        assert_eq!(classify(&task, now()), Ok(UrgencyTier::Normal));

        let task = task_due(Some(now() + Duration::days(90)));
        assert_eq!(classify(&task, now()), Ok(UrgencyTier::Normal));
    }

    #[test]
    fn test_missing_due_date_is_invalid() {
        let task = task_due(None);
        assert_eq!(
            classify(&task, now()),
            Err(ClassifyError::InvalidTask { task_id: task.id })
        );
    }

    #[test]
    fn test_custom_window() {
        let thresholds = Thresholds::with_urgent_days(3);
        let task = task_due(Some(now() + Duration::days(5)));
        assert_eq!(thresholds.classify(&task, now()), Ok(UrgencyTier::Normal));
        assert_eq!(classify(&task, now()), Ok(UrgencyTier::Urgent));
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let thresholds = Thresholds::with_urgent_days(200_000_000);
        assert_eq!(thresholds.urgent_window, Duration::days(MAX_URGENT_WINDOW_DAYS));

        let task = task_due(Some(now() + Duration::days(365)));
        assert_eq!(thresholds.classify(&task, now()), Ok(UrgencyTier::Urgent));
    }

    #[test]
    fn test_horizon_saturates_instead_of_overflowing() {
        let thresholds = Thresholds {
            urgent_window: Duration::days(MAX_URGENT_WINDOW_DAYS),
        };
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert_eq!(thresholds.horizon(near_end), DateTime::<Utc>::MAX_UTC);

        let task = task_due(Some(near_end));
        assert_eq!(thresholds.classify(&task, near_end), Ok(UrgencyTier::Urgent));
    }
}
