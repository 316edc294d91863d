use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a notification was about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A task reminder sent by the daily urgent-task job.
    TaskDeadline,
    /// A matter status transition.
    StatusChange,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskDeadline => "task_deadline",
            Self::StatusChange => "status_change",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "task_deadline" => Some(Self::TaskDeadline),
            "status_change" => Some(Self::StatusChange),
            _ => None,
        }
    }
}

/// Proof that a notification about `subject_id` went out on `day`.
///
/// Records are unique on `(subject_id, kind, dedupe_key, day)`. The key
/// distinguishes different notifications of the same kind on the same
/// subject, e.g. `granted->dead` vs `pending->granted`; task reminders use
/// an empty key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub subject_id: Uuid,
    pub kind: NotificationKind,
    pub dedupe_key: String,
    pub day: NaiveDate,
    pub sent_at: DateTime<Utc>,
}
