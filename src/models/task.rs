use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A deadline-bound action item on a matter.
///
/// Once `done` is set the due date is frozen and the task no longer takes
/// part in urgency scanning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub matter_id: Uuid,
    /// Short label, e.g. "Respond to office action".
    pub info: String,
    pub detail: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    /// Overrides the matter's responsible party as recipient of reminders.
    pub assigned_to: Option<String>,
    pub done: bool,
    pub done_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An open task joined with the matter fields needed to route a reminder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDeadline {
    pub task: Task,
    pub matter_reference: String,
    pub matter_responsible: Option<String>,
}

impl TaskDeadline {
    /// The party a reminder for this task goes to: the assignee, or else the
    /// matter's responsible party.
    pub fn recipient(&self) -> Option<&str> {
        self.task
            .assigned_to
            .as_deref()
            .or(self.matter_responsible.as_deref())
            .filter(|r| !r.trim().is_empty())
    }
}

/// Input for creating a task on a matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskInput {
    pub info: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

/// Input for moving a task's due date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleTaskInput {
    pub due_date: DateTime<Utc>,
}
