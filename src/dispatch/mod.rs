//! Outbound notification delivery.
//!
//! The pipeline only talks to [`NotificationDispatcher`]. Rendering and the
//! actual channel (email, in-app badge, chat) belong to the implementation.

mod log;
mod memory;
mod webhook;

pub use log::TracingDispatcher;
pub use memory::{MemoryDispatcher, SentNotification};
pub use webhook::WebhookDispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::MatterStatus;
use crate::urgency::UrgencyTier;

/// Which presentation the channel should use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// Digest of urgent and overdue tasks for one recipient.
    UrgentTaskDigest,
    /// A matter moved to a new status.
    StatusChanged,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UrgentTaskDigest => "urgent_task_digest",
            Self::StatusChanged => "status_changed",
        }
    }
}

/// One task line in an urgent-task digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigestEntry {
    pub task_id: Uuid,
    pub matter_id: Uuid,
    pub matter_reference: String,
    pub info: String,
    pub detail: Option<String>,
    pub due_date: DateTime<Utc>,
    pub tier: UrgencyTier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    UrgentTasks {
        as_of: DateTime<Utc>,
        tasks: Vec<DigestEntry>,
    },
    StatusChanged {
        matter_id: Uuid,
        matter_reference: String,
        old_status: MatterStatus,
        new_status: MatterStatus,
        actor: Option<String>,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("delivery to {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },
    #[error("delivery to {recipient} timed out")]
    Timeout { recipient: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError>;
}
