use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A patent or trademark case tracked by the docket.
///
/// A matter owns its [`super::Task`]s; deleting the matter deletes them.
/// The status only ever changes through a status transition, which is
/// recorded as a [`StatusChangeEvent`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Matter {
    pub id: Uuid,
    /// Human-facing case reference, e.g. `ACME-P-0042-EP`.
    pub reference: String,
    pub title: String,
    pub status: MatterStatus,
    /// Contact for the owning client.
    pub client: Option<String>,
    /// Attorney or paralegal responsible for the matter.
    pub responsible: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The workflow status of a matter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatterStatus {
    Pending,
    Filed,
    Published,
    Granted,
    Registered,
    Opposed,
    Lapsed,
    Abandoned,
    Dead,
}

impl MatterStatus {
    pub const ALL: [MatterStatus; 9] = [
        Self::Pending,
        Self::Filed,
        Self::Published,
        Self::Granted,
        Self::Registered,
        Self::Opposed,
        Self::Lapsed,
        Self::Abandoned,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Filed => "filed",
            Self::Published => "published",
            Self::Granted => "granted",
            Self::Registered => "registered",
            Self::Opposed => "opposed",
            Self::Lapsed => "lapsed",
            Self::Abandoned => "abandoned",
            Self::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for MatterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one matter status transition.
///
/// Events reference the matter by id only, so they can outlive the loaded
/// [`Matter`] and be serialized for delivery elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChangeEvent {
    pub id: Uuid,
    pub matter_id: Uuid,
    pub old_status: MatterStatus,
    pub new_status: MatterStatus,
    /// Who made the change.
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

/// Input for opening a new matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMatterInput {
    pub reference: String,
    pub title: String,
    /// Defaults to `Pending`.
    #[serde(default)]
    pub status: Option<MatterStatus>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub responsible: Option<String>,
}

/// Input for a status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStatusInput {
    pub status: MatterStatus,
    pub actor: String,
}

/// Result of a committed status transition.
///
/// `event` is `None` when the requested status equals the current one; no
/// history entry is written in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeResult {
    pub matter: Matter,
    pub previous_status: MatterStatus,
    pub event: Option<StatusChangeEvent>,
}
