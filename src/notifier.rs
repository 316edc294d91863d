//! Notifications for matter status transitions.
//!
//! The write path calls [`StatusNotifier`] after a status change has been
//! committed. Each distinct `(matter, old, new, day)` transition produces at
//! most one notification, even when the write path retries. The day is the
//! calendar date in the configured [`CalendarZone`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::dispatch::{NotificationDispatcher, NotificationPayload, TemplateKind};
use crate::models::*;
use crate::scheduler::CalendarZone;

/// Who hears about a transition into a given status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    /// The matter's client contact.
    Client,
    /// The matter's responsible party.
    Responsible,
    /// Nobody.
    None,
}

impl RecipientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Responsible => "responsible",
            Self::None => "none",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "client" => Some(Self::Client),
            "responsible" => Some(Self::Responsible),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    fn resolve<'a>(&self, matter: &'a Matter) -> Option<&'a str> {
        let contact = match self {
            Self::Client => matter.client.as_deref(),
            Self::Responsible => matter.responsible.as_deref(),
            Self::None => None,
        };
        contact.filter(|c| !c.trim().is_empty())
    }
}

/// Routing table from new status to recipient role. Unlisted statuses
/// route to [`RecipientRole::None`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRoutes(BTreeMap<MatterStatus, RecipientRole>);

impl Default for StatusRoutes {
    /// Grants and registrations go to the client; a matter dying, lapsing
    /// or being abandoned goes to the responsible party; filings are quiet.
    fn default() -> Self {
        let mut routes = Self::empty();
        routes.set(MatterStatus::Granted, RecipientRole::Client);
        routes.set(MatterStatus::Registered, RecipientRole::Client);
        routes.set(MatterStatus::Dead, RecipientRole::Responsible);
        routes.set(MatterStatus::Lapsed, RecipientRole::Responsible);
        routes.set(MatterStatus::Abandoned, RecipientRole::Responsible);
        routes.set(MatterStatus::Filed, RecipientRole::None);
        routes
    }
}

impl StatusRoutes {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(&mut self, status: MatterStatus, role: RecipientRole) {
        self.0.insert(status, role);
    }

    pub fn role_for(&self, status: MatterStatus) -> RecipientRole {
        self.0.get(&status).copied().unwrap_or(RecipientRole::None)
    }
}

/// What the notifier did with a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent { recipient: String },
    /// Old and new status are equal.
    Unchanged,
    /// The new status routes to nobody.
    NotRouted,
    /// This transition was already notified today.
    Duplicate,
    /// The routed role has no contact on the matter. Dropped, not retried.
    Unresolved { role: RecipientRole },
    DispatchFailed { recipient: String, reason: String },
    /// The dedupe claim could not be read or written.
    StoreFailed { reason: String },
}

pub struct StatusNotifier {
    db: Database,
    dispatcher: Arc<dyn NotificationDispatcher>,
    routes: StatusRoutes,
    zone: CalendarZone,
    io_timeout: Duration,
}

impl StatusNotifier {
    pub fn new(
        db: Database,
        dispatcher: Arc<dyn NotificationDispatcher>,
        routes: StatusRoutes,
        io_timeout: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            routes,
            zone: CalendarZone::Local,
            io_timeout,
        }
    }

    /// Use `zone`'s calendar for the once-per-day key.
    pub fn with_zone(mut self, zone: CalendarZone) -> Self {
        self.zone = zone;
        self
    }

    pub async fn on_status_changed(
        &self,
        matter: &Matter,
        old: MatterStatus,
        new: MatterStatus,
    ) -> NotifyOutcome {
        self.notify(matter, old, new, None, Utc::now()).await
    }

    /// Notify from a recorded event, carrying its actor and timestamp.
    pub async fn on_event(&self, matter: &Matter, event: &StatusChangeEvent) -> NotifyOutcome {
        self.notify(
            matter,
            event.old_status,
            event.new_status,
            Some(event.actor.clone()),
            event.occurred_at,
        )
        .await
    }

    async fn notify(
        &self,
        matter: &Matter,
        old: MatterStatus,
        new: MatterStatus,
        actor: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> NotifyOutcome {
        if old == new {
            tracing::debug!(matter = %matter.reference, status = %new, "status unchanged");
            return NotifyOutcome::Unchanged;
        }

        let role = self.routes.role_for(new);
        if role == RecipientRole::None {
            tracing::debug!(matter = %matter.reference, %old, %new, "transition not routed");
            return NotifyOutcome::NotRouted;
        }

        let Some(recipient) = role.resolve(matter) else {
            tracing::warn!(
                matter = %matter.reference,
                %old,
                %new,
                role = role.as_str(),
                "no recipient for status notification, dropping"
            );
            return NotifyOutcome::Unresolved { role };
        };

        let claim = NotificationRecord {
            subject_id: matter.id,
            kind: NotificationKind::StatusChange,
            dedupe_key: format!("{old}->{new}"),
            day: self.zone.date_of(occurred_at),
            sent_at: Utc::now(),
        };

        match self.db.claim_notification(&claim) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(matter = %matter.reference, %old, %new, "status notification already sent today");
                return NotifyOutcome::Duplicate;
            }
            Err(e) => {
                tracing::error!(matter = %matter.reference, error = %e, "could not claim status notification");
                return NotifyOutcome::StoreFailed {
                    reason: e.to_string(),
                };
            }
        }

        let payload = NotificationPayload::StatusChanged {
            matter_id: matter.id,
            matter_reference: matter.reference.clone(),
            old_status: old,
            new_status: new,
            actor,
            occurred_at,
        };

        let sent = tokio::time::timeout(
            self.io_timeout,
            self.dispatcher
                .send(recipient, TemplateKind::StatusChanged, &payload),
        )
        .await;

        let reason = match sent {
            Ok(Ok(())) => {
                tracing::info!(matter = %matter.reference, %old, %new, recipient, "status notification sent");
                return NotifyOutcome::Sent {
                    recipient: recipient.to_string(),
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("dispatch timed out after {:?}", self.io_timeout),
        };

        // Let a retried write try again.
        if let Err(e) = self.db.release_notification(
            claim.subject_id,
            claim.kind,
            &claim.dedupe_key,
            claim.day,
        ) {
            tracing::error!(matter = %matter.reference, error = %e, "could not release status notification claim");
        }

        tracing::warn!(matter = %matter.reference, %old, %new, recipient, %reason, "status notification failed");
        NotifyOutcome::DispatchFailed {
            recipient: recipient.to_string(),
            reason,
        }
    }
}
