//! Deadline and status-change notifications for an IP matter docket.
//!
//! - [`urgency`] classifies task deadlines as normal, urgent or overdue.
//! - [`notifier`] tells the right party when a matter changes status.
//! - [`jobs`] holds the daily urgent-task reminder run, guarded by a
//!   durable [`lock`] and recorded in the run log.
//! - [`dispatch`] is the outbound delivery seam.

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod jobs;
pub mod lock;
pub mod models;
pub mod notifier;
pub mod scheduler;
pub mod urgency;
