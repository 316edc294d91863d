//! Domain models for the docket.
//!
//! # Core Concepts
//!
//! ## Permanent Entities
//!
//! - [`Matter`]: A tracked IP case (patent or trademark application or registration).
//!   Its workflow status is always one of [`MatterStatus`].
//! - [`Task`]: A deadline-bound action item owned by a matter (deleted with it).
//! - [`StatusChangeEvent`]: Append-only record of a matter status transition,
//!   attributable to an actor and a timestamp.
//!
//! ## Bookkeeping
//!
//! - [`NotificationRecord`]: Proof that a notification went out on a given day,
//!   used to keep sends idempotent across retries and reruns.
//! - [`RunLogEntry`]: Summary of one scheduled job run.

mod matter;
mod notification;
mod run_log;
mod task;

pub use matter::*;
pub use notification::*;
pub use run_log::*;
pub use task::*;
