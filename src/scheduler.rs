//! Daily trigger for the urgent-task job.
//!
//! The scheduler only decides *when* to run. Overlap protection is the
//! job's run-lock, since several scheduler processes may share a database.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::jobs::{JobOutcome, UrgentTaskJob, URGENT_TASKS_JOB};

/// Time zone whose calendar drives the daily trigger and the
/// once-per-day notification keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalendarZone {
    /// The host's local time zone.
    #[default]
    Local,
    Named(Tz),
}

impl CalendarZone {
    /// `local` or an IANA name such as `Europe/Berlin`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("local") {
            return Ok(Self::Local);
        }
        raw.parse::<Tz>()
            .map(Self::Named)
            .map_err(|e| e.to_string())
    }

    /// Calendar date of `at` in this zone.
    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Local => at.with_timezone(&Local).date_naive(),
            Self::Named(tz) => at.with_timezone(tz).date_naive(),
        }
    }

    /// Next wall-clock `at` in this zone strictly after `now`.
    pub fn next_run(&self, now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
        match self {
            Self::Local => next_run_after(&now.with_timezone(&Local), at).with_timezone(&Utc),
            Self::Named(tz) => next_run_after(&now.with_timezone(tz), at).with_timezone(&Utc),
        }
    }
}

/// First occurrence of wall-clock time `at` strictly after `now`.
///
/// Days where `at` does not exist (a DST gap) are skipped; ambiguous times
/// take the earlier instant.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();

    for _ in 0..3 {
        if let Some(candidate) = date.and_time(at).and_local_timezone(tz.clone()).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }

    now.clone() + Duration::days(1)
}

/// Run `job` every day at wall-clock time `at` in `zone` until `shutdown` fires.
///
/// A failed run is logged and retried at the next tick, never within the
/// same day. `shutdown` is also handed to the job, which stops at the next
/// batch boundary.
pub async fn run_daily(
    job: Arc<UrgentTaskJob>,
    at: NaiveTime,
    zone: CalendarZone,
    shutdown: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let next = zone.next_run(now, at);
        let wait = (next - now).to_std().unwrap_or_default();
        tracing::info!(job = URGENT_TASKS_JOB, next_run = %next, "next run scheduled");

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(job = URGENT_TASKS_JOB, "scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match job.run(Utc::now(), &shutdown).await {
            Ok(JobOutcome::Skipped) => {
                tracing::info!(job = URGENT_TASKS_JOB, "run skipped, lock held elsewhere");
            }
            Ok(JobOutcome::Completed(entry)) => {
                tracing::info!(
                    job = URGENT_TASKS_JOB,
                    outcome = entry.outcome.as_str(),
                    failed = entry.counts.failed,
                    "scheduled run done"
                );
            }
            Err(e) => {
                tracing::error!(job = URGENT_TASKS_JOB, error = %e, "scheduled run failed, will retry at next tick");
            }
        }
    }
}
