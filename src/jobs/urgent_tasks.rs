use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Database, TaskRepository};
use crate::dispatch::{DigestEntry, NotificationDispatcher, NotificationPayload, TemplateKind};
use crate::lock::{RunLock, RunLockGuard};
use crate::scheduler::CalendarZone;
use crate::models::*;
use crate::urgency::{Thresholds, UrgencyTier};

/// Job name, also used as the run-lock key and in the run log.
pub const URGENT_TASKS_JOB: &str = "tasks:send-urgent-notifications";

#[derive(Debug, Error)]
pub enum JobError {
    /// The open-task query failed or timed out. Nothing was dispatched.
    #[error("failed to load open tasks: {0}")]
    DataLoad(String),
    /// The run-lock could not be read or written.
    #[error("run-lock unavailable: {0}")]
    Lock(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// A previous run still holds the lock.
    Skipped,
    Completed(RunLogEntry),
}

impl JobOutcome {
    pub fn summary(&self) -> Option<&RunLogEntry> {
        match self {
            Self::Skipped => None,
            Self::Completed(entry) => Some(entry),
        }
    }
}

/// One digest per recipient.
struct Batch {
    recipient: String,
    entries: Vec<DigestEntry>,
}

/// Daily scan of open tasks that sends each recipient one digest of their
/// urgent and overdue tasks.
pub struct UrgentTaskJob {
    db: Database,
    tasks: Arc<dyn TaskRepository>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    thresholds: Thresholds,
    zone: CalendarZone,
    io_timeout: Duration,
    lock: RunLock,
}

impl UrgentTaskJob {
    pub fn new(db: Database, dispatcher: Arc<dyn NotificationDispatcher>, config: &Config) -> Self {
        Self {
            tasks: Arc::new(db.clone()),
            lock: RunLock::new(db.clone(), URGENT_TASKS_JOB, config.lock_ttl),
            db,
            dispatcher,
            thresholds: config.thresholds,
            zone: config.zone,
            io_timeout: config.io_timeout,
        }
    }

    /// Load tasks from another store instead of the job's database.
    pub fn with_task_repository(mut self, tasks: Arc<dyn TaskRepository>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Run once for the calendar day (in the configured zone) containing
    /// `as_of`.
    ///
    /// Returns [`JobOutcome::Skipped`] without side effects (other than the
    /// run-log line) if another run holds the lock. The lease is renewed
    /// while the run is in progress; if it is lost the run stops as if
    /// cancelled. `cancel` is honoured between recipient batches only.
    pub async fn run(
        &self,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let started_at = Utc::now();

        let guard = match self.lock.try_acquire(started_at) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::info!(job = URGENT_TASKS_JOB, "previous run still holds the lock, skipping");
                self.append_log(started_at, RunOutcome::Skipped, RunCounts::default());
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!(job = URGENT_TASKS_JOB, error = %reason, "could not acquire run-lock");
                self.append_log(started_at, RunOutcome::Failed, fatal_counts(&reason));
                return Err(JobError::Lock(reason));
            }
        };

        tracing::info!(job = URGENT_TASKS_JOB, %as_of, "run started");

        // Cancelled by the caller, or by the heartbeat if the lease is lost.
        let stop = cancel.child_token();
        let result = {
            let work = self.run_locked(as_of, &stop, &guard, started_at);
            tokio::pin!(work);
            tokio::select! {
                result = &mut work => result,
                () = guard.keep_alive(&stop) => work.await,
            }
        };

        if let Err(e) = guard.release() {
            tracing::error!(job = URGENT_TASKS_JOB, error = %e, "failed to release run-lock");
        }
        result
    }

    async fn run_locked(
        &self,
        as_of: DateTime<Utc>,
        cancel: &CancellationToken,
        lease: &RunLockGuard,
        started_at: DateTime<Utc>,
    ) -> Result<JobOutcome, JobError> {
        let deadlines = match self.load(as_of).await {
            Ok(deadlines) => deadlines,
            Err(reason) => {
                tracing::error!(job = URGENT_TASKS_JOB, error = %reason, "data load failed, aborting run");
                self.append_log(started_at, RunOutcome::Failed, fatal_counts(&reason));
                return Err(JobError::DataLoad(reason));
            }
        };

        let mut counts = RunCounts {
            scanned: deadlines.len() as u32,
            ..RunCounts::default()
        };
        let batches = match self.plan(deadlines, as_of, &mut counts) {
            Ok(batches) => batches,
            Err(reason) => {
                tracing::error!(job = URGENT_TASKS_JOB, error = %reason, "notification lookup failed, aborting run");
                self.append_log(started_at, RunOutcome::Failed, fatal_counts(&reason));
                return Err(JobError::DataLoad(reason));
            }
        };

        let mut cancelled = false;
        for (i, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(
                    job = URGENT_TASKS_JOB,
                    remaining = batches.len() - i,
                    "cancellation requested, stopping before next batch"
                );
                cancelled = true;
                break;
            }
            if !still_held(lease) {
                tracing::error!(
                    job = URGENT_TASKS_JOB,
                    remaining = batches.len() - i,
                    "run-lock lost, stopping before next batch"
                );
                cancelled = true;
                break;
            }
            self.dispatch_batch(batch, as_of, &mut counts).await;
        }

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if counts.failed > 0 {
            RunOutcome::CompletedWithFailures
        } else {
            RunOutcome::Completed
        };

        tracing::info!(
            job = URGENT_TASKS_JOB,
            outcome = outcome.as_str(),
            scanned = counts.scanned,
            urgent = counts.urgent,
            overdue = counts.overdue,
            notified = counts.notified,
            skipped = counts.skipped,
            failed = counts.failed,
            "run finished"
        );

        let entry = self.append_log(started_at, outcome, counts);
        Ok(JobOutcome::Completed(entry))
    }

    async fn load(&self, as_of: DateTime<Utc>) -> Result<Vec<TaskDeadline>, String> {
        let tasks = Arc::clone(&self.tasks);
        let horizon = self.thresholds.horizon(as_of);
        let query = tokio::task::spawn_blocking(move || tasks.open_tasks_due_by(horizon));

        match tokio::time::timeout(self.io_timeout, query).await {
            Ok(Ok(Ok(deadlines))) => Ok(deadlines),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(e)) => Err(format!("task store worker failed: {e}")),
            Err(_) => Err(format!(
                "task store did not answer within {:?}",
                self.io_timeout
            )),
        }
    }

    /// Classify, dedupe, and group tasks by recipient. Batches come out in
    /// order of their earliest task.
    fn plan(
        &self,
        deadlines: Vec<TaskDeadline>,
        as_of: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<Vec<Batch>, String> {
        let day = self.zone.date_of(as_of);
        let mut batches: Vec<Batch> = Vec::new();
        let mut by_recipient: HashMap<String, usize> = HashMap::new();

        for deadline in deadlines {
            let task = &deadline.task;

            let tier = match self.thresholds.classify(task, as_of) {
                Ok(tier) => tier,
                Err(e) => {
                    tracing::warn!(task = %task.id, matter = %deadline.matter_reference, error = %e, "skipping invalid task");
                    counts.skipped += 1;
                    continue;
                }
            };
            match tier {
                UrgencyTier::Normal => continue,
                UrgencyTier::Urgent => counts.urgent += 1,
                UrgencyTier::Overdue => counts.overdue += 1,
            }
            let Some(due_date) = task.due_date else {
                continue;
            };

            let already_sent = self
                .db
                .notification_recorded(task.id, NotificationKind::TaskDeadline, "", day)
                .map_err(|e| format!("{e:#}"))?;
            if already_sent {
                tracing::debug!(task = %task.id, %day, "already notified today");
                counts.skipped += 1;
                continue;
            }

            let Some(recipient) = deadline.recipient() else {
                tracing::warn!(task = %task.id, matter = %deadline.matter_reference, "no assignee or responsible party, skipping");
                counts.skipped += 1;
                continue;
            };

            let idx = *by_recipient
                .entry(recipient.to_string())
                .or_insert_with(|| {
                    batches.push(Batch {
                        recipient: recipient.to_string(),
                        entries: Vec::new(),
                    });
                    batches.len() - 1
                });
            batches[idx].entries.push(DigestEntry {
                task_id: task.id,
                matter_id: task.matter_id,
                matter_reference: deadline.matter_reference.clone(),
                info: task.info.clone(),
                detail: task.detail.clone(),
                due_date,
                tier,
            });
        }

        Ok(batches)
    }

    async fn dispatch_batch(&self, batch: &Batch, as_of: DateTime<Utc>, counts: &mut RunCounts) {
        let payload = NotificationPayload::UrgentTasks {
            as_of,
            tasks: batch.entries.clone(),
        };

        let sent = tokio::time::timeout(
            self.io_timeout,
            self.dispatcher
                .send(&batch.recipient, TemplateKind::UrgentTaskDigest, &payload),
        )
        .await;

        let reason = match sent {
            Ok(Ok(())) => {
                let sent_at = Utc::now();
                let records: Vec<NotificationRecord> = batch
                    .entries
                    .iter()
                    .map(|entry| NotificationRecord {
                        subject_id: entry.task_id,
                        kind: NotificationKind::TaskDeadline,
                        dedupe_key: String::new(),
                        day: self.zone.date_of(as_of),
                        sent_at,
                    })
                    .collect();

                match self.db.record_notifications(&records) {
                    Ok(()) => {
                        tracing::info!(
                            recipient = %batch.recipient,
                            tasks = batch.entries.len(),
                            "urgent task digest sent"
                        );
                        counts.notified += batch.entries.len() as u32;
                        return;
                    }
                    Err(e) => format!("delivered but not recorded: {e:#}"),
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("dispatch timed out after {:?}", self.io_timeout),
        };

        tracing::warn!(recipient = %batch.recipient, %reason, "urgent task digest failed");
        counts.failed += 1;
        counts.failures.push(RunFailure {
            recipient: batch.recipient.clone(),
            reason,
        });
    }

    fn append_log(
        &self,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        counts: RunCounts,
    ) -> RunLogEntry {
        let entry = RunLogEntry {
            id: Uuid::new_v4(),
            job: URGENT_TASKS_JOB.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            counts,
        };
        if let Err(e) = self.db.append_run_log(&entry) {
            tracing::error!(job = URGENT_TASKS_JOB, error = %e, "failed to append run log");
        }
        entry
    }
}

fn still_held(lease: &RunLockGuard) -> bool {
    match lease.renew(Utc::now()) {
        Ok(held) => held,
        Err(e) => {
            tracing::error!(job = URGENT_TASKS_JOB, error = %e, "failed to renew run-lock");
            false
        }
    }
}

fn fatal_counts(reason: &str) -> RunCounts {
    RunCounts {
        failures: vec![RunFailure {
            recipient: "-".to_string(),
            reason: reason.to_string(),
        }],
        ..RunCounts::default()
    }
}
