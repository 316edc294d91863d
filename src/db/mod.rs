mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::*;

/// Source of open tasks for the urgent-task job.
///
/// [`Database`] is the production implementation; the job only depends on
/// this trait so other stores can feed it.
pub trait TaskRepository: Send + Sync {
    /// Incomplete tasks due at or before `horizon`, plus incomplete tasks
    /// without a due date. Ordered by due date ascending, then id, with
    /// undated tasks last.
    fn open_tasks_due_by(&self, horizon: DateTime<Utc>) -> Result<Vec<TaskDeadline>>;
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "docket")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(dirs.data_dir().join("docket.db"))
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Matter operations
    // ============================================================

    pub fn get_all_matters(&self) -> Result<Vec<Matter>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, reference, title, status, client, responsible, created_at, updated_at
             FROM matters ORDER BY reference",
        )?;

        let matters = stmt
            .query_map([], row_to_matter)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(matters)
    }

    pub fn get_matter(&self, id: Uuid) -> Result<Option<Matter>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        get_matter_with(&conn, id)
    }

    pub fn create_matter(&self, input: CreateMatterInput) -> Result<Matter> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();
        let status = input.status.unwrap_or(MatterStatus::Pending);

        conn.execute(
            "INSERT INTO matters (id, reference, title, status, client, responsible, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &input.reference,
                &input.title,
                status.as_str(),
                &input.client,
                &input.responsible,
                format_datetime(now),
                format_datetime(now),
            ),
        )?;

        Ok(Matter {
            id,
            reference: input.reference,
            title: input.title,
            status,
            client: input.client,
            responsible: input.responsible,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn delete_matter(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute("DELETE FROM matters WHERE id = ?", [id.to_string()])?;
        Ok(rows > 0)
    }

    /// Commit a status transition and its history entry atomically.
    ///
    /// Returns `None` if the matter does not exist. Setting the current
    /// status again succeeds without writing an event.
    pub fn change_matter_status(
        &self,
        id: Uuid,
        input: ChangeStatusInput,
    ) -> Result<Option<StatusChangeResult>> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let Some(mut matter) = get_matter_with(&tx, id)? else {
            return Ok(None);
        };
        let previous_status = matter.status;

        if previous_status == input.status {
            return Ok(Some(StatusChangeResult {
                matter,
                previous_status,
                event: None,
            }));
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE matters SET status = ?, updated_at = ? WHERE id = ?",
            (input.status.as_str(), format_datetime(now), id.to_string()),
        )?;

        let event = StatusChangeEvent {
            id: Uuid::new_v4(),
            matter_id: id,
            old_status: previous_status,
            new_status: input.status,
            actor: input.actor,
            occurred_at: now,
        };
        tx.execute(
            "INSERT INTO status_changes (id, matter_id, old_status, new_status, actor, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                event.id.to_string(),
                id.to_string(),
                event.old_status.as_str(),
                event.new_status.as_str(),
                &event.actor,
                format_datetime(now),
            ),
        )?;
        tx.commit()?;

        matter.status = input.status;
        matter.updated_at = now;

        Ok(Some(StatusChangeResult {
            matter,
            previous_status,
            event: Some(event),
        }))
    }

    /// Status history for a matter, oldest first.
    pub fn get_status_history(&self, matter_id: Uuid) -> Result<Vec<StatusChangeEvent>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, matter_id, old_status, new_status, actor, occurred_at
             FROM status_changes WHERE matter_id = ? ORDER BY occurred_at, id",
        )?;

        let events = stmt
            .query_map([matter_id.to_string()], |row| {
                Ok(StatusChangeEvent {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    matter_id: parse_uuid(row.get::<_, String>(1)?),
                    old_status: parse_status(row, 2)?,
                    new_status: parse_status(row, 3)?,
                    actor: row.get(4)?,
                    occurred_at: parse_datetime(row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    // ============================================================
    // Task operations
    // ============================================================

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        get_task_with(&conn, id)
    }

    pub fn get_tasks_by_matter(&self, matter_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, matter_id, info, detail, due_date, assigned_to, done, done_at, created_at
             FROM tasks WHERE matter_id = ? ORDER BY due_date IS NULL, due_date, id",
        )?;

        let tasks = stmt
            .query_map([matter_id.to_string()], |row| row_to_task(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tasks)
    }

    pub fn create_task(&self, matter_id: Uuid, input: CreateTaskInput) -> Result<Task> {
        self.get_matter(matter_id)?
            .ok_or_else(|| anyhow::anyhow!("Matter not found"))?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO tasks (id, matter_id, info, detail, due_date, assigned_to, done, done_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?)",
            (
                id.to_string(),
                matter_id.to_string(),
                &input.info,
                &input.detail,
                input.due_date.map(format_datetime),
                &input.assigned_to,
                format_datetime(now),
            ),
        )?;

        Ok(Task {
            id,
            matter_id,
            info: input.info,
            detail: input.detail,
            due_date: input.due_date,
            assigned_to: input.assigned_to,
            done: false,
            done_at: None,
            created_at: now,
        })
    }

    /// Mark a task done. Completing an already completed task keeps the
    /// original completion time.
    pub fn complete_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        conn.execute(
            "UPDATE tasks SET done = 1, done_at = ? WHERE id = ? AND done = 0",
            (format_datetime(now), id.to_string()),
        )?;
        get_task_with(&conn, id)
    }

    /// Move a task's due date. Refused once the task is complete.
    pub fn reschedule_task(&self, id: Uuid, input: RescheduleTaskInput) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(task) = get_task_with(&conn, id)? else {
            return Ok(None);
        };
        if task.done {
            anyhow::bail!("Task is completed; its due date is locked");
        }

        conn.execute(
            "UPDATE tasks SET due_date = ? WHERE id = ? AND done = 0",
            (format_datetime(input.due_date), id.to_string()),
        )?;

        Ok(Some(Task {
            due_date: Some(input.due_date),
            ..task
        }))
    }

    // ============================================================
    // Notification records
    // ============================================================

    pub fn notification_recorded(
        &self,
        subject_id: Uuid,
        kind: NotificationKind,
        dedupe_key: &str,
        day: NaiveDate,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let found = conn
            .query_row(
                "SELECT 1 FROM notification_records
                 WHERE subject_id = ? AND kind = ? AND dedupe_key = ? AND day = ?",
                (
                    subject_id.to_string(),
                    kind.as_str(),
                    dedupe_key,
                    day.to_string(),
                ),
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Upsert records in one transaction. Rewriting an existing record only
    /// moves its `sent_at`.
    pub fn record_notifications(&self, records: &[NotificationRecord]) -> Result<()> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO notification_records (subject_id, kind, dedupe_key, day, sent_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(subject_id, kind, dedupe_key, day) DO UPDATE SET sent_at = excluded.sent_at",
            )?;
            for record in records {
                stmt.execute((
                    record.subject_id.to_string(),
                    record.kind.as_str(),
                    &record.dedupe_key,
                    record.day.to_string(),
                    format_datetime(record.sent_at),
                ))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a record only if none exists for its key. Returns `false` when
    /// another caller already holds it.
    pub fn claim_notification(&self, record: &NotificationRecord) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "INSERT OR IGNORE INTO notification_records (subject_id, kind, dedupe_key, day, sent_at)
             VALUES (?, ?, ?, ?, ?)",
            (
                record.subject_id.to_string(),
                record.kind.as_str(),
                &record.dedupe_key,
                record.day.to_string(),
                format_datetime(record.sent_at),
            ),
        )?;
        Ok(rows == 1)
    }

    pub fn release_notification(
        &self,
        subject_id: Uuid,
        kind: NotificationKind,
        dedupe_key: &str,
        day: NaiveDate,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM notification_records
             WHERE subject_id = ? AND kind = ? AND dedupe_key = ? AND day = ?",
            (
                subject_id.to_string(),
                kind.as_str(),
                dedupe_key,
                day.to_string(),
            ),
        )?;
        Ok(rows > 0)
    }

    pub fn get_notifications_for(&self, subject_id: Uuid) -> Result<Vec<NotificationRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT subject_id, kind, dedupe_key, day, sent_at
             FROM notification_records WHERE subject_id = ? ORDER BY day, kind, dedupe_key",
        )?;

        let records = stmt
            .query_map([subject_id.to_string()], |row| {
                let kind: String = row.get(1)?;
                let day: String = row.get(3)?;
                Ok(NotificationRecord {
                    subject_id: parse_uuid(row.get::<_, String>(0)?),
                    kind: NotificationKind::from_str(&kind).ok_or_else(|| {
                        invalid_column(1, format!("unknown notification kind '{kind}'"))
                    })?,
                    dedupe_key: row.get(2)?,
                    day: day
                        .parse::<NaiveDate>()
                        .map_err(|e| invalid_column(3, e.to_string()))?,
                    sent_at: parse_datetime(row.get::<_, String>(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    // ============================================================
    // Job locks
    // ============================================================

    /// Take the named lock for `holder` until `expires_at`.
    ///
    /// Succeeds if the lock is free or its previous lease expired at or
    /// before `now`; fails (returns `false`) while another lease is live.
    pub fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "INSERT INTO job_locks (name, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE job_locks.expires_at <= excluded.acquired_at",
            (name, holder, format_datetime(now), format_datetime(expires_at)),
        )?;
        Ok(rows == 1)
    }

    /// Move the lease's expiry to `expires_at`. Returns `false` if `holder`
    /// no longer owns the lock.
    pub fn renew_lock(&self, name: &str, holder: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE job_locks SET expires_at = ? WHERE name = ? AND holder = ?",
            (format_datetime(expires_at), name, holder),
        )?;
        Ok(rows == 1)
    }

    /// Drop the named lock if `holder` still owns it.
    pub fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "DELETE FROM job_locks WHERE name = ? AND holder = ?",
            (name, holder),
        )?;
        Ok(rows > 0)
    }

    pub fn lock_holder(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let holder = conn
            .query_row(
                "SELECT holder FROM job_locks WHERE name = ?",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }

    // ============================================================
    // Run log
    // ============================================================

    pub fn append_run_log(&self, entry: &RunLogEntry) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let failures = serde_json::to_string(&entry.counts.failures)?;
        conn.execute(
            "INSERT INTO job_runs (id, job, started_at, finished_at, outcome,
                scanned, urgent, overdue, notified, skipped, failed, failures)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                entry.id.to_string(),
                &entry.job,
                format_datetime(entry.started_at),
                format_datetime(entry.finished_at),
                entry.outcome.as_str(),
                entry.counts.scanned,
                entry.counts.urgent,
                entry.counts.overdue,
                entry.counts.notified,
                entry.counts.skipped,
                entry.counts.failed,
                failures,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn get_run_log(&self, job: Option<&str>, limit: usize) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, job, started_at, finished_at, outcome,
                scanned, urgent, overdue, notified, skipped, failed, failures
             FROM job_runs
             WHERE ?1 IS NULL OR job = ?1
             ORDER BY started_at DESC, id
             LIMIT ?2",
        )?;

        let entries = stmt
            .query_map((job, limit as i64), |row| {
                let outcome: String = row.get(4)?;
                let failures_json: String = row.get(11)?;
                Ok(RunLogEntry {
                    id: parse_uuid(row.get::<_, String>(0)?),
                    job: row.get(1)?,
                    started_at: parse_datetime(row.get::<_, String>(2)?),
                    finished_at: parse_datetime(row.get::<_, String>(3)?),
                    outcome: RunOutcome::from_str(&outcome).ok_or_else(|| {
                        invalid_column(4, format!("unknown run outcome '{outcome}'"))
                    })?,
                    counts: RunCounts {
                        scanned: row.get(5)?,
                        urgent: row.get(6)?,
                        overdue: row.get(7)?,
                        notified: row.get(8)?,
                        skipped: row.get(9)?,
                        failed: row.get(10)?,
                        failures: serde_json::from_str(&failures_json).map_err(|e| {
                            invalid_column(11, format!("unreadable run failures: {e}"))
                        })?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

impl TaskRepository for Database {
    fn open_tasks_due_by(&self, horizon: DateTime<Utc>) -> Result<Vec<TaskDeadline>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT t.id, t.matter_id, t.info, t.detail, t.due_date, t.assigned_to, t.done,
                    t.done_at, t.created_at, m.reference, m.responsible
             FROM tasks t JOIN matters m ON m.id = t.matter_id
             WHERE t.done = 0 AND (t.due_date IS NULL OR t.due_date <= ?)
             ORDER BY t.due_date IS NULL, t.due_date, t.id",
        )?;

        let tasks = stmt
            .query_map([format_datetime(horizon)], |row| {
                Ok(TaskDeadline {
                    task: row_to_task(row, 0)?,
                    matter_reference: row.get(9)?,
                    matter_responsible: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(tasks)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

fn get_matter_with(conn: &Connection, id: Uuid) -> Result<Option<Matter>> {
    let matter = conn
        .query_row(
            "SELECT id, reference, title, status, client, responsible, created_at, updated_at
             FROM matters WHERE id = ?",
            [id.to_string()],
            row_to_matter,
        )
        .optional()?;
    Ok(matter)
}

fn get_task_with(conn: &Connection, id: Uuid) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT id, matter_id, info, detail, due_date, assigned_to, done, done_at, created_at
             FROM tasks WHERE id = ?",
            [id.to_string()],
            |row| row_to_task(row, 0),
        )
        .optional()?;
    Ok(task)
}

fn row_to_matter(row: &Row<'_>) -> rusqlite::Result<Matter> {
    Ok(Matter {
        id: parse_uuid(row.get::<_, String>(0)?),
        reference: row.get(1)?,
        title: row.get(2)?,
        status: parse_status(row, 3)?,
        client: row.get(4)?,
        responsible: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
        updated_at: parse_datetime(row.get::<_, String>(7)?),
    })
}

/// Map the nine task columns starting at `first`.
fn row_to_task(row: &Row<'_>, first: usize) -> rusqlite::Result<Task> {
    Ok(Task {
        id: parse_uuid(row.get::<_, String>(first)?),
        matter_id: parse_uuid(row.get::<_, String>(first + 1)?),
        info: row.get(first + 2)?,
        detail: row.get(first + 3)?,
        due_date: row
            .get::<_, Option<String>>(first + 4)?
            .map(parse_datetime),
        assigned_to: row.get(first + 5)?,
        done: row.get::<_, i32>(first + 6)? != 0,
        done_at: row
            .get::<_, Option<String>>(first + 7)?
            .map(parse_datetime),
        created_at: parse_datetime(row.get::<_, String>(first + 8)?),
    })
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<MatterStatus> {
    let raw: String = row.get(idx)?;
    MatterStatus::from_str(&raw)
        .ok_or_else(|| invalid_column(idx, format!("unknown matter status '{raw}'")))
}

fn invalid_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

/// Fixed-width UTC timestamps, so SQL string comparison orders them.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
