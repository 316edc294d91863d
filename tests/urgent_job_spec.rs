use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docket_notify::config::Config;
use docket_notify::db::{Database, TaskRepository};
use docket_notify::dispatch::{
    DispatchError, MemoryDispatcher, NotificationDispatcher, NotificationPayload, TemplateKind,
};
use docket_notify::jobs::{JobError, JobOutcome, UrgentTaskJob, URGENT_TASKS_JOB};
use docket_notify::lock::RunLock;
use docket_notify::models::*;
use docket_notify::scheduler::CalendarZone;
use docket_notify::urgency::UrgencyTier;

struct Fixture {
    db: Database,
    dispatcher: MemoryDispatcher,
    job: UrgentTaskJob,
    as_of: DateTime<Utc>,
}

fn setup() -> Fixture {
    setup_with(Config::default())
}

fn setup_with(config: Config) -> Fixture {
    let db = Database::open_memory().expect("Failed to create database");
    db.migrate().expect("Failed to migrate");
    let dispatcher = MemoryDispatcher::new();
    let job = UrgentTaskJob::new(db.clone(), Arc::new(dispatcher.clone()), &config);
    Fixture {
        db,
        dispatcher,
        job,
        as_of: Utc::now(),
    }
}

fn matter(db: &Database, reference: &str, responsible: Option<&str>) -> Matter {
    db.create_matter(CreateMatterInput {
        reference: reference.to_string(),
        title: "Trademark renewal".to_string(),
        status: Some(MatterStatus::Registered),
        client: Some("client@acme.example".to_string()),
        responsible: responsible.map(str::to_string),
    })
    .expect("Failed to create matter")
}

fn task(db: &Database, matter_id: Uuid, info: &str, due: Option<DateTime<Utc>>) -> Task {
    db.create_task(matter_id, CreateTaskInput {
        info: info.to_string(),
        detail: None,
        due_date: due,
        assigned_to: None,
    })
    .expect("Failed to create task")
}

fn days(n: i64) -> chrono::Duration {
    chrono::Duration::days(n)
}

fn summary(outcome: JobOutcome) -> RunLogEntry {
    match outcome {
        JobOutcome::Completed(entry) => entry,
        JobOutcome::Skipped => panic!("run was skipped"),
    }
}

fn digest_task_ids(payload: &NotificationPayload) -> Vec<Uuid> {
    match payload {
        NotificationPayload::UrgentTasks { tasks, .. } => tasks.iter().map(|t| t.task_id).collect(),
        other => panic!("unexpected payload {other:?}"),
    }
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn task_due_yesterday_is_notified_once() {
        let f = setup();
        let m = matter(&f.db, "ACME-T-7", Some("pat@firm.example"));
        let t = task(&f.db, m.id, "Renewal grace period ends", Some(f.as_of - days(1)));

        let entry = summary(assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await));

        assert_eq!(entry.outcome, RunOutcome::Completed);
        assert_eq!(entry.counts.scanned, 1);
        assert_eq!(entry.counts.overdue, 1);
        assert_eq!(entry.counts.notified, 1);

        let sent = f.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "pat@firm.example");
        assert_eq!(sent[0].template, TemplateKind::UrgentTaskDigest);
        match &sent[0].payload {
            NotificationPayload::UrgentTasks { tasks, .. } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].task_id, t.id);
                assert_eq!(tasks[0].tier, UrgencyTier::Overdue);
                assert_eq!(tasks[0].matter_reference, "ACME-T-7");
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let records = f.db.get_notifications_for(t.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].day, Config::default().zone.date_of(f.as_of));
    }

    #[tokio::test]
    async fn tasks_are_batched_per_recipient_in_due_order() {
        let f = setup();
        let a = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        let b = matter(&f.db, "ACME-P-2", Some("sam@firm.example"));
        let later = task(&f.db, a.id, "Later", Some(f.as_of + days(10)));
        let sooner = task(&f.db, a.id, "Sooner", Some(f.as_of + days(2)));
        let other = task(&f.db, b.id, "Other", Some(f.as_of + days(5)));

        let entry = summary(assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await));
        assert_eq!(entry.counts.urgent, 3);
        assert_eq!(entry.counts.notified, 3);

        let sent = f.dispatcher.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].recipient, "pat@firm.example");
        assert_eq!(digest_task_ids(&sent[0].payload), vec![sooner.id, later.id]);
        assert_eq!(sent[1].recipient, "sam@firm.example");
        assert_eq!(digest_task_ids(&sent[1].payload), vec![other.id]);
    }

    #[tokio::test]
    async fn assignee_takes_precedence_over_responsible_party() {
        let f = setup();
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        f.db.create_task(m.id, CreateTaskInput {
            info: "Docket check".to_string(),
            detail: None,
            due_date: Some(f.as_of + days(1)),
            assigned_to: Some("para@firm.example".to_string()),
        })
        .unwrap();

        assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await);

        assert_eq!(f.dispatcher.sent_to("para@firm.example").len(), 1);
        assert!(f.dispatcher.sent_to("pat@firm.example").is_empty());
    }

    #[tokio::test]
    async fn normal_and_completed_tasks_are_left_out() {
        let f = setup();
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        task(&f.db, m.id, "Far off", Some(f.as_of + days(40)));
        let done = task(&f.db, m.id, "Already filed", Some(f.as_of - days(2)));
        f.db.complete_task(done.id).unwrap();

        let entry = summary(assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await));

        assert_eq!(entry.counts.scanned, 0);
        assert_eq!(entry.counts.notified, 0);
        assert!(f.dispatcher.sent().is_empty());
    }

    #[tokio::test]
    async fn invalid_and_unroutable_tasks_are_skipped_not_fatal() {
        let f = setup();
        let staffed = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        let unstaffed = matter(&f.db, "ACME-P-2", None);
        task(&f.db, staffed.id, "No due date", None);
        task(&f.db, unstaffed.id, "Nobody to tell", Some(f.as_of + days(1)));
        let good = task(&f.db, staffed.id, "Real deadline", Some(f.as_of + days(1)));

        let entry = summary(assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await));

        assert_eq!(entry.outcome, RunOutcome::Completed);
        assert_eq!(entry.counts.scanned, 3);
        assert_eq!(entry.counts.skipped, 2);
        assert_eq!(entry.counts.notified, 1);
        assert_eq!(digest_task_ids(&f.dispatcher.sent()[0].payload), vec![good.id]);
    }
}

mod idempotence {
    use super::*;

    #[tokio::test]
    async fn second_run_on_the_same_day_sends_nothing() {
        let f = setup();
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        let t = task(&f.db, m.id, "Pay annuity", Some(f.as_of + days(3)));

        let first = summary(assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await));
        let second = summary(assert_ok!(
            f.job
                .run(f.as_of + chrono::Duration::minutes(5), &CancellationToken::new())
                .await
        ));

        assert_eq!(first.counts.notified, 1);
        assert_eq!(second.counts.notified, 0);
        assert_eq!(second.counts.skipped, 1);
        assert_eq!(f.dispatcher.sent().len(), 1);
        assert_eq!(f.db.get_notifications_for(t.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn day_follows_the_configured_calendar_not_utc() {
        let config = Config {
            zone: CalendarZone::Named(chrono_tz::Asia::Tokyo),
            ..Config::default()
        };
        let f = setup_with(config);
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        let t = task(
            &f.db,
            m.id,
            "Pay annuity",
            Some(Utc.with_ymd_and_hms(2026, 5, 9, 0, 0, 0).unwrap()),
        );

        // 10:00 on 5 May in Tokyo, then 08:00 on 6 May: same UTC date.
        let manual = Utc.with_ymd_and_hms(2026, 5, 5, 1, 0, 0).unwrap();
        let scheduled = Utc.with_ymd_and_hms(2026, 5, 5, 23, 0, 0).unwrap();

        let first = summary(assert_ok!(f.job.run(manual, &CancellationToken::new()).await));
        let second = summary(assert_ok!(f.job.run(scheduled, &CancellationToken::new()).await));

        assert_eq!(first.counts.notified, 1);
        assert_eq!(second.counts.notified, 1);
        assert_eq!(second.counts.skipped, 0);

        let days: Vec<NaiveDate> = f
            .db
            .get_notifications_for(t.id)
            .unwrap()
            .iter()
            .map(|r| r.day)
            .collect();
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2026, 5, 5).unwrap(),
                NaiveDate::from_ymd_opt(2026, 5, 6).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn next_day_sends_again() {
        let f = setup();
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        let t = task(&f.db, m.id, "Pay annuity", Some(f.as_of + days(3)));

        assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await);
        assert_ok!(f.job.run(f.as_of + days(1), &CancellationToken::new()).await);

        assert_eq!(f.dispatcher.sent().len(), 2);
        assert_eq!(f.db.get_notifications_for(t.id).unwrap().len(), 2);
    }
}

/// Delivers after a fixed delay.
struct SlowDispatcher {
    inner: MemoryDispatcher,
    delay: Duration,
}

#[async_trait]
impl NotificationDispatcher for SlowDispatcher {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(recipient, template, payload).await
    }
}

/// Delivers, then hands the job's lease to another holder, as if the lease
/// had expired and been reclaimed elsewhere.
struct LeaseThief {
    inner: MemoryDispatcher,
    db: Database,
}

#[async_trait]
impl NotificationDispatcher for LeaseThief {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError> {
        self.inner.send(recipient, template, payload).await?;
        if let Some(holder) = self.db.lock_holder(URGENT_TASKS_JOB).unwrap() {
            self.db.release_lock(URGENT_TASKS_JOB, &holder).unwrap();
        }
        let now = Utc::now();
        self.db
            .try_acquire_lock(URGENT_TASKS_JOB, "other-node", now, now + chrono::Duration::hours(1))
            .unwrap();
        Ok(())
    }
}

mod overlap {
    use super::*;

    #[tokio::test]
    async fn held_lock_skips_without_side_effects() {
        let f = setup();
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        let t = task(&f.db, m.id, "Pay annuity", Some(f.as_of - days(1)));

        let other_run = RunLock::new(f.db.clone(), URGENT_TASKS_JOB, Duration::from_secs(600));
        let _held = other_run.try_acquire(Utc::now()).unwrap().expect("lock free");

        let outcome = assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await);

        assert_eq!(outcome, JobOutcome::Skipped);
        assert!(f.dispatcher.sent().is_empty());
        assert!(f.db.get_notifications_for(t.id).unwrap().is_empty());

        let runs = f.db.get_run_log(Some(URGENT_TASKS_JOB), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Skipped);
    }

    #[tokio::test]
    async fn lock_is_released_after_a_run() {
        let f = setup();

        assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await);

        assert!(f.db.lock_holder(URGENT_TASKS_JOB).unwrap().is_none());
        let again = assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await);
        assert!(matches!(again, JobOutcome::Completed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_longer_than_the_lease_still_excludes_others() {
        let config = Config {
            lock_ttl: Duration::from_millis(200),
            ..Config::default()
        };
        let f = setup_with(config.clone());
        let m = matter(&f.db, "ACME-P-1", Some("pat@firm.example"));
        task(&f.db, m.id, "Pay annuity", Some(f.as_of + days(2)));

        let slow = MemoryDispatcher::new();
        let first = Arc::new(UrgentTaskJob::new(
            f.db.clone(),
            Arc::new(SlowDispatcher {
                inner: slow.clone(),
                delay: Duration::from_millis(600),
            }),
            &config,
        ));
        let as_of = f.as_of;
        let running = {
            let first = first.clone();
            tokio::spawn(async move { first.run(as_of, &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = UrgentTaskJob::new(f.db.clone(), Arc::new(f.dispatcher.clone()), &config);
        let overlapping = assert_ok!(second.run(as_of, &CancellationToken::new()).await);
        assert_eq!(overlapping, JobOutcome::Skipped);

        let entry = summary(assert_ok!(running.await.unwrap()));
        assert_eq!(entry.outcome, RunOutcome::Completed);
        assert_eq!(slow.sent().len(), 1);
        assert!(f.dispatcher.sent().is_empty());
        assert!(f.db.lock_holder(URGENT_TASKS_JOB).unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_lease_stops_before_the_next_batch() {
        let f = setup();
        let a = matter(&f.db, "ACME-P-1", Some("a@firm.example"));
        let b = matter(&f.db, "ACME-P-2", Some("b@firm.example"));
        task(&f.db, a.id, "First", Some(f.as_of + days(1)));
        let later = task(&f.db, b.id, "Second", Some(f.as_of + days(2)));

        let recorder = MemoryDispatcher::new();
        let job = UrgentTaskJob::new(
            f.db.clone(),
            Arc::new(LeaseThief {
                inner: recorder.clone(),
                db: f.db.clone(),
            }),
            &Config::default(),
        );

        let entry = summary(assert_ok!(job.run(f.as_of, &CancellationToken::new()).await));

        assert_eq!(entry.outcome, RunOutcome::Cancelled);
        assert_eq!(recorder.sent().len(), 1);
        assert!(f.db.get_notifications_for(later.id).unwrap().is_empty());
        assert_eq!(
            f.db.lock_holder(URGENT_TASKS_JOB).unwrap().as_deref(),
            Some("other-node")
        );
    }
}

mod partial_failure {
    use super::*;

    #[tokio::test]
    async fn one_failing_recipient_does_not_stop_the_others() {
        let f = setup();
        let mut tasks = Vec::new();
        for (i, who) in ["a@firm.example", "b@firm.example", "c@firm.example"].into_iter().enumerate() {
            let m = matter(&f.db, &format!("ACME-P-{i}"), Some(who));
            tasks.push(task(&f.db, m.id, "Deadline", Some(f.as_of + days(i as i64 + 1))));
        }
        f.dispatcher.fail_for("b@firm.example");

        let entry = summary(assert_ok!(f.job.run(f.as_of, &CancellationToken::new()).await));

        assert_eq!(entry.outcome, RunOutcome::CompletedWithFailures);
        assert_eq!(entry.counts.notified, 2);
        assert_eq!(entry.counts.failed, 1);
        assert_eq!(entry.counts.failures.len(), 1);
        assert_eq!(entry.counts.failures[0].recipient, "b@firm.example");

        assert_eq!(f.dispatcher.sent_to("a@firm.example").len(), 1);
        assert_eq!(f.dispatcher.sent_to("c@firm.example").len(), 1);
        assert_eq!(f.db.get_notifications_for(tasks[0].id).unwrap().len(), 1);
        assert!(f.db.get_notifications_for(tasks[1].id).unwrap().is_empty());
        assert_eq!(f.db.get_notifications_for(tasks[2].id).unwrap().len(), 1);

        let runs = f.db.get_run_log(Some(URGENT_TASKS_JOB), 1).unwrap();
        assert_eq!(runs[0].counts.failures[0].recipient, "b@firm.example");
    }
}

struct BrokenStore;

impl TaskRepository for BrokenStore {
    fn open_tasks_due_by(&self, _horizon: DateTime<Utc>) -> anyhow::Result<Vec<TaskDeadline>> {
        anyhow::bail!("connection refused")
    }
}

struct SlowStore;

impl TaskRepository for SlowStore {
    fn open_tasks_due_by(&self, _horizon: DateTime<Utc>) -> anyhow::Result<Vec<TaskDeadline>> {
        std::thread::sleep(Duration::from_millis(300));
        Ok(Vec::new())
    }
}

mod data_load {
    use super::*;

    #[tokio::test]
    async fn load_failure_is_fatal_and_releases_the_lock() {
        let f = setup();
        let job = UrgentTaskJob::new(f.db.clone(), Arc::new(f.dispatcher.clone()), &Config::default())
            .with_task_repository(Arc::new(BrokenStore));

        let err = assert_err!(job.run(f.as_of, &CancellationToken::new()).await);

        assert!(matches!(err, JobError::DataLoad(ref reason) if reason.contains("connection refused")));
        assert!(f.db.lock_holder(URGENT_TASKS_JOB).unwrap().is_none());
        assert!(f.dispatcher.sent().is_empty());

        let runs = f.db.get_run_log(Some(URGENT_TASKS_JOB), 1).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Failed);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let config = Config {
            io_timeout: Duration::from_millis(20),
            ..Config::default()
        };
        let f = setup_with(config.clone());
        let job = UrgentTaskJob::new(f.db.clone(), Arc::new(f.dispatcher.clone()), &config)
            .with_task_repository(Arc::new(SlowStore));

        let err = assert_err!(job.run(f.as_of, &CancellationToken::new()).await);

        assert!(matches!(err, JobError::DataLoad(ref reason) if reason.contains("did not answer")));
        assert!(f.db.lock_holder(URGENT_TASKS_JOB).unwrap().is_none());
    }
}

/// Cancels the run as soon as the first batch has been delivered.
struct CancelAfterFirst {
    inner: MemoryDispatcher,
    token: CancellationToken,
}

#[async_trait]
impl NotificationDispatcher for CancelAfterFirst {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateKind,
        payload: &NotificationPayload,
    ) -> Result<(), DispatchError> {
        self.inner.send(recipient, template, payload).await?;
        self.token.cancel();
        Ok(())
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn stops_at_the_next_batch_boundary() {
        let f = setup();
        let a = matter(&f.db, "ACME-P-1", Some("a@firm.example"));
        let b = matter(&f.db, "ACME-P-2", Some("b@firm.example"));
        let a1 = task(&f.db, a.id, "First", Some(f.as_of + days(1)));
        let a2 = task(&f.db, a.id, "Second", Some(f.as_of + days(4)));
        let b1 = task(&f.db, b.id, "Third", Some(f.as_of + days(2)));

        let token = CancellationToken::new();
        let recorder = MemoryDispatcher::new();
        let job = UrgentTaskJob::new(
            f.db.clone(),
            Arc::new(CancelAfterFirst {
                inner: recorder.clone(),
                token: token.clone(),
            }),
            &Config::default(),
        );

        let entry = summary(assert_ok!(job.run(f.as_of, &token).await));

        assert_eq!(entry.outcome, RunOutcome::Cancelled);
        assert_eq!(entry.counts.notified, 2);
        assert_eq!(recorder.sent().len(), 1);
        assert_eq!(f.db.get_notifications_for(a1.id).unwrap().len(), 1);
        assert_eq!(f.db.get_notifications_for(a2.id).unwrap().len(), 1);
        assert!(f.db.get_notifications_for(b1.id).unwrap().is_empty());
        assert!(f.db.lock_holder(URGENT_TASKS_JOB).unwrap().is_none());
    }
}
