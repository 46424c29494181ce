//! Cron-fidelity and once-job lifecycle tests for the scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use devclaw::db::Store;
use devclaw::scheduler::{JobCommand, JobHandler, JobKind, Scheduler, SchedulerError};
use serde_json::json;

struct CountingHandler {
    calls: AtomicUsize,
}

impl CountingHandler {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(&self, _command: &JobCommand) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn backdate(store: &Store, job_id: &str, when: chrono::DateTime<Utc>) {
    store
        .with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET created_at = ?2 WHERE job_id = ?1",
                rusqlite::params![job_id, when.to_rfc3339()],
            )
        })
        .expect("backdate should succeed");
}

#[tokio::test]
async fn every_minute_cron_job_fires_once_a_backdated_window_has_elapsed() {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let handler = Arc::new(CountingHandler::new());
    let scheduler = Scheduler::new(store.clone(), handler.clone());

    let job = scheduler
        .add_job(
            "* * * * *",
            JobKind::Cron,
            JobCommand { kind: "noop".to_owned(), payload: json!({}) },
            None,
            None,
            None,
        )
        .expect("add_job should succeed");

    // Backdate creation so the next `*/1` boundary has already elapsed
    // without relying on real wall-clock sleep.
    backdate(&store, &job.job_id, Utc::now() - Duration::minutes(2));

    scheduler.tick().await;
    assert_eq!(handler.count(), 1, "job should fire once its window has elapsed");

    // Immediately after firing, the next boundary is still in the future.
    scheduler.tick().await;
    assert_eq!(handler.count(), 1, "job should not fire again before its next boundary");
}

#[tokio::test]
async fn once_job_fires_exactly_once_then_disables_itself() {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let handler = Arc::new(CountingHandler::new());
    let scheduler = Scheduler::new(store.clone(), handler.clone());

    let job = scheduler
        .add_job(
            "once",
            JobKind::Once,
            JobCommand { kind: "noop".to_owned(), payload: json!({}) },
            None,
            None,
            None,
        )
        .expect("add_job should succeed");

    scheduler.tick().await;
    assert_eq!(handler.count(), 1);

    scheduler.tick().await;
    assert_eq!(handler.count(), 1, "a once-job must not fire twice");

    let jobs = scheduler.enabled_jobs().expect("enabled_jobs should succeed");
    assert!(jobs.iter().all(|j| j.job_id != job.job_id), "once-job should be disabled after firing");
}

#[tokio::test]
async fn invalid_cron_expression_is_rejected_at_add_time() {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let handler = Arc::new(CountingHandler::new());
    let scheduler = Scheduler::new(store, handler);

    let err = scheduler
        .add_job(
            "not a cron expression",
            JobKind::Cron,
            JobCommand { kind: "noop".to_owned(), payload: json!({}) },
            None,
            None,
            None,
        )
        .expect_err("malformed cron expression should be rejected");

    assert!(matches!(err, SchedulerError::InvalidCron(_, _)));
}
