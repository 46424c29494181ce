//! C12: Scheduler — persisted cron/once jobs, evaluated on a one-minute
//! ticker and dispatched to a command handler.
//!
//! The scheduler deliberately knows nothing about what a job *does*: it
//! fires an opaque [`JobCommand`] and leaves resolution (e.g. "which
//! persistent agent's heartbeat is this") to whoever registered the job —
//! today that's [`crate::team`]'s heartbeat wiring.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::db::{DbError, Store};

/// Whether a job fires repeatedly on a cron schedule or exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Recurring job, fires on every cron match.
    Cron,
    /// One-shot job; removed (or disabled) after firing.
    Once,
}

/// The opaque command a due job carries — what to do is left to the
/// registered handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCommand {
    /// Command discriminant, e.g. `"agent_heartbeat"`.
    pub kind: String,
    /// Command-specific JSON payload.
    pub payload: serde_json::Value,
}

/// A persisted scheduled job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job id.
    pub job_id: String,
    /// Five-field POSIX cron expression (minute granularity). Ignored for
    /// [`JobKind::Once`] jobs, which fire as soon as `created_at` has
    /// passed and are never re-armed.
    pub schedule: String,
    /// Cron vs one-shot.
    pub kind: JobKind,
    /// Opaque command dispatched when the job fires.
    pub command: JobCommand,
    /// Channel this job is scoped to, if any.
    pub channel: Option<String>,
    /// Chat/session id this job targets, if any.
    pub chat_id: Option<String>,
    /// Whether the job is currently active.
    pub enabled: bool,
    /// Who created the job.
    pub created_by: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time this job fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Error text from the most recent failed run, if any.
    pub last_error: Option<String>,
    /// Number of times this job has fired.
    pub run_count: u64,
}

/// Errors raised by scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    /// The cron expression could not be parsed.
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCron(String, String),
}

/// A handler invoked when a job's command fires.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the side effect for `command`. Errors are recorded on the job
    /// row as `last_error` but never stop the ticker.
    async fn handle(&self, command: &JobCommand) -> anyhow::Result<()>;
}

/// Persisted job store plus a one-minute ticker that dispatches due jobs.
pub struct Scheduler {
    store: Arc<Store>,
    handler: Arc<dyn JobHandler>,
}

impl Scheduler {
    /// Build a scheduler backed by `store`, dispatching due jobs to
    /// `handler`.
    pub fn new(store: Arc<Store>, handler: Arc<dyn JobHandler>) -> Self {
        Self { store, handler }
    }

    /// Persist a new job.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidCron`] if `kind` is
    /// [`JobKind::Cron`] and `schedule` does not parse, or a storage error.
    #[allow(clippy::too_many_arguments)]
    pub fn add_job(
        &self,
        schedule: &str,
        kind: JobKind,
        command: JobCommand,
        channel: Option<String>,
        chat_id: Option<String>,
        created_by: Option<String>,
    ) -> Result<Job, SchedulerError> {
        if kind == JobKind::Cron {
            parse_cron(schedule).map_err(|e| SchedulerError::InvalidCron(schedule.to_owned(), e))?;
        }

        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            schedule: schedule.to_owned(),
            kind,
            command,
            channel,
            chat_id,
            enabled: true,
            created_by,
            created_at: Utc::now(),
            last_run_at: None,
            last_error: None,
            run_count: 0,
        };

        let command_json = serde_json::to_string(&job.command).unwrap_or_default();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, cron_expr, command_json, once, channel, chat_id, enabled,
                                   created_by, run_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, 0, ?8)",
                rusqlite::params![
                    job.job_id,
                    job.schedule,
                    command_json,
                    i32::from(job.kind == JobKind::Once),
                    job.channel,
                    job.chat_id,
                    job.created_by,
                    job.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(job)
    }

    /// Disable a job so it no longer fires, without deleting its history.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on storage failure.
    pub fn disable_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET enabled = 0 WHERE job_id = ?1",
                rusqlite::params![job_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Re-enable a previously disabled job.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on storage failure.
    pub fn enable_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET enabled = 1 WHERE job_id = ?1",
                rusqlite::params![job_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Remove a job entirely.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on storage failure.
    pub fn remove_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM jobs WHERE job_id = ?1", rusqlite::params![job_id])?;
            Ok(())
        })?;
        Ok(())
    }

    /// Load every enabled job.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on storage failure.
    pub fn enabled_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, cron_expr, command_json, once, channel, chat_id, enabled,
                        created_by, run_count, created_at, last_run_at, last_error
                 FROM jobs WHERE enabled = 1",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)? != 0,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)? != 0,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|row| job_from_row(row))
            .collect())
    }

    /// Run one tick: load enabled jobs, fire those due since their last run,
    /// and update bookkeeping. Due-but-missed windows (process was down at
    /// the scheduled time) fire once on the next tick for [`JobKind::Cron`]
    /// jobs; [`JobKind::Once`] jobs whose fire time has already passed are
    /// skipped and disabled rather than fired late.
    pub async fn tick(&self) {
        let jobs = match self.enabled_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "failed to load scheduler jobs");
                return;
            }
        };

        let now = Utc::now();
        for job in jobs {
            if self.is_due(&job, now) {
                self.fire(&job).await;
            } else if job.kind == JobKind::Once && job.created_at < now && job.last_run_at.is_none() {
                // A `once` job whose window already passed without firing
                // (e.g. the schedule string encodes a past time) is retired
                // rather than left to fire late.
                if let Err(e) = self.disable_job(&job.job_id) {
                    warn!(job_id = %job.job_id, error = %e, "failed to retire missed once-job");
                }
            }
        }
    }

    fn is_due(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match job.kind {
            JobKind::Once => job.last_run_at.is_none() && job.created_at <= now,
            JobKind::Cron => {
                let Ok(schedule) = parse_cron(&job.schedule) else {
                    return false;
                };
                let after = job.last_run_at.unwrap_or(job.created_at);
                schedule.after(&after).take(1).any(|next| next <= now)
            }
        }
    }

    async fn fire(&self, job: &Job) {
        debug!(job_id = %job.job_id, kind = ?job.kind, "dispatching due job");
        let result = self.handler.handle(&job.command).await;
        let now = Utc::now();
        let error_text = result.as_ref().err().map(std::string::ToString::to_string);

        let outcome = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET last_run_at = ?2, run_count = run_count + 1, last_error = ?3 WHERE job_id = ?1",
                rusqlite::params![job.job_id, now.to_rfc3339(), error_text],
            )?;
            if job.kind == JobKind::Once {
                conn.execute(
                    "UPDATE jobs SET enabled = 0 WHERE job_id = ?1",
                    rusqlite::params![job.job_id],
                )?;
            }
            Ok(())
        });

        if let Err(e) = outcome {
            error!(job_id = %job.job_id, error = %e, "failed to record job run");
        }
        if let Err(e) = result {
            warn!(job_id = %job.job_id, error = %e, "job handler returned an error");
        }
    }

    /// Spawn a background task that calls [`Self::tick`] once a minute.
    pub fn spawn_ticker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

/// Parse a five-field POSIX cron expression (minute granularity) by
/// prepending a `0` seconds field for the underlying six-field parser;
/// expressions that already carry six or seven fields pass through as-is.
fn parse_cron(expr: &str) -> Result<Schedule, String> {
    let field_count = expr.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    };
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

#[allow(clippy::type_complexity)]
fn job_from_row(
    row: (
        String,
        String,
        String,
        bool,
        Option<String>,
        Option<String>,
        bool,
        Option<String>,
        i64,
        String,
        Option<String>,
        Option<String>,
    ),
) -> Option<Job> {
    let (job_id, schedule, command_json, once, channel, chat_id, enabled, created_by, run_count, created_at, last_run_at, last_error) = row;
    let command: JobCommand = serde_json::from_str(&command_json).ok()?;
    Some(Job {
        job_id,
        schedule,
        kind: if once { JobKind::Once } else { JobKind::Cron },
        command,
        channel,
        chat_id,
        enabled,
        created_by,
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        last_run_at: last_run_at.and_then(|s| s.parse().ok()),
        last_error,
        run_count: u64::try_from(run_count).unwrap_or(0),
    })
}
