//! Shared SQLite connection and schema management.
//!
//! DevClaw standardizes on a single `rusqlite::Connection` behind a mutex
//! (see DESIGN.md) rather than an async connection pool — every component
//! touches the same handful of tables and a single process-wide store is
//! all the concurrency model (spec §5) calls for.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

/// Errors raised while opening or migrating the database.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Underlying SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The database mutex was poisoned by a panicking holder.
    #[error("database lock poisoned")]
    Poisoned,
}

/// Shared, mutex-guarded SQLite handle used by every component.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and run schema
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be opened or a pragma/DDL
    /// statement fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database — used by tests that don't need
    /// file persistence.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a pragma/DDL statement fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn configure(conn: &Connection) -> Result<(), DbError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Run a closure with exclusive access to the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Poisoned`] if a previous holder panicked while
    /// holding the lock.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, DbError> {
        let guard = self.conn.lock().map_err(|_| DbError::Poisoned)?;
        Ok(f(&guard)?)
    }

    fn migrate(&self) -> Result<(), DbError> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }
}

/// Idempotent schema for every persisted entity in the data model (spec §3).
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    state_json      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (channel, jid)
);

CREATE TABLE IF NOT EXISTS session_entries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    user_message    TEXT NOT NULL,
    assistant_response TEXT NOT NULL,
    meta_json       TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS active_runs (
    run_id          TEXT PRIMARY KEY,
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    rounds_used     INTEGER NOT NULL,
    tokens_used     INTEGER NOT NULL,
    started_at      TEXT NOT NULL,
    budget_json     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS access_grants (
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    level           TEXT NOT NULL,
    granted_at      TEXT NOT NULL,
    PRIMARY KEY (channel, jid)
);

CREATE TABLE IF NOT EXISTS access_groups (
    channel         TEXT NOT NULL,
    group_id        TEXT NOT NULL,
    allowed         INTEGER NOT NULL,
    PRIMARY KEY (channel, group_id)
);

CREATE TABLE IF NOT EXISTS access_asked (
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    asked_at        TEXT NOT NULL,
    PRIMARY KEY (channel, jid)
);

CREATE TABLE IF NOT EXISTS pairing_requests (
    request_id      TEXT PRIMARY KEY,
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    display_name    TEXT,
    team_id         TEXT,
    requested_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pairing_tokens (
    token           TEXT PRIMARY KEY,
    channel         TEXT NOT NULL,
    requester_jid   TEXT,
    created_at      TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    role            TEXT NOT NULL DEFAULT 'user',
    max_uses        INTEGER NOT NULL DEFAULT 1,
    use_count       INTEGER NOT NULL DEFAULT 0,
    auto_approve    INTEGER NOT NULL DEFAULT 0,
    workspace_id    TEXT,
    note            TEXT,
    created_by      TEXT,
    revoked         INTEGER NOT NULL DEFAULT 0,
    revoked_at      TEXT,
    revoked_by      TEXT
);

CREATE TABLE IF NOT EXISTS tool_audit_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          TEXT,
    tool_name       TEXT NOT NULL,
    arguments_json  TEXT NOT NULL,
    allowed         INTEGER NOT NULL,
    reason          TEXT,
    recorded_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS model_cooldowns (
    model           TEXT PRIMARY KEY,
    until           TEXT NOT NULL,
    reason          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_key     TEXT NOT NULL DEFAULT '',
    model           TEXT NOT NULL,
    input_tokens    INTEGER NOT NULL,
    output_tokens   INTEGER NOT NULL,
    cost_usd_e6     INTEGER NOT NULL,
    recorded_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS teams (
    team_id         TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    owner_jid       TEXT NOT NULL DEFAULT '',
    default_model   TEXT,
    workspace_path  TEXT,
    enabled         INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS team_members (
    team_id         TEXT NOT NULL,
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    joined_at       TEXT NOT NULL,
    PRIMARY KEY (team_id, channel, jid)
);

CREATE TABLE IF NOT EXISTS persistent_agents (
    agent_id        TEXT PRIMARY KEY,
    team_id         TEXT NOT NULL REFERENCES teams(team_id),
    display_name    TEXT NOT NULL,
    role            TEXT NOT NULL DEFAULT '',
    level           TEXT NOT NULL DEFAULT 'specialist',
    status          TEXT NOT NULL DEFAULT 'idle',
    personality     TEXT NOT NULL DEFAULT '',
    instructions    TEXT NOT NULL DEFAULT '',
    model           TEXT,
    skills_json     TEXT NOT NULL DEFAULT '[]',
    heartbeat_schedule TEXT,
    heartbeat_job_id TEXT,
    system_prompt   TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    last_active_at  TEXT,
    last_heartbeat_at TEXT
);

CREATE TABLE IF NOT EXISTS agent_working_state (
    agent_id        TEXT PRIMARY KEY REFERENCES persistent_agents(agent_id),
    team_id         TEXT NOT NULL,
    current_task_id TEXT,
    status          TEXT NOT NULL DEFAULT '',
    next_steps      TEXT NOT NULL DEFAULT '',
    context         TEXT NOT NULL DEFAULT '',
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_messages (
    id              TEXT PRIMARY KEY,
    to_agent        TEXT NOT NULL,
    from_agent      TEXT,
    from_user       TEXT,
    content         TEXT NOT NULL,
    thread_id       TEXT,
    created_at      TEXT NOT NULL,
    delivered       INTEGER NOT NULL DEFAULT 0,
    delivered_at    TEXT
);

CREATE TABLE IF NOT EXISTS team_activities (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id         TEXT NOT NULL,
    activity_type   TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS team_tasks (
    task_id         TEXT PRIMARY KEY,
    team_id         TEXT NOT NULL REFERENCES teams(team_id),
    agent_id        TEXT,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    state           TEXT NOT NULL,
    assignees_json  TEXT NOT NULL DEFAULT '[]',
    priority        INTEGER NOT NULL DEFAULT 3,
    labels_json     TEXT NOT NULL DEFAULT '[]',
    created_by      TEXT NOT NULL DEFAULT '',
    blocked_reason  TEXT,
    completed_at    TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS team_messages (
    message_id      TEXT PRIMARY KEY,
    team_id         TEXT NOT NULL REFERENCES teams(team_id),
    thread_id       TEXT,
    from_kind       TEXT NOT NULL DEFAULT 'agent',
    author_agent_id TEXT,
    body            TEXT NOT NULL,
    mentions_json   TEXT NOT NULL DEFAULT '[]',
    delivered       INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS team_facts (
    team_id         TEXT NOT NULL REFERENCES teams(team_id),
    fact_key        TEXT NOT NULL,
    fact_value      TEXT NOT NULL,
    author          TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (team_id, fact_key)
);

CREATE TABLE IF NOT EXISTS team_documents (
    team_id         TEXT NOT NULL REFERENCES teams(team_id),
    doc_key         TEXT NOT NULL,
    task_id         TEXT,
    title           TEXT NOT NULL DEFAULT '',
    doc_type        TEXT NOT NULL DEFAULT '',
    format          TEXT NOT NULL DEFAULT 'markdown',
    author          TEXT NOT NULL DEFAULT '',
    version         INTEGER NOT NULL,
    body            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (team_id, doc_key, version)
);

CREATE TABLE IF NOT EXISTS thread_subscriptions (
    team_id         TEXT NOT NULL,
    thread_id       TEXT NOT NULL,
    agent_id        TEXT NOT NULL,
    reason          TEXT NOT NULL DEFAULT '',
    subscribed_at   TEXT NOT NULL,
    PRIMARY KEY (thread_id, agent_id)
);

CREATE TABLE IF NOT EXISTS notification_rules (
    rule_id         TEXT PRIMARY KEY,
    team_id         TEXT,
    name            TEXT NOT NULL DEFAULT '',
    enabled         INTEGER NOT NULL DEFAULT 1,
    events_json     TEXT NOT NULL,
    agent_ids_json  TEXT NOT NULL DEFAULT '[]',
    labels_json     TEXT NOT NULL DEFAULT '[]',
    min_priority    INTEGER NOT NULL DEFAULT 0,
    rate_limit_per_hour INTEGER,
    quiet_hours_json TEXT,
    template        TEXT,
    destinations_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_dispatch_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id         TEXT NOT NULL,
    dispatched_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS team_notifications (
    id              TEXT PRIMARY KEY,
    team_id         TEXT NOT NULL,
    notif_type      TEXT NOT NULL,
    agent_id        TEXT NOT NULL,
    agent_name      TEXT NOT NULL DEFAULT '',
    task_id         TEXT,
    action          TEXT NOT NULL DEFAULT '',
    result          TEXT NOT NULL DEFAULT 'info',
    message         TEXT NOT NULL DEFAULT '',
    details         TEXT NOT NULL DEFAULT '',
    priority        INTEGER NOT NULL DEFAULT 3,
    created_at      TEXT NOT NULL,
    read            INTEGER NOT NULL DEFAULT 0,
    read_at         TEXT
);

CREATE TABLE IF NOT EXISTS memory_chunks (
    filepath        TEXT PRIMARY KEY,
    team_id         TEXT,
    content         TEXT NOT NULL,
    sha256          TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id          TEXT PRIMARY KEY,
    cron_expr       TEXT NOT NULL,
    command_json    TEXT NOT NULL,
    once            INTEGER NOT NULL,
    channel         TEXT,
    chat_id         TEXT,
    enabled         INTEGER NOT NULL DEFAULT 1,
    created_by      TEXT,
    run_count       INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    last_run_at     TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_policies (
    channel         TEXT NOT NULL,
    group_id        TEXT NOT NULL,
    policy_json     TEXT NOT NULL,
    PRIMARY KEY (channel, group_id)
);

CREATE TABLE IF NOT EXISTS agent_routes (
    channel         TEXT NOT NULL,
    jid             TEXT NOT NULL,
    group_id        TEXT NOT NULL DEFAULT '',
    profile_id      TEXT NOT NULL,
    PRIMARY KEY (channel, jid, group_id)
);

CREATE TABLE IF NOT EXISTS webhook_delivery_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event           TEXT NOT NULL,
    url             TEXT NOT NULL,
    status_code     INTEGER,
    attempt         INTEGER NOT NULL,
    succeeded       INTEGER NOT NULL,
    dispatched_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metrics_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_json   TEXT NOT NULL,
    recorded_at     TEXT NOT NULL
);
"#;
