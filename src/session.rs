//! C6: Session Store — append-only conversation log, session metadata, and
//! the active-run crash-recovery registry.
//!
//! Each [`SessionKey`] maps to an isolated sliding window of recent
//! exchanges held in memory, backed by an append-only `session_entries`
//! table so history survives restarts. Active runs are rows in
//! `active_runs`, inserted at run start and deleted at run end — any row
//! still present at process startup represents an interrupted run (spec §3).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Store;
use crate::types::{ActiveRun, Channel, RunBudget, SessionKey};

/// Default number of recent exchanges kept in memory per session.
const DEFAULT_WINDOW: usize = 20;

/// A single, immutable exchange within a session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// The user's message.
    pub user_message: String,
    /// The assistant's reply.
    pub assistant_response: String,
    /// When the exchange was recorded.
    pub created_at: DateTime<Utc>,
    /// Free-form metadata (model used, token counts, etc).
    pub meta: Value,
}

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),
}

/// Sliding-window conversation cache plus SQLite-backed append-only journal
/// and active-run registry.
pub struct SessionStore {
    store: Arc<Store>,
    window: usize,
    cache: Mutex<HashMap<SessionKey, VecDeque<SessionEntry>>>,
}

impl SessionStore {
    /// Build a session store over `store`, keeping the default sliding
    /// window size in memory.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            window: DEFAULT_WINDOW,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Append an exchange: persists to the journal and updates the
    /// in-memory sliding window, evicting the oldest entry past capacity.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on database failure.
    pub fn append(&self, key: &SessionKey, entry: SessionEntry) -> Result<(), SessionError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_entries (channel, jid, user_message, assistant_response, meta_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    channel_str(key.channel),
                    key.jid,
                    entry.user_message,
                    entry.assistant_response,
                    entry.meta.to_string(),
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        let mut cache = self.cache.lock().expect("session cache lock");
        let window = cache.entry(key.clone()).or_default();
        if window.len() >= self.window {
            window.pop_front();
        }
        window.push_back(entry);
        Ok(())
    }

    /// Return the in-memory sliding window for `key`, loading it from the
    /// journal on first access for this process.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on database failure.
    pub fn recent(&self, key: &SessionKey) -> Result<Vec<SessionEntry>, SessionError> {
        {
            let cache = self.cache.lock().expect("session cache lock");
            if let Some(window) = cache.get(key) {
                return Ok(window.iter().cloned().collect());
            }
        }
        self.load_window(key)
    }

    fn load_window(&self, key: &SessionKey) -> Result<Vec<SessionEntry>, SessionError> {
        let window = i64::try_from(self.window).unwrap_or(i64::MAX);
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_message, assistant_response, meta_json, created_at
                 FROM session_entries WHERE channel = ?1 AND jid = ?2
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![channel_str(key.channel), key.jid, window],
                    |row| {
                        let meta_json: String = row.get(2)?;
                        let created_at: String = row.get(3)?;
                        Ok(SessionEntry {
                            user_message: row.get(0)?,
                            assistant_response: row.get(1)?,
                            meta: serde_json::from_str(&meta_json).unwrap_or(Value::Null),
                            created_at: DateTime::parse_from_rfc3339(&created_at)
                                .map(|dt| dt.with_timezone(&Utc))
                                .unwrap_or_else(|_| Utc::now()),
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut ordered: VecDeque<SessionEntry> = rows.into_iter().rev().collect();
        let result: Vec<SessionEntry> = ordered.iter().cloned().collect();

        let mut cache = self.cache.lock().expect("session cache lock");
        cache.insert(key.clone(), std::mem::take(&mut ordered));
        Ok(result)
    }

    /// Insert an [`ActiveRun`] row at run start.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on database failure.
    pub fn begin_run(&self, run: &ActiveRun) -> Result<(), SessionError> {
        let budget_json = serde_json::to_string(&run.budget).unwrap_or_default();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO active_runs (run_id, channel, jid, rounds_used, tokens_used, started_at, budget_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    run.run_id.to_string(),
                    channel_str(run.session_key.channel),
                    run.session_key.jid,
                    run.rounds_used,
                    run.tokens_used,
                    run.started_at.to_rfc3339(),
                    budget_json,
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Delete the [`ActiveRun`] row for `run_id` on normal completion or a
    /// caught terminal error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on database failure.
    pub fn end_run(&self, run_id: Uuid) -> Result<(), SessionError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM active_runs WHERE run_id = ?1",
                rusqlite::params![run_id.to_string()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Scan for active-run rows left over from a prior process — each one
    /// represents an interrupted run that must be recovered or discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] on database failure.
    pub fn recover_interrupted_runs(&self) -> Result<Vec<ActiveRun>, SessionError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, channel, jid, rounds_used, tokens_used, started_at, budget_json
                 FROM active_runs",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let run_id: String = row.get(0)?;
                    let channel: String = row.get(1)?;
                    let jid: String = row.get(2)?;
                    let started_at: String = row.get(5)?;
                    let budget_json: String = row.get(6)?;
                    Ok((run_id, channel, jid, row.get::<_, u32>(3)?, row.get::<_, u64>(4)?, started_at, budget_json))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut runs = Vec::new();
        for (run_id, channel, jid, rounds_used, tokens_used, started_at, budget_json) in rows {
            let Ok(run_id) = Uuid::parse_str(&run_id) else {
                continue;
            };
            let Some(channel) = channel_from_str(&channel) else {
                continue;
            };
            let started_at = DateTime::parse_from_rfc3339(&started_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let budget: RunBudget = serde_json::from_str(&budget_json).unwrap_or(RunBudget {
                max_rounds: 40,
                max_tokens: 200_000,
                max_wallclock_secs: 600,
            });
            runs.push(ActiveRun {
                run_id,
                session_key: SessionKey::new(channel, jid),
                rounds_used,
                tokens_used,
                started_at,
                budget,
            });
        }
        Ok(runs)
    }
}

fn channel_str(channel: Channel) -> &'static str {
    match channel {
        Channel::Telegram => "telegram",
        Channel::Slack => "slack",
        Channel::WhatsApp => "whatsapp",
        Channel::Webhook => "webhook",
        Channel::Cron => "cron",
    }
}

fn channel_from_str(s: &str) -> Option<Channel> {
    match s {
        "telegram" => Some(Channel::Telegram),
        "slack" => Some(Channel::Slack),
        "whatsapp" => Some(Channel::WhatsApp),
        "webhook" => Some(Channel::Webhook),
        "cron" => Some(Channel::Cron),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, assistant: &str) -> SessionEntry {
        SessionEntry {
            user_message: user.to_owned(),
            assistant_response: assistant.to_owned(),
            created_at: Utc::now(),
            meta: Value::Null,
        }
    }

    #[test]
    fn append_and_recent_round_trip() {
        let store = SessionStore::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")));
        let key = SessionKey::new(Channel::Telegram, "123");
        store.append(&key, entry("hi", "hello")).expect("append should succeed");
        store.append(&key, entry("how are you", "great")).expect("append should succeed");

        let recent = store.recent(&key).expect("recent should succeed");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_message, "hi");
        assert_eq!(recent[1].user_message, "how are you");
    }

    #[test]
    fn sessions_are_isolated_by_key() {
        let store = SessionStore::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")));
        let a = SessionKey::new(Channel::Telegram, "a");
        let b = SessionKey::new(Channel::Telegram, "b");
        store.append(&a, entry("a msg", "a reply")).expect("append should succeed");

        assert_eq!(store.recent(&a).expect("recent should succeed").len(), 1);
        assert!(store.recent(&b).expect("recent should succeed").is_empty());
    }

    #[test]
    fn sliding_window_evicts_oldest_in_memory() {
        let store = SessionStore {
            window: 2,
            ..SessionStore::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")))
        };
        let key = SessionKey::new(Channel::Telegram, "123");
        store.append(&key, entry("1", "r1")).expect("append should succeed");
        store.append(&key, entry("2", "r2")).expect("append should succeed");
        store.append(&key, entry("3", "r3")).expect("append should succeed");

        let recent = store.recent(&key).expect("recent should succeed");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].user_message, "2");
        assert_eq!(recent[1].user_message, "3");
    }

    #[test]
    fn active_run_lifecycle() {
        let store = SessionStore::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")));
        let run = ActiveRun {
            run_id: Uuid::new_v4(),
            session_key: SessionKey::new(Channel::Slack, "team:chan"),
            rounds_used: 0,
            tokens_used: 0,
            started_at: Utc::now(),
            budget: RunBudget {
                max_rounds: 40,
                max_tokens: 200_000,
                max_wallclock_secs: 600,
            },
        };
        store.begin_run(&run).expect("begin_run should succeed");

        let interrupted = store.recover_interrupted_runs().expect("recover_interrupted_runs should succeed");
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].run_id, run.run_id);

        store.end_run(run.run_id).expect("end_run should succeed");
        assert!(store.recover_interrupted_runs().expect("recover_interrupted_runs should succeed").is_empty());
    }
}
