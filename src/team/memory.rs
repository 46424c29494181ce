//! C9: Team Memory — tasks, task threads, shared facts, documents, the
//! per-agent mailbox, thread subscriptions, and the team activity log.
//!
//! [`crate::team::manager`] (C10) owns persistent-agent identity and
//! heartbeats; this module owns everything a team's agents read and write
//! while doing their work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{DbError, Store};
use crate::types::{
    PendingMessage, SubscriptionReason, Team, TeamDocument, TeamFact, TeamMessage, TeamTask,
    TaskStatus, ThreadSubscription,
};

/// Errors raised by team-memory operations.
#[derive(Debug, thiserror::Error)]
pub enum TeamMemoryError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    /// No task exists with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// No team exists with the given id.
    #[error("team not found: {0}")]
    TeamNotFound(String),
    /// `UpdateTask` moved a task to `Blocked` without a reason.
    #[error("blocked_reason is required when transitioning a task to Blocked")]
    BlockedReasonRequired,
}

/// Tasks, facts, documents, mailbox, subscriptions, and activity log for
/// every team, backed by the shared SQLite store.
pub struct TeamMemory {
    store: Arc<Store>,
}

impl TeamMemory {
    /// Build a team-memory layer over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a new team workspace.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn create_team(
        &self,
        name: &str,
        owner_jid: &str,
        default_model: Option<String>,
        workspace_path: Option<String>,
    ) -> Result<Team, TeamMemoryError> {
        let team = Team {
            team_id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            owner_jid: owner_jid.to_owned(),
            default_model,
            workspace_path,
            enabled: true,
            created_at: Utc::now(),
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO teams (team_id, name, owner_jid, default_model, workspace_path, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                rusqlite::params![
                    team.team_id,
                    team.name,
                    team.owner_jid,
                    team.default_model,
                    team.workspace_path,
                    team.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(team)
    }

    /// Look up a team by id.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn get_team(&self, team_id: &str) -> Result<Option<Team>, TeamMemoryError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT team_id, name, owner_jid, default_model, workspace_path, enabled, created_at
                 FROM teams WHERE team_id = ?1",
                rusqlite::params![team_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| {
                if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                    Ok(None)
                } else {
                    Err(e)
                }
            })
        })?;

        Ok(row.map(|(team_id, name, owner_jid, default_model, workspace_path, enabled, created_at)| Team {
            team_id,
            name,
            owner_jid,
            default_model,
            workspace_path,
            enabled: enabled != 0,
            created_at: parse_ts(&created_at),
        }))
    }

    /// Resolve the owner's session-key string (channel-qualified jid) for a
    /// team. Used by the Notification Dispatcher's `owner` destination.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError::TeamNotFound`] if the team does not exist,
    /// or a storage error.
    pub fn owner_jid(&self, team_id: &str) -> Result<String, TeamMemoryError> {
        self.get_team(team_id)?
            .map(|team| team.owner_jid)
            .ok_or_else(|| TeamMemoryError::TeamNotFound(team_id.to_owned()))
    }

    /// Create a task in the `Inbox` state.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn create_task(
        &self,
        team_id: &str,
        title: &str,
        description: &str,
        priority: u8,
        labels: Vec<String>,
        created_by: &str,
    ) -> Result<TeamTask, TeamMemoryError> {
        let now = Utc::now();
        let task = TeamTask {
            task_id: Uuid::new_v4().to_string(),
            team_id: team_id.to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            status: TaskStatus::Inbox,
            assignees: Vec::new(),
            priority,
            labels,
            created_by: created_by.to_owned(),
            blocked_reason: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_tasks (task_id, team_id, title, description, state, assignees_json,
                                          priority, labels_json, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?7, ?8, ?9, ?9)",
                rusqlite::params![
                    task.task_id,
                    task.team_id,
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority,
                    serde_json::to_string(&task.labels).unwrap_or_default(),
                    task.created_by,
                    task.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(task)
    }

    /// Look up a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn get_task(&self, task_id: &str) -> Result<Option<TeamTask>, TeamMemoryError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT task_id, team_id, title, description, state, assignees_json, priority,
                        labels_json, created_by, blocked_reason, completed_at, created_at, updated_at
                 FROM team_tasks WHERE task_id = ?1",
                rusqlite::params![task_id],
                row_to_task_tuple,
            )
            .map(Some)
            .or_else(|e| {
                if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                    Ok(None)
                } else {
                    Err(e)
                }
            })
        })?;
        Ok(row.map(task_from_tuple))
    }

    /// List every task belonging to a team, optionally filtered by status,
    /// most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn list_tasks(
        &self,
        team_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TeamTask>, TeamMemoryError> {
        let rows = self.store.with_conn(|conn| {
            let sql = "SELECT task_id, team_id, title, description, state, assignees_json, priority,
                              labels_json, created_by, blocked_reason, completed_at, created_at, updated_at
                       FROM team_tasks WHERE team_id = ?1 AND (?2 IS NULL OR state = ?2)
                       ORDER BY updated_at DESC";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![team_id, status.map(TaskStatus::as_str)],
                    row_to_task_tuple,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.into_iter().map(task_from_tuple).collect())
    }

    /// Update a task's status, optionally posting a comment to its thread.
    ///
    /// Assigning agents (via [`Self::assign_task`]) and commenting both
    /// auto-subscribe the actor to the thread; this method only transitions
    /// status and stamps `completed_at`/`blocked_reason` as required.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError::BlockedReasonRequired`] if transitioning to
    /// [`TaskStatus::Blocked`] without a reason, [`TeamMemoryError::TaskNotFound`]
    /// if `task_id` doesn't exist, or a storage error.
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        blocked_reason: Option<String>,
    ) -> Result<TeamTask, TeamMemoryError> {
        if status == TaskStatus::Blocked && blocked_reason.is_none() {
            return Err(TeamMemoryError::BlockedReasonRequired);
        }
        let now = Utc::now();
        let completed_at = (status == TaskStatus::Done).then_some(now);
        let reason = if status == TaskStatus::Blocked { blocked_reason } else { None };

        let updated = self.store.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE team_tasks SET state = ?2, blocked_reason = ?3, completed_at = ?4, updated_at = ?5
                 WHERE task_id = ?1",
                rusqlite::params![
                    task_id,
                    status.as_str(),
                    reason,
                    completed_at.map(|t| t.to_rfc3339()),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(n)
        })?;
        if updated == 0 {
            return Err(TeamMemoryError::TaskNotFound(task_id.to_owned()));
        }
        self.get_task(task_id)?
            .ok_or_else(|| TeamMemoryError::TaskNotFound(task_id.to_owned()))
    }

    /// Assign `agent_ids` to a task (merged with any existing assignees) and
    /// auto-subscribe each one to the task's thread.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError::TaskNotFound`] if `task_id` doesn't exist,
    /// or a storage error.
    pub fn assign_task(
        &self,
        task_id: &str,
        agent_ids: &[String],
    ) -> Result<TeamTask, TeamMemoryError> {
        let mut task = self
            .get_task(task_id)?
            .ok_or_else(|| TeamMemoryError::TaskNotFound(task_id.to_owned()))?;

        for agent_id in agent_ids {
            if !task.assignees.iter().any(|a| a == agent_id) {
                task.assignees.push(agent_id.clone());
            }
        }
        if task.status == TaskStatus::Inbox {
            task.status = TaskStatus::Assigned;
        }
        let now = Utc::now();
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE team_tasks SET assignees_json = ?2, state = ?3, updated_at = ?4 WHERE task_id = ?1",
                rusqlite::params![
                    task_id,
                    serde_json::to_string(&task.assignees).unwrap_or_default(),
                    task.status.as_str(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        for agent_id in agent_ids {
            self.subscribe(&task.team_id, task_id, agent_id, SubscriptionReason::Assigned)?;
        }

        self.get_task(task_id)?
            .ok_or_else(|| TeamMemoryError::TaskNotFound(task_id.to_owned()))
    }

    /// Post a comment to a task's thread (`thread_id == task_id`),
    /// auto-subscribing the author and enqueueing a [`PendingMessage`] for
    /// every agent mentioned in the body.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn post_message(
        &self,
        team_id: &str,
        thread_id: Option<&str>,
        author_agent_id: Option<&str>,
        body: &str,
        mentions: Vec<String>,
    ) -> Result<TeamMessage, TeamMemoryError> {
        let message = TeamMessage {
            message_id: Uuid::new_v4().to_string(),
            team_id: team_id.to_owned(),
            thread_id: thread_id.map(str::to_owned),
            author_agent_id: author_agent_id.map(str::to_owned),
            body: body.to_owned(),
            mentions: mentions.clone(),
            created_at: Utc::now(),
        };
        let from_kind = if author_agent_id.is_some() { "agent" } else { "user" };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_messages (message_id, team_id, thread_id, from_kind, author_agent_id,
                                             body, mentions_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.message_id,
                    message.team_id,
                    message.thread_id,
                    from_kind,
                    message.author_agent_id,
                    message.body,
                    serde_json::to_string(&mentions).unwrap_or_default(),
                    message.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        if let (Some(thread_id), Some(author)) = (thread_id, author_agent_id) {
            self.subscribe(team_id, thread_id, author, SubscriptionReason::Commented)?;
        }
        for mentioned in &mentions {
            self.send_to_mailbox(
                mentioned,
                author_agent_id,
                None,
                body,
                thread_id,
            )?;
            if let Some(thread_id) = thread_id {
                self.subscribe(team_id, thread_id, mentioned, SubscriptionReason::Mentioned)?;
            }
        }
        Ok(message)
    }

    /// Enqueue a mailbox entry addressed to `to_agent`.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn send_to_mailbox(
        &self,
        to_agent: &str,
        from_agent: Option<&str>,
        from_user: Option<&str>,
        content: &str,
        thread_id: Option<&str>,
    ) -> Result<PendingMessage, TeamMemoryError> {
        let message = PendingMessage {
            id: Uuid::new_v4().to_string(),
            to_agent: to_agent.to_owned(),
            from_agent: from_agent.map(str::to_owned),
            from_user: from_user.map(str::to_owned),
            content: content.to_owned(),
            thread_id: thread_id.map(str::to_owned),
            created_at: Utc::now(),
            delivered: false,
            delivered_at: None,
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_messages (id, to_agent, from_agent, from_user, content, thread_id, created_at, delivered)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                rusqlite::params![
                    message.id,
                    message.to_agent,
                    message.from_agent,
                    message.from_user,
                    message.content,
                    message.thread_id,
                    message.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(message)
    }

    /// Read and mark delivered every undelivered mailbox entry for
    /// `agent_id`, oldest first. Delivery is flipped on first read (spec §3).
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn drain_mailbox(&self, agent_id: &str) -> Result<Vec<PendingMessage>, TeamMemoryError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, to_agent, from_agent, from_user, content, thread_id, created_at
                 FROM pending_messages WHERE to_agent = ?1 AND delivered = 0 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![agent_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let now = Utc::now();
        let mut messages = Vec::with_capacity(rows.len());
        self.store.with_conn(|conn| {
            for (id, ..) in &rows {
                conn.execute(
                    "UPDATE pending_messages SET delivered = 1, delivered_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, now.to_rfc3339()],
                )?;
            }
            Ok(())
        })?;

        for (id, to_agent, from_agent, from_user, content, thread_id, created_at) in rows {
            messages.push(PendingMessage {
                id,
                to_agent,
                from_agent,
                from_user,
                content,
                thread_id,
                created_at: parse_ts(&created_at),
                delivered: true,
                delivered_at: Some(now),
            });
        }
        Ok(messages)
    }

    /// Subscribe `agent_id` to a thread, idempotently — re-subscribing with
    /// a different reason does not overwrite the original reason.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn subscribe(
        &self,
        team_id: &str,
        thread_id: &str,
        agent_id: &str,
        reason: SubscriptionReason,
    ) -> Result<(), TeamMemoryError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO thread_subscriptions (team_id, thread_id, agent_id, reason, subscribed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (thread_id, agent_id) DO NOTHING",
                rusqlite::params![team_id, thread_id, agent_id, reason.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// List every agent subscribed to a thread.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn subscribers(&self, thread_id: &str) -> Result<Vec<ThreadSubscription>, TeamMemoryError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT team_id, thread_id, agent_id, reason, subscribed_at
                 FROM thread_subscriptions WHERE thread_id = ?1",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![thread_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows
            .into_iter()
            .map(|(team_id, thread_id, agent_id, reason, subscribed_at)| ThreadSubscription {
                team_id,
                thread_id,
                agent_id,
                reason: parse_reason(&reason),
                subscribed_at: parse_ts(&subscribed_at),
            })
            .collect())
    }

    /// Upsert a fact, bumping `updated_at`. Unique per `(team_id, key)`.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn save_fact(
        &self,
        team_id: &str,
        key: &str,
        value: &str,
        author: &str,
    ) -> Result<TeamFact, TeamMemoryError> {
        let now = Utc::now();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_facts (team_id, fact_key, fact_value, author, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (team_id, fact_key) DO UPDATE SET
                    fact_value = excluded.fact_value, author = excluded.author, updated_at = excluded.updated_at",
                rusqlite::params![team_id, key, value, author, now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(TeamFact {
            team_id: team_id.to_owned(),
            key: key.to_owned(),
            value: value.to_owned(),
            author: author.to_owned(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Substring-match facts by key or value.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn search_facts(&self, team_id: &str, query: &str) -> Result<Vec<TeamFact>, TeamMemoryError> {
        let like = format!("%{query}%");
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT team_id, fact_key, fact_value, author, created_at, updated_at
                 FROM team_facts WHERE team_id = ?1 AND (fact_key LIKE ?2 OR fact_value LIKE ?2)
                 ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![team_id, like], row_to_fact)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    /// The `n` most recently updated facts for a team, used to seed a
    /// persistent agent's system prompt.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn latest_facts(&self, team_id: &str, n: u32) -> Result<Vec<TeamFact>, TeamMemoryError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT team_id, fact_key, fact_value, author, created_at, updated_at
                 FROM team_facts WHERE team_id = ?1 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![team_id, n], row_to_fact)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    /// Write a new version of a document. `version` is one past the
    /// previous highest version for this `(team_id, doc_key)` (starts at 1).
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn save_document(
        &self,
        team_id: &str,
        doc_key: &str,
        task_id: Option<&str>,
        title: &str,
        doc_type: &str,
        format: &str,
        body: &str,
        author: &str,
    ) -> Result<TeamDocument, TeamMemoryError> {
        let previous = self.get_document(team_id, doc_key)?;
        let version = previous.as_ref().map_or(1, |doc| doc.version.saturating_add(1));
        let created_at = previous.as_ref().map_or_else(Utc::now, |doc| doc.created_at);
        let now = Utc::now();

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_documents (team_id, doc_key, task_id, title, doc_type, format, author,
                                              version, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    team_id, doc_key, task_id, title, doc_type, format, author, version, body,
                    created_at.to_rfc3339(), now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(TeamDocument {
            team_id: team_id.to_owned(),
            doc_key: doc_key.to_owned(),
            task_id: task_id.map(str::to_owned),
            title: title.to_owned(),
            doc_type: doc_type.to_owned(),
            format: format.to_owned(),
            author: author.to_owned(),
            version,
            body: body.to_owned(),
            created_at,
            updated_at: now,
        })
    }

    /// Fetch the highest-versioned row for `(team_id, doc_key)`.
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn get_document(&self, team_id: &str, doc_key: &str) -> Result<Option<TeamDocument>, TeamMemoryError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT team_id, doc_key, task_id, title, doc_type, format, author, version, body,
                        created_at, updated_at
                 FROM team_documents WHERE team_id = ?1 AND doc_key = ?2
                 ORDER BY version DESC LIMIT 1",
                rusqlite::params![team_id, doc_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| {
                if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                    Ok(None)
                } else {
                    Err(e)
                }
            })
        })?;

        Ok(row.map(
            |(team_id, doc_key, task_id, title, doc_type, format, author, version, body, created_at, updated_at)| {
                TeamDocument {
                    team_id,
                    doc_key,
                    task_id,
                    title,
                    doc_type,
                    format,
                    author,
                    version: u32::try_from(version).unwrap_or(0),
                    body,
                    created_at: parse_ts(&created_at),
                    updated_at: parse_ts(&updated_at),
                }
            },
        ))
    }

    /// Append a row to the team activity log (e.g. the Notification
    /// Dispatcher's `activity` destination).
    ///
    /// # Errors
    ///
    /// Returns [`TeamMemoryError`] on storage failure.
    pub fn record_activity(
        &self,
        team_id: &str,
        activity_type: &str,
        payload: &Value,
    ) -> Result<(), TeamMemoryError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_activities (team_id, activity_type, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![team_id, activity_type, payload.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

#[allow(clippy::type_complexity)]
fn row_to_task_tuple(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

#[allow(clippy::type_complexity)]
fn task_from_tuple(
    row: (
        String,
        String,
        String,
        String,
        String,
        String,
        i64,
        String,
        String,
        Option<String>,
        Option<String>,
        String,
        String,
    ),
) -> TeamTask {
    let (
        task_id, team_id, title, description, state, assignees_json, priority, labels_json,
        created_by, blocked_reason, completed_at, created_at, updated_at,
    ) = row;
    TeamTask {
        task_id,
        team_id,
        title,
        description,
        status: TaskStatus::parse(&state),
        assignees: serde_json::from_str(&assignees_json).unwrap_or_default(),
        priority: u8::try_from(priority).unwrap_or(3),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        created_by,
        blocked_reason,
        completed_at: completed_at.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<TeamFact> {
    let team_id: String = row.get(0)?;
    let key: String = row.get(1)?;
    let value: String = row.get(2)?;
    let author: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(TeamFact {
        team_id,
        key,
        value,
        author,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn parse_reason(s: &str) -> SubscriptionReason {
    match s {
        "mentioned" => SubscriptionReason::Mentioned,
        "assigned" => SubscriptionReason::Assigned,
        _ => SubscriptionReason::Commented,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> TeamMemory {
        TeamMemory::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")))
    }

    fn team(mem: &TeamMemory) -> Team {
        mem.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed")
    }

    #[test]
    fn create_and_list_tasks() {
        let mem = memory();
        let team = team(&mem);
        let task = mem
            .create_task(&team.team_id, "Ship it", "", 3, vec![], "owner")
            .expect("create_task should succeed");
        assert_eq!(task.status, TaskStatus::Inbox);

        let tasks = mem.list_tasks(&team.team_id, None).expect("list_tasks should succeed");
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn assigning_a_task_moves_it_to_assigned_and_subscribes() {
        let mem = memory();
        let team = team(&mem);
        let task = mem
            .create_task(&team.team_id, "Ship it", "", 3, vec![], "owner")
            .expect("create_task should succeed");
        let updated = mem.assign_task(&task.task_id, &["alice".to_owned()]).expect("assign_task should succeed");
        assert_eq!(updated.status, TaskStatus::Assigned);
        assert_eq!(updated.assignees, vec!["alice".to_owned()]);

        let subs = mem.subscribers(&task.task_id).expect("subscribers should succeed");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].reason, SubscriptionReason::Assigned);
    }

    #[test]
    fn blocking_a_task_without_a_reason_is_rejected() {
        let mem = memory();
        let team = team(&mem);
        let task = mem
            .create_task(&team.team_id, "Ship it", "", 3, vec![], "owner")
            .expect("create_task should succeed");
        let err = mem
            .update_task_status(&task.task_id, TaskStatus::Blocked, None)
            .unwrap_err();
        assert!(matches!(err, TeamMemoryError::BlockedReasonRequired));
    }

    #[test]
    fn completing_a_task_stamps_completed_at() {
        let mem = memory();
        let team = team(&mem);
        let task = mem
            .create_task(&team.team_id, "Ship it", "", 3, vec![], "owner")
            .expect("create_task should succeed");
        let done = mem
            .update_task_status(&task.task_id, TaskStatus::Done, None)
            .expect("update_task_status should succeed");
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn posting_a_comment_subscribes_author_and_mailboxes_mentions() {
        let mem = memory();
        let team = team(&mem);
        let task = mem
            .create_task(&team.team_id, "Ship it", "", 3, vec![], "owner")
            .expect("create_task should succeed");
        mem.post_message(
            &team.team_id,
            Some(&task.task_id),
            Some("alice"),
            "please review @bob",
            vec!["bob".to_owned()],
        )
        .expect("post_message should succeed");

        let subs = mem.subscribers(&task.task_id).expect("subscribers should succeed");
        let reasons: Vec<_> = subs.iter().map(|s| (s.agent_id.clone(), s.reason)).collect();
        assert!(reasons.contains(&("alice".to_owned(), SubscriptionReason::Commented)));
        assert!(reasons.contains(&("bob".to_owned(), SubscriptionReason::Mentioned)));

        let mailbox = mem.drain_mailbox("bob").expect("drain_mailbox should succeed");
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox[0].from_agent.as_deref(), Some("alice"));

        assert!(mem.drain_mailbox("bob").expect("drain_mailbox should succeed").is_empty());
    }

    #[test]
    fn facts_upsert_and_substring_search() {
        let mem = memory();
        let team = team(&mem);
        mem.save_fact(&team.team_id, "deploy-target", "us-east-1", "alice").expect("save_fact should succeed");
        mem.save_fact(&team.team_id, "deploy-target", "us-west-2", "bob").expect("save_fact should succeed");

        let found = mem.search_facts(&team.team_id, "deploy").expect("search_facts should succeed");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "us-west-2");
        assert_eq!(found[0].author, "bob");
    }

    #[test]
    fn document_version_is_monotonic() {
        let mem = memory();
        let team = team(&mem);
        let v1 = mem
            .save_document(&team.team_id, "runbook", None, "Runbook", "runbook", "markdown", "v1 body", "alice")
            .expect("save_document should succeed");
        assert_eq!(v1.version, 1);
        let v2 = mem
            .save_document(&team.team_id, "runbook", None, "Runbook", "runbook", "markdown", "v2 body", "alice")
            .expect("save_document should succeed");
        assert_eq!(v2.version, 2);

        let latest = mem.get_document(&team.team_id, "runbook").expect("get_document should succeed").expect("document should exist");
        assert_eq!(latest.version, 2);
        assert_eq!(latest.body, "v2 body");
    }

    #[test]
    fn resubscribing_with_a_different_reason_keeps_the_first() {
        let mem = memory();
        let team = team(&mem);
        let task = mem
            .create_task(&team.team_id, "Ship it", "", 3, vec![], "owner")
            .expect("create_task should succeed");
        mem.subscribe(&team.team_id, &task.task_id, "alice", SubscriptionReason::Mentioned)
            .expect("subscribe should succeed");
        mem.subscribe(&team.team_id, &task.task_id, "alice", SubscriptionReason::Commented)
            .expect("subscribe should succeed");
        let subs = mem.subscribers(&task.task_id).expect("subscribers should succeed");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].reason, SubscriptionReason::Mentioned);
    }
}
