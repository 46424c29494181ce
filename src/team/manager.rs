//! C10: Team Manager — persistent-agent lifecycle, mention parsing, system
//! prompt assembly, and heartbeat dispatch via the Scheduler's
//! [`JobHandler`] seam.

use std::sync::Arc;

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::db::{DbError, Store};
use crate::providers::ToolDefinition;
use crate::scheduler::{JobCommand, JobHandler, JobKind, Scheduler};
use crate::team::memory::{TeamMemory, TeamMemoryError};
use crate::types::{AgentLevel, AgentStatus, AgentWorkingState, PersistentAgent};

/// Errors raised by team-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum TeamManagerError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    /// Team-memory operation failed.
    #[error("team memory error: {0}")]
    Memory(#[from] TeamMemoryError),
    /// Scheduler operation failed.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    /// Derived agent id collides with an existing agent in the same team.
    #[error("agent id {0:?} already exists in this team")]
    IdCollision(String),
    /// No agent exists with the given id.
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    /// `display_name` normalized to an empty id.
    #[error("display name {0:?} does not contain any alphanumeric characters")]
    EmptyDerivedId(String),
}

/// Derive a stable agent id from a display name: lowercase, replace any
/// run of non-`[a-z0-9]` characters with a single `-`, trim leading and
/// trailing `-`.
#[must_use]
pub fn derive_agent_id(display_name: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));
    let lower = display_name.to_lowercase();
    re.replace_all(&lower, "-").trim_matches('-').to_owned()
}

/// Extract every `@agent-id`-shaped mention from `text`, deduplicated,
/// keeping only ids present in `known_agent_ids`.
#[must_use]
pub fn parse_mentions(text: &str, known_agent_ids: &[String]) -> Vec<String> {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let re = MENTION.get_or_init(|| Regex::new(r"@([a-zA-Z0-9-]+)").expect("valid regex"));
    let mut found = Vec::new();
    for cap in re.captures_iter(text) {
        let candidate = cap[1].to_lowercase();
        if known_agent_ids.iter().any(|id| *id == candidate) && !found.contains(&candidate) {
            found.push(candidate);
        }
    }
    found
}

/// Persistent-agent identity, lifecycle, and heartbeat dispatch, backed by
/// the shared store and a [`Scheduler`] for heartbeat ticks.
pub struct TeamManager {
    store: Arc<Store>,
    memory: Arc<TeamMemory>,
    scheduler: Arc<Scheduler>,
}

impl TeamManager {
    /// Build a team manager over `store`, sharing `memory`'s view of tasks
    /// and facts, registering heartbeats with `scheduler`.
    pub fn new(store: Arc<Store>, memory: Arc<TeamMemory>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, memory, scheduler }
    }

    /// Create a persistent agent. `agent_id` is derived from `display_name`
    /// via [`derive_agent_id`]; collisions within the same team are
    /// rejected rather than disambiguated.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError::EmptyDerivedId`] if the name has no
    /// alphanumeric characters, [`TeamManagerError::IdCollision`] if the
    /// derived id is already taken, or a storage error.
    #[allow(clippy::too_many_arguments)]
    pub fn create_agent(
        &self,
        team_id: &str,
        display_name: &str,
        role: &str,
        level: AgentLevel,
        personality: &str,
        instructions: &str,
        model: Option<String>,
        skills: Vec<String>,
    ) -> Result<PersistentAgent, TeamManagerError> {
        let agent_id = derive_agent_id(display_name);
        if agent_id.is_empty() {
            return Err(TeamManagerError::EmptyDerivedId(display_name.to_owned()));
        }
        if self.get_agent(&agent_id)?.is_some() {
            return Err(TeamManagerError::IdCollision(agent_id));
        }

        let mut agent = PersistentAgent {
            agent_id,
            team_id: team_id.to_owned(),
            display_name: display_name.to_owned(),
            role: role.to_owned(),
            level,
            status: AgentStatus::Idle,
            personality: personality.to_owned(),
            instructions: instructions.to_owned(),
            model,
            skills,
            heartbeat_schedule: None,
            system_prompt: String::new(),
            created_at: Utc::now(),
            last_active_at: None,
            last_heartbeat_at: None,
        };
        agent.system_prompt = self.assemble_system_prompt(&agent, &[])?;

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO persistent_agents (agent_id, team_id, display_name, role, level, status,
                                                 personality, instructions, model, skills_json,
                                                 system_prompt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    agent.agent_id,
                    agent.team_id,
                    agent.display_name,
                    agent.role,
                    agent.level.as_str(),
                    agent.status.as_str(),
                    agent.personality,
                    agent.instructions,
                    agent.model,
                    serde_json::to_string(&agent.skills).unwrap_or_default(),
                    agent.system_prompt,
                    agent.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(agent)
    }

    /// Look up an agent by id.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError`] on storage failure.
    pub fn get_agent(&self, agent_id: &str) -> Result<Option<PersistentAgent>, TeamManagerError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT agent_id, team_id, display_name, role, level, status, personality,
                        instructions, model, skills_json, heartbeat_schedule, system_prompt,
                        created_at, last_active_at, last_heartbeat_at
                 FROM persistent_agents WHERE agent_id = ?1",
                rusqlite::params![agent_id],
                row_to_agent_tuple,
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
        Ok(row.map(agent_from_tuple))
    }

    /// List every agent belonging to a team.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError`] on storage failure.
    pub fn list_agents(&self, team_id: &str) -> Result<Vec<PersistentAgent>, TeamManagerError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, team_id, display_name, role, level, status, personality,
                        instructions, model, skills_json, heartbeat_schedule, system_prompt,
                        created_at, last_active_at, last_heartbeat_at
                 FROM persistent_agents WHERE team_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![team_id], row_to_agent_tuple)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.into_iter().map(agent_from_tuple).collect())
    }

    /// Register a heartbeat schedule for an agent and enroll it with the
    /// scheduler, marking the agent `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError::AgentNotFound`] if `agent_id` doesn't
    /// exist, or a storage/scheduler error.
    pub fn start_agent(&self, agent_id: &str, cron_schedule: &str) -> Result<(), TeamManagerError> {
        self.get_agent(agent_id)?
            .ok_or_else(|| TeamManagerError::AgentNotFound(agent_id.to_owned()))?;

        let job = self.scheduler.add_job(
            cron_schedule,
            JobKind::Cron,
            JobCommand {
                kind: "agent_heartbeat".to_owned(),
                payload: serde_json::json!({ "agent_id": agent_id }),
            },
            None,
            None,
            Some(agent_id.to_owned()),
        )?;

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE persistent_agents SET heartbeat_schedule = ?2, heartbeat_job_id = ?3, status = ?4
                 WHERE agent_id = ?1",
                rusqlite::params![agent_id, cron_schedule, job.job_id, AgentStatus::Active.as_str()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Unregister an agent's heartbeat job and mark it `Stopped`. Leaves
    /// the agent's history and memory intact.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError::AgentNotFound`] if `agent_id` doesn't
    /// exist, or a storage/scheduler error.
    pub fn stop_agent(&self, agent_id: &str) -> Result<(), TeamManagerError> {
        let job_id = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT heartbeat_job_id FROM persistent_agents WHERE agent_id = ?1",
                rusqlite::params![agent_id],
                |row| row.get::<_, Option<String>>(0),
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
        let job_id = job_id.ok_or_else(|| TeamManagerError::AgentNotFound(agent_id.to_owned()))?;

        if let Some(job_id) = job_id {
            self.scheduler.remove_job(&job_id)?;
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE persistent_agents SET heartbeat_job_id = NULL, status = ?2 WHERE agent_id = ?1",
                rusqlite::params![agent_id, AgentStatus::Stopped.as_str()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Permanently remove a persistent agent and its heartbeat job. Task
    /// assignments, mailbox entries, and activity history referencing the
    /// agent id are left in place for audit purposes.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError`] on storage/scheduler failure.
    pub fn delete_agent(&self, agent_id: &str) -> Result<(), TeamManagerError> {
        if self.get_agent(agent_id)?.is_some() {
            let _ = self.stop_agent(agent_id);
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM persistent_agents WHERE agent_id = ?1",
                rusqlite::params![agent_id],
            )?;
            conn.execute(
                "DELETE FROM agent_working_state WHERE agent_id = ?1",
                rusqlite::params![agent_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Current working-state row for an agent, if it has ever been set.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError`] on storage failure.
    pub fn working_state(&self, agent_id: &str) -> Result<Option<AgentWorkingState>, TeamManagerError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT agent_id, team_id, current_task_id, status, next_steps, context, updated_at
                 FROM agent_working_state WHERE agent_id = ?1",
                rusqlite::params![agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
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
        Ok(row.map(
            |(agent_id, team_id, current_task_id, status, next_steps, context, updated_at)| {
                AgentWorkingState {
                    agent_id,
                    team_id,
                    current_task_id,
                    status,
                    next_steps,
                    context,
                    updated_at: parse_ts(&updated_at),
                }
            },
        ))
    }

    /// Upsert an agent's working state — the scratchpad a heartbeat reads
    /// and writes back on every tick.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError`] on storage failure.
    pub fn set_working_state(
        &self,
        agent_id: &str,
        team_id: &str,
        current_task_id: Option<&str>,
        status: &str,
        next_steps: &str,
        context: &str,
    ) -> Result<(), TeamManagerError> {
        let now = Utc::now();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_working_state (agent_id, team_id, current_task_id, status, next_steps, context, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (agent_id) DO UPDATE SET
                    current_task_id = excluded.current_task_id, status = excluded.status,
                    next_steps = excluded.next_steps, context = excluded.context, updated_at = excluded.updated_at",
                rusqlite::params![agent_id, team_id, current_task_id, status, next_steps, context, now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Assemble a persistent agent's system prompt: identity, personality,
    /// instructions, a short team-memory hint block (recent facts), and a
    /// manual listing the tools it may call.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError`] on storage failure (reading facts).
    pub fn assemble_system_prompt(
        &self,
        agent: &PersistentAgent,
        tools: &[ToolDefinition],
    ) -> Result<String, TeamManagerError> {
        let mut prompt = String::new();
        prompt.push_str(&format!(
            "You are {}, a {} on this team.\n",
            agent.display_name,
            agent.level.as_str()
        ));
        if !agent.role.is_empty() {
            prompt.push_str(&format!("Role: {}\n", agent.role));
        }
        if !agent.personality.is_empty() {
            prompt.push_str(&format!("\n{}\n", agent.personality));
        }
        if !agent.instructions.is_empty() {
            prompt.push_str(&format!("\nInstructions:\n{}\n", agent.instructions));
        }

        let facts = self.memory.latest_facts(&agent.team_id, 10)?;
        if !facts.is_empty() {
            prompt.push_str("\nKnown team facts:\n");
            for fact in facts {
                prompt.push_str(&format!("- {}: {}\n", fact.key, fact.value));
            }
        }

        if !tools.is_empty() {
            prompt.push_str("\nTools available to you:\n");
            for tool in tools {
                prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            }
        }

        Ok(prompt)
    }

    /// Run one heartbeat tick for `agent_id`: drain its mailbox, stamp
    /// `last_heartbeat_at`. Turn execution itself is the caller's
    /// responsibility — the scheduler's `agent_heartbeat` job dispatches to
    /// this and then runs the actual agent turn — this just updates
    /// bookkeeping the way every heartbeat needs regardless of what the
    /// turn produces.
    ///
    /// # Errors
    ///
    /// Returns [`TeamManagerError::AgentNotFound`] if `agent_id` doesn't
    /// exist, or a storage error.
    pub fn run_heartbeat(&self, agent_id: &str) -> Result<Vec<crate::types::PendingMessage>, TeamManagerError> {
        self.get_agent(agent_id)?
            .ok_or_else(|| TeamManagerError::AgentNotFound(agent_id.to_owned()))?;
        let messages = self.memory.drain_mailbox(agent_id)?;
        let now = Utc::now();
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE persistent_agents SET last_heartbeat_at = ?2, last_active_at = ?2 WHERE agent_id = ?1",
                rusqlite::params![agent_id, now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(messages)
    }
}

#[allow(clippy::type_complexity)]
fn row_to_agent_tuple(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
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
        row.get(13)?,
        row.get(14)?,
    ))
}

#[allow(clippy::type_complexity)]
fn agent_from_tuple(
    row: (
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        String,
        Option<String>,
        String,
        String,
        Option<String>,
        Option<String>,
    ),
) -> PersistentAgent {
    let (
        agent_id, team_id, display_name, role, level, status, personality, instructions, model,
        skills_json, heartbeat_schedule, system_prompt, created_at, last_active_at, last_heartbeat_at,
    ) = row;
    PersistentAgent {
        agent_id,
        team_id,
        display_name,
        role,
        level: AgentLevel::parse(&level),
        status: AgentStatus::parse(&status),
        personality,
        instructions,
        model,
        skills: serde_json::from_str(&skills_json).unwrap_or_default(),
        heartbeat_schedule,
        system_prompt,
        created_at: parse_ts(&created_at),
        last_active_at: last_active_at.as_deref().map(parse_ts),
        last_heartbeat_at: last_heartbeat_at.as_deref().map(parse_ts),
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
    use crate::scheduler::Scheduler;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(&self, _command: &JobCommand) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn manager() -> (TeamManager, Arc<TeamMemory>) {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let memory = Arc::new(TeamMemory::new(store.clone()));
        let scheduler = Arc::new(Scheduler::new(store.clone(), Arc::new(NoopHandler)));
        (TeamManager::new(store, memory.clone(), scheduler), memory)
    }

    #[test]
    fn derive_agent_id_lowercases_and_collapses_separators() {
        assert_eq!(derive_agent_id("Alice Smith!!"), "alice-smith");
        assert_eq!(derive_agent_id("  Bob_the--Builder  "), "bob-the-builder");
    }

    #[test]
    fn derive_agent_id_of_only_punctuation_is_empty() {
        assert_eq!(derive_agent_id("!!!"), "");
    }

    #[test]
    fn parse_mentions_filters_to_known_ids_and_dedupes() {
        let known = vec!["alice".to_owned(), "bob".to_owned()];
        let mentions = parse_mentions("cc @alice and @alice, also @carol and @bob", &known);
        assert_eq!(mentions, vec!["alice".to_owned(), "bob".to_owned()]);
    }

    #[test]
    fn create_agent_derives_id_and_rejects_collisions() {
        let (mgr, memory) = manager();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        let alice = mgr
            .create_agent(&team.team_id, "Alice", "engineer", AgentLevel::Specialist, "", "", None, vec![])
            .expect("create_agent should succeed");
        assert_eq!(alice.agent_id, "alice");

        let err = mgr
            .create_agent(&team.team_id, "Alice", "pm", AgentLevel::Lead, "", "", None, vec![])
            .unwrap_err();
        assert!(matches!(err, TeamManagerError::IdCollision(_)));
    }

    #[test]
    fn empty_display_name_is_rejected() {
        let (mgr, memory) = manager();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        let err = mgr
            .create_agent(&team.team_id, "???", "", AgentLevel::Intern, "", "", None, vec![])
            .unwrap_err();
        assert!(matches!(err, TeamManagerError::EmptyDerivedId(_)));
    }

    #[test]
    fn start_stop_agent_toggles_status_and_scheduler_job() {
        let (mgr, memory) = manager();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        let agent = mgr
            .create_agent(&team.team_id, "Alice", "", AgentLevel::Specialist, "", "", None, vec![])
            .expect("create_agent should succeed");

        mgr.start_agent(&agent.agent_id, "*/5 * * * *").expect("start_agent should succeed");
        let started = mgr.get_agent(&agent.agent_id).expect("get_agent should succeed").expect("agent should exist");
        assert_eq!(started.status, AgentStatus::Active);
        assert!(started.heartbeat_schedule.is_some());

        mgr.stop_agent(&agent.agent_id).expect("stop_agent should succeed");
        let stopped = mgr.get_agent(&agent.agent_id).expect("get_agent should succeed").expect("agent should exist");
        assert_eq!(stopped.status, AgentStatus::Stopped);
    }

    #[test]
    fn run_heartbeat_drains_mailbox_and_stamps_last_heartbeat() {
        let (mgr, memory) = manager();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        let agent = mgr
            .create_agent(&team.team_id, "Alice", "", AgentLevel::Specialist, "", "", None, vec![])
            .expect("create_agent should succeed");
        memory
            .send_to_mailbox(&agent.agent_id, None, Some("owner@telegram"), "hi", None)
            .expect("send_to_mailbox should succeed");

        let drained = mgr.run_heartbeat(&agent.agent_id).expect("run_heartbeat should succeed");
        assert_eq!(drained.len(), 1);

        let refreshed = mgr.get_agent(&agent.agent_id).expect("get_agent should succeed").expect("agent should exist");
        assert!(refreshed.last_heartbeat_at.is_some());
    }

    #[test]
    fn system_prompt_includes_identity_and_facts() {
        let (mgr, memory) = manager();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        memory.save_fact(&team.team_id, "tz", "UTC", "owner").expect("save_fact should succeed");
        let agent = mgr
            .create_agent(&team.team_id, "Alice", "engineer", AgentLevel::Specialist, "calm", "be terse", None, vec![])
            .expect("create_agent should succeed");
        assert!(agent.system_prompt.contains("Alice"));
        assert!(agent.system_prompt.contains("tz: UTC"));
    }
}
