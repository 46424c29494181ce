//! Team tool handlers: the seam through which an Agent Run's tool calls
//! reach C9 (Team Memory) and C10 (Team Manager), per the overview's data
//! flow note that tool calls "may invoke C9/C10/C11 internally".
//!
//! Every handler here is scoped to a single team id, bound at construction —
//! an agent's tool definitions never expose a `team_id` argument the model
//! could spoof to reach another team's workspace.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ToolGuard, ToolHandler, ToolOutput};
use crate::providers::ToolDefinition;
use crate::team::manager::{parse_mentions, TeamManager};
use crate::team::memory::TeamMemory;
use crate::types::TaskStatus;

/// Prefix shared by every team tool's name, so a profile's `allowed_tools`
/// can admit the whole surface with `group:team` (see
/// [`expand_tool_group`]).
pub const GROUP_PREFIX: &str = "team_";

/// Tool names belonging to `group:team`, in registration order.
pub const GROUP_MEMBERS: &[&str] = &[
    "team_create_task",
    "team_list_tasks",
    "team_update_task",
    "team_assign_task",
    "team_post_comment",
    "team_save_fact",
    "team_search_facts",
    "team_send_mailbox",
    "team_save_document",
];

/// Expand `group:team` to its member tool names; any other name passes
/// through unchanged. Mirrors the spec's "tool groups expand deterministically
/// to their member tools".
#[must_use]
pub fn expand_tool_group(name: &str) -> Vec<String> {
    if name == "group:team" {
        GROUP_MEMBERS.iter().map(|s| (*s).to_owned()).collect()
    } else {
        vec![name.to_owned()]
    }
}

fn task_status_from_str(s: &str) -> anyhow::Result<TaskStatus> {
    let status = match s {
        "inbox" => TaskStatus::Inbox,
        "assigned" => TaskStatus::Assigned,
        "in_progress" => TaskStatus::InProgress,
        "review" => TaskStatus::Review,
        "done" => TaskStatus::Done,
        "blocked" => TaskStatus::Blocked,
        "cancelled" => TaskStatus::Cancelled,
        other => anyhow::bail!("unknown task status: {other}"),
    };
    Ok(status)
}

/// `team_create_task`: open a new task in the `inbox` state.
pub struct CreateTaskTool {
    team_id: String,
    agent_id: String,
    memory: Arc<TeamMemory>,
}

impl CreateTaskTool {
    /// Build a task-creation tool scoped to `team_id`, attributing created
    /// tasks to `agent_id`.
    pub fn new(team_id: impl Into<String>, agent_id: impl Into<String>, memory: Arc<TeamMemory>) -> Self {
        Self {
            team_id: team_id.into(),
            agent_id: agent_id.into(),
            memory,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskArgs {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    labels: Vec<String>,
}

fn default_priority() -> u8 {
    3
}

#[async_trait]
impl ToolHandler for CreateTaskTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_create_task".to_owned(),
            description: "Open a new team task in the inbox.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "priority": { "type": "integer", "minimum": 1, "maximum": 5 },
                    "labels": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["title"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: CreateTaskArgs = serde_json::from_value(arguments)?;
        let task = self.memory.create_task(
            &self.team_id,
            &args.title,
            &args.description,
            args.priority.clamp(1, 5),
            args.labels,
            &self.agent_id,
        )?;
        Ok(ToolOutput::ok(format!(
            "created task {} ({:?})",
            task.task_id, task.status
        )))
    }
}

/// `team_list_tasks`: list tasks for the bound team, optionally filtered by
/// status.
pub struct ListTasksTool {
    team_id: String,
    memory: Arc<TeamMemory>,
}

impl ListTasksTool {
    /// Build a task lister scoped to `team_id`.
    pub fn new(team_id: impl Into<String>, memory: Arc<TeamMemory>) -> Self {
        Self {
            team_id: team_id.into(),
            memory,
        }
    }
}

#[async_trait]
impl ToolHandler for ListTasksTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_list_tasks".to_owned(),
            description: "List the team's tasks, optionally filtered by status.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["inbox", "assigned", "in_progress", "review", "done", "blocked", "cancelled"]
                    }
                }
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let status = arguments
            .get("status")
            .and_then(Value::as_str)
            .map(task_status_from_str)
            .transpose()?;
        let tasks = self.memory.list_tasks(&self.team_id, status)?;
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| format!("{} [{}] {}", t.task_id, t.status.as_str(), t.title))
            .collect();
        Ok(ToolOutput::ok(lines.join("\n")))
    }
}

/// `team_update_task`: transition a task's status.
pub struct UpdateTaskTool {
    memory: Arc<TeamMemory>,
}

impl UpdateTaskTool {
    /// Build a task-status updater over the shared team memory.
    pub fn new(memory: Arc<TeamMemory>) -> Self {
        Self { memory }
    }
}

#[derive(Debug, Deserialize)]
struct UpdateTaskArgs {
    task_id: String,
    status: String,
    #[serde(default)]
    blocked_reason: Option<String>,
}

#[async_trait]
impl ToolHandler for UpdateTaskTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_update_task".to_owned(),
            description: "Transition a task to a new status. blocked_reason is required when status is blocked.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "status": {
                        "type": "string",
                        "enum": ["inbox", "assigned", "in_progress", "review", "done", "blocked", "cancelled"]
                    },
                    "blocked_reason": { "type": "string" }
                },
                "required": ["task_id", "status"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: UpdateTaskArgs = serde_json::from_value(arguments)?;
        let status = task_status_from_str(&args.status)?;
        match self.memory.update_task_status(&args.task_id, status, args.blocked_reason) {
            Ok(task) => Ok(ToolOutput::ok(format!("task {} is now {}", task.task_id, task.status.as_str()))),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}

/// `team_assign_task`: assign agents to a task, auto-subscribing them.
pub struct AssignTaskTool {
    memory: Arc<TeamMemory>,
}

impl AssignTaskTool {
    /// Build a task-assignment tool over the shared team memory.
    pub fn new(memory: Arc<TeamMemory>) -> Self {
        Self { memory }
    }
}

#[derive(Debug, Deserialize)]
struct AssignTaskArgs {
    task_id: String,
    agent_ids: Vec<String>,
}

#[async_trait]
impl ToolHandler for AssignTaskTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_assign_task".to_owned(),
            description: "Assign one or more agents to a task.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "agent_ids": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["task_id", "agent_ids"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: AssignTaskArgs = serde_json::from_value(arguments)?;
        match self.memory.assign_task(&args.task_id, &args.agent_ids) {
            Ok(task) => Ok(ToolOutput::ok(format!(
                "task {} assignees: {}",
                task.task_id,
                task.assignees.join(", ")
            ))),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}

/// `team_post_comment`: post to a task thread (or an unthreaded team
/// message), resolving `@mentions` against the team's known agent ids.
pub struct PostCommentTool {
    team_id: String,
    agent_id: String,
    memory: Arc<TeamMemory>,
    manager: Arc<TeamManager>,
}

impl PostCommentTool {
    /// Build a thread-comment tool scoped to `team_id`, attributing posts to
    /// `agent_id`.
    pub fn new(
        team_id: impl Into<String>,
        agent_id: impl Into<String>,
        memory: Arc<TeamMemory>,
        manager: Arc<TeamManager>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            agent_id: agent_id.into(),
            memory,
            manager,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostCommentArgs {
    body: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[async_trait]
impl ToolHandler for PostCommentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_post_comment".to_owned(),
            description: "Post a comment to a task thread, notifying any @mentioned teammates.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "body": { "type": "string" },
                    "thread_id": { "type": "string" }
                },
                "required": ["body"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: PostCommentArgs = serde_json::from_value(arguments)?;
        let known_ids: Vec<String> = self
            .manager
            .list_agents(&self.team_id)?
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        let mentions = parse_mentions(&args.body, &known_ids);
        let message = self.memory.post_message(
            &self.team_id,
            args.thread_id.as_deref(),
            Some(&self.agent_id),
            &args.body,
            mentions,
        )?;
        Ok(ToolOutput::ok(format!("posted message {}", message.message_id)))
    }
}

/// `team_save_fact`: upsert a shared fact for the team.
pub struct SaveFactTool {
    team_id: String,
    agent_id: String,
    memory: Arc<TeamMemory>,
}

impl SaveFactTool {
    /// Build a fact-saving tool scoped to `team_id`, attributing facts to
    /// `agent_id`.
    pub fn new(team_id: impl Into<String>, agent_id: impl Into<String>, memory: Arc<TeamMemory>) -> Self {
        Self {
            team_id: team_id.into(),
            agent_id: agent_id.into(),
            memory,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SaveFactArgs {
    key: String,
    value: String,
}

#[async_trait]
impl ToolHandler for SaveFactTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_save_fact".to_owned(),
            description: "Record or update a shared team fact by key.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "value": { "type": "string" }
                },
                "required": ["key", "value"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: SaveFactArgs = serde_json::from_value(arguments)?;
        let fact = self.memory.save_fact(&self.team_id, &args.key, &args.value, &self.agent_id)?;
        Ok(ToolOutput::ok(format!("saved fact {}={}", fact.key, fact.value)))
    }
}

/// `team_search_facts`: substring-search facts by key or value.
pub struct SearchFactsTool {
    team_id: String,
    memory: Arc<TeamMemory>,
}

impl SearchFactsTool {
    /// Build a fact-search tool scoped to `team_id`.
    pub fn new(team_id: impl Into<String>, memory: Arc<TeamMemory>) -> Self {
        Self {
            team_id: team_id.into(),
            memory,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchFactsArgs {
    query: String,
}

#[async_trait]
impl ToolHandler for SearchFactsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_search_facts".to_owned(),
            description: "Substring-search the team's shared facts.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: SearchFactsArgs = serde_json::from_value(arguments)?;
        let facts = self.memory.search_facts(&self.team_id, &args.query)?;
        let lines: Vec<String> = facts.iter().map(|f| format!("{}: {}", f.key, f.value)).collect();
        Ok(ToolOutput::ok(lines.join("\n")))
    }
}

/// `team_send_mailbox`: enqueue a direct mailbox message to another agent.
pub struct SendMailboxTool {
    agent_id: String,
    memory: Arc<TeamMemory>,
}

impl SendMailboxTool {
    /// Build a mailbox-send tool attributing sends to `agent_id`.
    pub fn new(agent_id: impl Into<String>, memory: Arc<TeamMemory>) -> Self {
        Self {
            agent_id: agent_id.into(),
            memory,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMailboxArgs {
    to_agent: String,
    content: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[async_trait]
impl ToolHandler for SendMailboxTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_send_mailbox".to_owned(),
            description: "Send a direct mailbox message to another persistent agent.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "to_agent": { "type": "string" },
                    "content": { "type": "string" },
                    "thread_id": { "type": "string" }
                },
                "required": ["to_agent", "content"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: SendMailboxArgs = serde_json::from_value(arguments)?;
        let message = self.memory.send_to_mailbox(
            &args.to_agent,
            Some(&self.agent_id),
            None,
            &args.content,
            args.thread_id.as_deref(),
        )?;
        Ok(ToolOutput::ok(format!("queued mailbox entry {}", message.id)))
    }
}

/// `team_save_document`: write a new version of a shared team document.
pub struct SaveDocumentTool {
    team_id: String,
    agent_id: String,
    memory: Arc<TeamMemory>,
}

impl SaveDocumentTool {
    /// Build a document-saving tool scoped to `team_id`, attributing
    /// versions to `agent_id`.
    pub fn new(team_id: impl Into<String>, agent_id: impl Into<String>, memory: Arc<TeamMemory>) -> Self {
        Self {
            team_id: team_id.into(),
            agent_id: agent_id.into(),
            memory,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SaveDocumentArgs {
    doc_key: String,
    title: String,
    #[serde(default = "default_doc_type")]
    doc_type: String,
    #[serde(default = "default_format")]
    format: String,
    body: String,
    #[serde(default)]
    task_id: Option<String>,
}

fn default_doc_type() -> String {
    "note".to_owned()
}

fn default_format() -> String {
    "markdown".to_owned()
}

#[async_trait]
impl ToolHandler for SaveDocumentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "team_save_document".to_owned(),
            description: "Write a new version of a shared team document, identified by doc_key.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "doc_key": { "type": "string" },
                    "title": { "type": "string" },
                    "doc_type": { "type": "string" },
                    "format": { "type": "string" },
                    "body": { "type": "string" },
                    "task_id": { "type": "string" }
                },
                "required": ["doc_key", "title", "body"]
            }),
        }
    }

    fn guard(&self) -> ToolGuard {
        ToolGuard::User
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: SaveDocumentArgs = serde_json::from_value(arguments)?;
        let doc = self.memory.save_document(
            &self.team_id,
            &args.doc_key,
            args.task_id.as_deref(),
            &args.title,
            &args.doc_type,
            &args.format,
            &args.body,
            &self.agent_id,
        )?;
        Ok(ToolOutput::ok(format!("saved {} v{}", doc.doc_key, doc.version)))
    }
}

/// Build every `group:team` handler, scoped to one team and attributed to
/// one acting agent. The composition root registers these alongside the
/// channel-agnostic [`super::builtin`] tools on any profile whose
/// `allowed_tools` names `group:team` (expanded via [`expand_tool_group`]).
pub fn build_team_tool_handlers(
    team_id: &str,
    agent_id: &str,
    memory: Arc<TeamMemory>,
    manager: Arc<TeamManager>,
) -> Vec<Box<dyn ToolHandler>> {
    vec![
        Box::new(CreateTaskTool::new(team_id, agent_id, Arc::clone(&memory))),
        Box::new(ListTasksTool::new(team_id, Arc::clone(&memory))),
        Box::new(UpdateTaskTool::new(Arc::clone(&memory))),
        Box::new(AssignTaskTool::new(Arc::clone(&memory))),
        Box::new(PostCommentTool::new(team_id, agent_id, Arc::clone(&memory), manager)),
        Box::new(SaveFactTool::new(team_id, agent_id, Arc::clone(&memory))),
        Box::new(SearchFactsTool::new(team_id, Arc::clone(&memory))),
        Box::new(SendMailboxTool::new(agent_id, Arc::clone(&memory))),
        Box::new(SaveDocumentTool::new(team_id, agent_id, memory)),
    ]
}
