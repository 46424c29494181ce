//! Shared data model: session keys, principals, pairing, teams, tasks.
//!
//! These types are the nouns every component (`access`, `pairing`, `session`,
//! `team`) passes between each other. Kept in one module so the foreign-key
//! shape of the SQLite schema has a single Rust-side source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel a message or event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Telegram chat.
    Telegram,
    /// Slack workspace channel.
    Slack,
    /// WhatsApp conversation.
    WhatsApp,
    /// Authenticated inbound webhook.
    Webhook,
    /// Scheduled/cron-triggered context (no external channel).
    Cron,
}

/// Normalized, channel-qualified identity for a user or group (C1).
///
/// A [`SessionKey`] is the primary key for everything session- and
/// access-control-scoped: `(channel, normalized_jid)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Channel the identity belongs to.
    pub channel: Channel,
    /// Normalized jabber-id-shaped identity string, e.g. `"12345"`,
    /// `"teamid:channelid"`, `"447700900000"`.
    pub jid: String,
}

impl SessionKey {
    /// Build a session key from a channel and a raw (not-yet-normalized) id.
    pub fn new(channel: Channel, jid: impl Into<String>) -> Self {
        Self {
            channel,
            jid: jid.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.channel, self.jid)
    }
}

/// Authorization tier assigned to a principal (C2).
///
/// Ordered lowest to highest so `PartialOrd`/`Ord` can express "at least
/// Admin" checks directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// No standing grant; subject to `DefaultPolicy`.
    None,
    /// Explicitly granted user.
    User,
    /// Administrative principal — can grant/revoke other users.
    Admin,
    /// System owner — always allowed, cannot be blocked.
    Owner,
}

/// Access level granted to whoever redeems a [`PairingToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRole {
    /// Grants [`AccessLevel::User`].
    User,
    /// Grants [`AccessLevel::Admin`].
    Admin,
}

impl PairingRole {
    /// The [`AccessLevel`] this role grants on redemption.
    #[must_use]
    pub fn access_level(self) -> AccessLevel {
        match self {
            Self::User => AccessLevel::User,
            Self::Admin => AccessLevel::Admin,
        }
    }
}

/// Pairing token issued to bootstrap trust for a new principal (C3).
///
/// Unlike a [`PairingRequest`], a token is minted ahead of time (typically
/// by an owner/admin) and handed out of band; redeeming it either grants
/// access immediately (`auto_approve`) or creates a pending request for an
/// admin to approve, depending on how it was minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingToken {
    /// 48 lowercase-hex-character single-use token value.
    pub token: String,
    /// Channel the token was minted for.
    pub channel: Channel,
    /// Access level granted on redemption.
    pub role: PairingRole,
    /// Maximum number of redemptions allowed; `0` means unlimited.
    pub max_uses: u32,
    /// Redemptions consumed so far.
    pub use_count: u32,
    /// Whether redemption grants access immediately, bypassing the normal
    /// pairing-request approval step.
    pub auto_approve: bool,
    /// Workspace/team the redeemer is assigned to on successful redemption.
    pub workspace_id: Option<String>,
    /// Free-form note recorded by whoever minted the token.
    pub note: Option<String>,
    /// Session key of whoever minted the token, if known.
    pub created_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time — redemption after this time fails.
    pub expires_at: DateTime<Utc>,
    /// Set once the token has been explicitly revoked.
    pub revoked: bool,
}

/// A pending request to pair a new principal, awaiting owner/admin decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    /// Unique request id.
    pub request_id: Uuid,
    /// Session key of the requester.
    pub session_key: SessionKey,
    /// Optional display name supplied by the requester.
    pub display_name: Option<String>,
    /// Team workspace the requester is asking to join, if any.
    pub team_id: Option<String>,
    /// When the request was created.
    pub requested_at: DateTime<Utc>,
}

/// Seniority tier of a persistent agent (C9/C10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLevel {
    /// Narrow-scope, closely supervised.
    Intern,
    /// Default tier — handles its assigned domain independently.
    Specialist,
    /// Coordinates other agents within the team.
    Lead,
}

impl AgentLevel {
    /// The string stored in `persistent_agents.level`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intern => "intern",
            Self::Specialist => "specialist",
            Self::Lead => "lead",
        }
    }

    /// Parse from the stored string, defaulting to [`Self::Specialist`] on
    /// an unrecognized value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "intern" => Self::Intern,
            "lead" => Self::Lead,
            _ => Self::Specialist,
        }
    }
}

/// Lifecycle status of a persistent agent (C9/C10).
///
/// Invariant: an agent with status [`Self::Stopped`] has no scheduled
/// heartbeat job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered but not currently running a turn or heartbeat.
    Idle,
    /// Mid-turn or mid-heartbeat.
    Active,
    /// Waiting on something external (e.g. a blocked task).
    Blocked,
    /// Heartbeat unregistered; will not run until restarted.
    Stopped,
    /// Last run/heartbeat ended in an unhandled error.
    Error,
}

impl AgentStatus {
    /// The string stored in `persistent_agents.status`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Parse from the stored string, defaulting to [`Self::Idle`] on an
    /// unrecognized value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "blocked" => Self::Blocked,
            "stopped" => Self::Stopped,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// A team workspace: the top-level container persistent agents, tasks,
/// facts, and documents all belong to (C9/C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    /// Unique team id.
    pub team_id: String,
    /// Display name.
    pub name: String,
    /// Session key string of the human who owns this team, used as the
    /// default `owner` destination for notifications.
    pub owner_jid: String,
    /// Default model for agents that don't override it.
    pub default_model: Option<String>,
    /// Filesystem root for this team's memory tree / documents export.
    pub workspace_path: Option<String>,
    /// Whether the team is active; a disabled team's agents do not heartbeat.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A persistent, named agent belonging to a team (C9/C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentAgent {
    /// Derived from `display_name`; stable once assigned.
    pub agent_id: String,
    /// Team this agent belongs to.
    pub team_id: String,
    /// Human-facing display name.
    pub display_name: String,
    /// Free-form role description (e.g. "backend engineer").
    pub role: String,
    /// Seniority tier.
    pub level: AgentLevel,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Personality block included in the system prompt.
    pub personality: String,
    /// Standing instructions included in the system prompt.
    pub instructions: String,
    /// Model override; falls back to the team default when unset.
    pub model: Option<String>,
    /// Named skills/specializations.
    pub skills: Vec<String>,
    /// Five-field POSIX cron expression for heartbeats, if registered.
    pub heartbeat_schedule: Option<String>,
    /// Assembled system prompt as of the last rebuild.
    pub system_prompt: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time this agent completed a turn.
    pub last_active_at: Option<DateTime<Utc>>,
    /// Last time this agent's heartbeat fired.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Status of a [`TeamTask`] through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Newly created, unassigned.
    Inbox,
    /// Has at least one assignee but work has not started.
    Assigned,
    /// Actively being worked.
    InProgress,
    /// Awaiting review before completion.
    Review,
    /// Completed; `completed_at` is set.
    Done,
    /// Stalled; `blocked_reason` is required.
    Blocked,
    /// Abandoned without completion.
    Cancelled,
}

impl TaskStatus {
    /// The string stored in `team_tasks.state`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the stored string, defaulting to [`Self::Inbox`] on an
    /// unrecognized value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "assigned" => Self::Assigned,
            "in_progress" => Self::InProgress,
            "review" => Self::Review,
            "done" => Self::Done,
            "blocked" => Self::Blocked,
            "cancelled" => Self::Cancelled,
            _ => Self::Inbox,
        }
    }
}

/// A unit of work tracked within a team (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamTask {
    /// Unique task id.
    pub task_id: String,
    /// Owning team.
    pub team_id: String,
    /// Short title.
    pub title: String,
    /// Longer-form description.
    pub description: String,
    /// Current status.
    pub status: TaskStatus,
    /// Agent ids assigned to this task.
    pub assignees: Vec<String>,
    /// Priority, 1 (highest) through 5 (lowest).
    pub priority: u8,
    /// Free-form labels.
    pub labels: Vec<String>,
    /// Who created the task (agent id or session key string).
    pub created_by: String,
    /// Required when `status == Blocked`.
    pub blocked_reason: Option<String>,
    /// Set when `status` transitions to `Done`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// A comment posted to a task thread (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMessage {
    /// Unique message id.
    pub message_id: String,
    /// Owning team.
    pub team_id: String,
    /// Thread this message belongs to — `task_id` for task comments.
    pub thread_id: Option<String>,
    /// Authoring agent id, when posted by an agent.
    pub author_agent_id: Option<String>,
    /// Message body.
    pub body: String,
    /// Agent ids mentioned via `@agent-id` tokens.
    pub mentions: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A mailbox entry addressed to a single agent (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Unique message id.
    pub id: String,
    /// Recipient agent id.
    pub to_agent: String,
    /// Sending agent id, if sent by another agent.
    pub from_agent: Option<String>,
    /// Sending user's session key string, if sent by a human.
    pub from_user: Option<String>,
    /// Message content.
    pub content: String,
    /// Originating thread, if this arose from a task comment mention.
    pub thread_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read this entry.
    pub delivered: bool,
    /// When it was marked delivered.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A key/value fact shared across a team (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamFact {
    /// Owning team.
    pub team_id: String,
    /// Unique per team.
    pub key: String,
    /// Free-form value.
    pub value: String,
    /// Who last wrote this fact (agent id or session key string).
    pub author: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// A versioned document owned by a team (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamDocument {
    /// Owning team.
    pub team_id: String,
    /// Unique key within the team; stable across versions.
    pub doc_key: String,
    /// Task this document is attached to, if any.
    pub task_id: Option<String>,
    /// Display title.
    pub title: String,
    /// Free-form document type, e.g. `"design"`, `"runbook"`.
    pub doc_type: String,
    /// Content format, e.g. `"markdown"`.
    pub format: String,
    /// Who wrote this version.
    pub author: String,
    /// Monotonically increasing; never decreases on update.
    pub version: u32,
    /// Document body as of this version.
    pub body: String,
    /// Creation time (of the first version).
    pub created_at: DateTime<Utc>,
    /// Last update time (of this version).
    pub updated_at: DateTime<Utc>,
}

/// Why an agent is subscribed to a thread (C9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionReason {
    /// Subscribed by posting a comment.
    Commented,
    /// Subscribed by being `@mentioned`.
    Mentioned,
    /// Subscribed by being assigned to the owning task.
    Assigned,
}

impl SubscriptionReason {
    /// The string stored in `thread_subscriptions.reason`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commented => "commented",
            Self::Mentioned => "mentioned",
            Self::Assigned => "assigned",
        }
    }
}

/// An agent's standing interest in a task thread, created automatically the
/// first time it comments, is mentioned, or is assigned (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSubscription {
    /// Owning team.
    pub team_id: String,
    /// Thread id (equals the owning task's id).
    pub thread_id: String,
    /// Subscribed agent id.
    pub agent_id: String,
    /// How the subscription was created.
    pub reason: SubscriptionReason,
    /// Creation time.
    pub subscribed_at: DateTime<Utc>,
}

/// The WORKING.md analog: one row per agent capturing what it is doing right
/// now so a heartbeat can resume with context (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWorkingState {
    /// Owning agent.
    pub agent_id: String,
    /// Owning team.
    pub team_id: String,
    /// Task currently being worked, if any.
    pub current_task_id: Option<String>,
    /// Free-form status line.
    pub status: String,
    /// Free-form description of the next steps planned.
    pub next_steps: String,
    /// Free-form additional context carried between heartbeats.
    pub context: String,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Outcome classification of the action a [`TeamNotification`] reports (C11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationResult {
    /// The reported action succeeded.
    Success,
    /// The reported action failed.
    Failure,
    /// The reported action completed with caveats.
    Warning,
    /// Purely informational, neither success nor failure.
    Info,
}

impl NotificationResult {
    /// The string stored in `team_notifications.result`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    /// Parse from the stored string, defaulting to [`Self::Info`] on an
    /// unrecognized value.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failure" => Self::Failure,
            "warning" => Self::Warning,
            _ => Self::Info,
        }
    }
}

/// An event raised by a persistent agent's activity, routed by the
/// Notification Dispatcher (C11) to channels/inbox/owner/activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamNotification {
    /// Unique notification id.
    pub id: String,
    /// Owning team.
    pub team_id: String,
    /// Event type, e.g. `"task_completed"`, `"task_blocked"`.
    pub notif_type: String,
    /// Agent id this notification concerns.
    pub agent_id: String,
    /// Display name of `agent_id` at the time of the event.
    pub agent_name: String,
    /// Task this notification concerns, if any.
    pub task_id: Option<String>,
    /// Short action description, e.g. `"completed task"`.
    pub action: String,
    /// Outcome classification.
    pub result: NotificationResult,
    /// Human-readable summary.
    pub message: String,
    /// Free-form extra detail (often rendered verbatim in a channel message).
    pub details: String,
    /// Priority, 1 (most urgent) through 5 (least).
    pub priority: u8,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Whether an owner/admin has marked this notification read.
    pub read: bool,
    /// When it was marked read.
    pub read_at: Option<DateTime<Utc>>,
}

/// One destination a matching [`NotificationRule`] fans a notification out
/// to (C11).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NotificationDestination {
    /// Deliver via the channel transport to `(channel, chat_id)`.
    Channel {
        /// Target channel.
        channel: Channel,
        /// Target chat id.
        chat_id: String,
    },
    /// Insert a [`PendingMessage`] for an agent's mailbox. `None` defaults to
    /// the notification's own `agent_id`.
    Inbox {
        /// Target agent id, or `None` for the notification's own agent.
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    /// Resolve the team's owner and deliver as an inbox entry to them.
    Owner,
    /// Record a `team_activities` row of type `"notification"`.
    Activity,
    /// Fire a [`crate::hooks::HookEvent`] carrying the notification payload.
    Webhook,
}

/// Quiet-hours window during which a [`NotificationRule`] suppresses all but
/// priority-1 notifications (C11).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    /// Window start, `HH:MM`, in the configured timezone (UTC if unset).
    pub start: String,
    /// Window end, `HH:MM`. `start > end` means the window wraps midnight.
    pub end: String,
    /// Optional day-of-week filter, `0` (Sunday) through `6` (Saturday).
    /// Empty means every day.
    #[serde(default)]
    pub days: Vec<u8>,
}

/// A rule matching [`TeamNotification`] events to a set of destinations,
/// with optional rate limiting and quiet hours (C11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    /// Unique rule id.
    pub rule_id: String,
    /// Scopes the rule to one team; `None` matches every team.
    pub team_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Whether the rule is currently active.
    pub enabled: bool,
    /// Event types this rule matches. Empty matches none (a rule must name
    /// at least one event to ever fire).
    pub events: Vec<String>,
    /// Restrict matching to these agent ids; empty matches any agent.
    pub agent_ids: Vec<String>,
    /// Restrict matching to notifications carrying at least one of these
    /// labels; empty matches any.
    pub labels: Vec<String>,
    /// Minimum urgency required to match: `0` matches any priority,
    /// otherwise the notification's priority must be `<=` this value
    /// (lower number = more urgent).
    pub min_priority: u8,
    /// Maximum dispatches allowed within a rolling wall-clock hour; `None`
    /// is unlimited.
    pub rate_limit_per_hour: Option<u32>,
    /// Quiet-hours window, if this rule respects one.
    pub quiet_hours: Option<QuietHours>,
    /// Optional message template override.
    pub template: Option<String>,
    /// Where matching notifications are fanned out to.
    pub destinations: Vec<NotificationDestination>,
}

/// Budget ceilings for a single agent run (C7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunBudget {
    /// Maximum reasoning/tool-call rounds before forced stop.
    pub max_rounds: u32,
    /// Maximum total tokens (input + output) across the run.
    pub max_tokens: u64,
    /// Maximum wall-clock duration in seconds.
    pub max_wallclock_secs: u64,
}

/// An in-flight agent run, persisted so it can be recovered after a crash
/// (C7, crash-recovery manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRun {
    /// Unique run id.
    pub run_id: Uuid,
    /// Session this run belongs to.
    pub session_key: SessionKey,
    /// Rounds completed so far.
    pub rounds_used: u32,
    /// Tokens consumed so far.
    pub tokens_used: u64,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Budget ceiling for this run.
    pub budget: RunBudget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_display_is_stable() {
        let key = SessionKey::new(Channel::Telegram, "12345");
        assert_eq!(key.to_string(), "Telegram:12345");
    }

    #[test]
    fn access_level_ordering() {
        assert!(AccessLevel::Owner > AccessLevel::Admin);
        assert!(AccessLevel::Admin > AccessLevel::User);
        assert!(AccessLevel::User > AccessLevel::None);
    }

    #[test]
    fn agent_level_round_trips_through_as_str() {
        for level in [AgentLevel::Intern, AgentLevel::Specialist, AgentLevel::Lead] {
            assert_eq!(AgentLevel::parse(level.as_str()), level);
        }
    }

    #[test]
    fn task_status_round_trips_through_as_str() {
        for status in [
            TaskStatus::Inbox,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Done,
            TaskStatus::Blocked,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unrecognized_agent_status_defaults_to_idle() {
        assert_eq!(AgentStatus::parse("bogus"), AgentStatus::Idle);
    }

    #[test]
    fn notification_result_round_trips_through_as_str() {
        for result in [
            NotificationResult::Success,
            NotificationResult::Failure,
            NotificationResult::Warning,
            NotificationResult::Info,
        ] {
            assert_eq!(NotificationResult::parse(result.as_str()), result);
        }
    }

    #[test]
    fn unrecognized_notification_result_defaults_to_info() {
        assert_eq!(NotificationResult::parse("bogus"), NotificationResult::Info);
    }
}
