//! C11: Notification Dispatcher — matches [`TeamNotification`] events
//! against stored rules and fans the matches out to channel/inbox/owner/
//! activity/webhook destinations, gated by quiet hours and a per-rule
//! rolling-hour rate limit.
//!
//! Notifications are persisted before any fan-out is attempted (spec §5):
//! a crash mid-dispatch loses at most the side effects of destinations not
//! yet attempted, never the notification record itself.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::channel::{ChannelError, ChannelSink};
use crate::db::{DbError, Store};
use crate::hooks::{HookEvent, HookManager};
use crate::team::memory::{TeamMemory, TeamMemoryError};
use crate::types::{NotificationDestination, NotificationResult, NotificationRule, QuietHours, TeamNotification};

/// Errors raised by notification-dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    /// Team-memory lookup failed while fanning out.
    #[error("team memory error: {0}")]
    Memory(#[from] TeamMemoryError),
    /// A channel-sink delivery failed.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Matches [`TeamNotification`]s against stored [`NotificationRule`]s and
/// delivers them to their configured destinations.
pub struct NotificationDispatcher {
    store: Arc<Store>,
    memory: Arc<TeamMemory>,
    channel_sink: Arc<dyn ChannelSink>,
    hooks: Option<Arc<HookManager>>,
}

impl NotificationDispatcher {
    /// Build a dispatcher. `hooks` is `None` when no webhook endpoints are
    /// configured; rules naming a [`NotificationDestination::Webhook`] are
    /// then skipped with a warning instead of failing the whole fan-out.
    pub fn new(
        store: Arc<Store>,
        memory: Arc<TeamMemory>,
        channel_sink: Arc<dyn ChannelSink>,
        hooks: Option<Arc<HookManager>>,
    ) -> Self {
        Self { store, memory, channel_sink, hooks }
    }

    /// Persist a new rule.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError`] on storage failure.
    #[allow(clippy::too_many_arguments)]
    pub fn add_rule(
        &self,
        team_id: Option<String>,
        name: &str,
        events: Vec<String>,
        agent_ids: Vec<String>,
        labels: Vec<String>,
        min_priority: u8,
        rate_limit_per_hour: Option<u32>,
        quiet_hours: Option<QuietHours>,
        template: Option<String>,
        destinations: Vec<NotificationDestination>,
    ) -> Result<NotificationRule, NotificationError> {
        let rule = NotificationRule {
            rule_id: Uuid::new_v4().to_string(),
            team_id,
            name: name.to_owned(),
            enabled: true,
            events,
            agent_ids,
            labels,
            min_priority,
            rate_limit_per_hour,
            quiet_hours,
            template,
            destinations,
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notification_rules (rule_id, team_id, name, enabled, events_json,
                                                  agent_ids_json, labels_json, min_priority,
                                                  rate_limit_per_hour, quiet_hours_json, template,
                                                  destinations_json)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    rule.rule_id,
                    rule.team_id,
                    rule.name,
                    serde_json::to_string(&rule.events).unwrap_or_default(),
                    serde_json::to_string(&rule.agent_ids).unwrap_or_default(),
                    serde_json::to_string(&rule.labels).unwrap_or_default(),
                    rule.min_priority,
                    rule.rate_limit_per_hour,
                    rule.quiet_hours.as_ref().map(|q| serde_json::to_string(q).unwrap_or_default()),
                    rule.template,
                    serde_json::to_string(&rule.destinations).unwrap_or_default(),
                ],
            )?;
            Ok(())
        })?;
        Ok(rule)
    }

    /// Enable or disable a rule.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError`] on storage failure.
    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), NotificationError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE notification_rules SET enabled = ?2 WHERE rule_id = ?1",
                rusqlite::params![rule_id, i32::from(enabled)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// List every enabled rule scoped to `team_id` or global (`team_id IS
    /// NULL`).
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError`] on storage failure.
    pub fn enabled_rules(&self, team_id: &str) -> Result<Vec<NotificationRule>, NotificationError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rule_id, team_id, name, enabled, events_json, agent_ids_json, labels_json,
                        min_priority, rate_limit_per_hour, quiet_hours_json, template, destinations_json
                 FROM notification_rules WHERE enabled = 1 AND (team_id IS NULL OR team_id = ?1)",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![team_id], row_to_rule_tuple)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(rows.into_iter().map(rule_from_tuple).collect())
    }

    /// Persist a notification and fan it out to every matching rule's
    /// destinations. Destination failures are logged and isolated — one
    /// failing destination never prevents the others from firing.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError`] if the notification itself cannot be
    /// persisted. Fan-out failures are swallowed after logging.
    #[allow(clippy::too_many_arguments)]
    pub async fn notify(
        &self,
        team_id: &str,
        notif_type: &str,
        agent_id: &str,
        agent_name: &str,
        task_id: Option<String>,
        action: &str,
        result: NotificationResult,
        message: &str,
        details: &str,
        priority: u8,
    ) -> Result<TeamNotification, NotificationError> {
        let notification = TeamNotification {
            id: Uuid::new_v4().to_string(),
            team_id: team_id.to_owned(),
            notif_type: notif_type.to_owned(),
            agent_id: agent_id.to_owned(),
            agent_name: agent_name.to_owned(),
            task_id,
            action: action.to_owned(),
            result,
            message: message.to_owned(),
            details: details.to_owned(),
            priority,
            created_at: Utc::now(),
            read: false,
            read_at: None,
        };
        self.persist(&notification)?;

        let rules = self.enabled_rules(team_id)?;
        for rule in rules {
            if !self.rule_matches(&rule, &notification)? {
                continue;
            }
            if self.in_quiet_hours(&rule) && notification.priority != 1 {
                continue;
            }
            if self.rate_limited(&rule)? {
                continue;
            }
            self.fan_out(&rule, &notification).await;
            self.log_dispatch(&rule.rule_id)?;
        }

        Ok(notification)
    }

    fn persist(&self, n: &TeamNotification) -> Result<(), NotificationError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_notifications (id, team_id, notif_type, agent_id, agent_name, task_id,
                                                  action, result, message, details, priority, created_at, read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
                rusqlite::params![
                    n.id, n.team_id, n.notif_type, n.agent_id, n.agent_name, n.task_id, n.action,
                    n.result.as_str(), n.message, n.details, n.priority, n.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn rule_matches(&self, rule: &NotificationRule, n: &TeamNotification) -> Result<bool, NotificationError> {
        if !rule.events.iter().any(|e| e == &n.notif_type) {
            return Ok(false);
        }
        if !rule.agent_ids.is_empty() && !rule.agent_ids.iter().any(|a| a == &n.agent_id) {
            return Ok(false);
        }
        if n.priority > 0 && rule.min_priority > 0 && n.priority > rule.min_priority {
            return Ok(false);
        }
        if !rule.labels.is_empty() {
            let task_labels = match &n.task_id {
                Some(task_id) => self.memory.get_task(task_id)?.map(|t| t.labels).unwrap_or_default(),
                None => Vec::new(),
            };
            if !rule.labels.iter().any(|l| task_labels.contains(l)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn in_quiet_hours(&self, rule: &NotificationRule) -> bool {
        let Some(quiet) = &rule.quiet_hours else {
            return false;
        };
        let (Some(start), Some(end)) = (parse_hhmm(&quiet.start), parse_hhmm(&quiet.end)) else {
            return false;
        };
        let now = Utc::now();
        if !quiet.days.is_empty() {
            let today = u8::try_from(now.weekday().num_days_from_sunday()).unwrap_or(0);
            if !quiet.days.contains(&today) {
                return false;
            }
        }
        let time = now.time();
        if start <= end {
            time >= start && time < end
        } else {
            time >= start || time < end
        }
    }

    fn rate_limited(&self, rule: &NotificationRule) -> Result<bool, NotificationError> {
        let Some(limit) = rule.rate_limit_per_hour else {
            return Ok(false);
        };
        let since = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let count: i64 = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notification_dispatch_log WHERE rule_id = ?1 AND dispatched_at >= ?2",
                rusqlite::params![rule.rule_id, since],
                |row| row.get(0),
            )
        })?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX) >= limit)
    }

    fn log_dispatch(&self, rule_id: &str) -> Result<(), NotificationError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notification_dispatch_log (rule_id, dispatched_at) VALUES (?1, ?2)",
                rusqlite::params![rule_id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    async fn fan_out(&self, rule: &NotificationRule, n: &TeamNotification) {
        let text = render(rule.template.as_deref(), n);
        for destination in &rule.destinations {
            if let Err(err) = self.deliver(destination, n, &text).await {
                warn!(rule_id = %rule.rule_id, notification_id = %n.id, %err, "notification destination failed");
            }
        }
    }

    async fn deliver(
        &self,
        destination: &NotificationDestination,
        n: &TeamNotification,
        text: &str,
    ) -> Result<(), NotificationError> {
        match destination {
            NotificationDestination::Channel { channel, chat_id } => {
                self.channel_sink.send(*channel, chat_id, text).await?;
            }
            NotificationDestination::Inbox { agent_id } => {
                let target = agent_id.clone().unwrap_or_else(|| n.agent_id.clone());
                self.memory.send_to_mailbox(&target, None, Some("notification-dispatcher"), text, n.task_id.as_deref())?;
            }
            NotificationDestination::Owner => {
                let owner = self.memory.owner_jid(&n.team_id)?;
                self.memory.send_to_mailbox(&owner, None, Some("notification-dispatcher"), text, n.task_id.as_deref())?;
            }
            NotificationDestination::Activity => {
                self.memory.record_activity(&n.team_id, "notification", &serde_json::to_value(n).unwrap_or_default())?;
            }
            NotificationDestination::Webhook => {
                if let Some(hooks) = &self.hooks {
                    let mut event = HookEvent::new(format!("notification.{}", n.notif_type));
                    event.message = Some(text.to_owned());
                    hooks.dispatch(&event).await;
                } else {
                    warn!(notification_id = %n.id, "webhook destination configured with no hook manager");
                }
            }
        }
        Ok(())
    }
}

fn render(template: Option<&str>, n: &TeamNotification) -> String {
    match template {
        Some(tpl) => tpl
            .replace("{agent_name}", &n.agent_name)
            .replace("{action}", &n.action)
            .replace("{message}", &n.message)
            .replace("{details}", &n.details)
            .replace("{result}", n.result.as_str()),
        None => format!("[{}] {} {} — {}", n.result.as_str(), n.agent_name, n.action, n.message),
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[allow(clippy::type_complexity)]
fn row_to_rule_tuple(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(
    String,
    Option<String>,
    String,
    i64,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
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
    ))
}

#[allow(clippy::type_complexity)]
fn rule_from_tuple(
    row: (
        String,
        Option<String>,
        String,
        i64,
        String,
        String,
        String,
        i64,
        Option<i64>,
        Option<String>,
        Option<String>,
        String,
    ),
) -> NotificationRule {
    let (
        rule_id, team_id, name, enabled, events_json, agent_ids_json, labels_json, min_priority,
        rate_limit_per_hour, quiet_hours_json, template, destinations_json,
    ) = row;
    NotificationRule {
        rule_id,
        team_id,
        name,
        enabled: enabled != 0,
        events: serde_json::from_str(&events_json).unwrap_or_default(),
        agent_ids: serde_json::from_str(&agent_ids_json).unwrap_or_default(),
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        min_priority: u8::try_from(min_priority).unwrap_or(0),
        rate_limit_per_hour: rate_limit_per_hour.map(|n| u32::try_from(n).unwrap_or(0)),
        quiet_hours: quiet_hours_json.as_deref().and_then(|s| serde_json::from_str(s).ok()),
        template,
        destinations: serde_json::from_str(&destinations_json).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannelSink;
    use crate::types::Channel;

    fn dispatcher() -> (NotificationDispatcher, Arc<TeamMemory>, Arc<RecordingChannelSink>) {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let memory = Arc::new(TeamMemory::new(store.clone()));
        let sink = Arc::new(RecordingChannelSink::new());
        let dispatcher = NotificationDispatcher::new(store, memory.clone(), sink.clone(), None);
        (dispatcher, memory, sink)
    }

    #[tokio::test]
    async fn matching_rule_delivers_to_channel_destination() {
        let (dispatcher, memory, sink) = dispatcher();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        dispatcher
            .add_rule(
                Some(team.team_id.clone()),
                "task completions",
                vec!["task_completed".to_owned()],
                vec![],
                vec![],
                0,
                None,
                None,
                None,
                vec![NotificationDestination::Channel { channel: Channel::Telegram, chat_id: "123".to_owned() }],
            )
            .expect("add_rule should succeed");

        dispatcher
            .notify(&team.team_id, "task_completed", "alice", "Alice", None, "completed task", NotificationResult::Success, "done", "", 3)
            .await
            .expect("call should succeed");

        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn non_matching_event_type_does_not_dispatch() {
        let (dispatcher, memory, sink) = dispatcher();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        dispatcher
            .add_rule(
                Some(team.team_id.clone()),
                "blocks",
                vec!["task_blocked".to_owned()],
                vec![],
                vec![],
                0,
                None,
                None,
                None,
                vec![NotificationDestination::Channel { channel: Channel::Telegram, chat_id: "123".to_owned() }],
            )
            .expect("add_rule should succeed");

        dispatcher
            .notify(&team.team_id, "task_completed", "alice", "Alice", None, "completed task", NotificationResult::Success, "done", "", 3)
            .await
            .expect("call should succeed");

        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_suppresses_dispatch_beyond_threshold() {
        let (dispatcher, memory, sink) = dispatcher();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        dispatcher
            .add_rule(
                Some(team.team_id.clone()),
                "limited",
                vec!["ping".to_owned()],
                vec![],
                vec![],
                0,
                Some(1),
                None,
                None,
                vec![NotificationDestination::Channel { channel: Channel::Telegram, chat_id: "123".to_owned() }],
            )
            .expect("add_rule should succeed");

        for _ in 0..3 {
            dispatcher
                .notify(&team.team_id, "ping", "alice", "Alice", None, "pinged", NotificationResult::Info, "hi", "", 3)
                .await
                .expect("call should succeed");
        }

        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn quiet_hours_suppress_unless_priority_one() {
        let (dispatcher, memory, sink) = dispatcher();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        dispatcher
            .add_rule(
                Some(team.team_id.clone()),
                "always quiet",
                vec!["ping".to_owned()],
                vec![],
                vec![],
                0,
                None,
                Some(QuietHours { start: "00:00".to_owned(), end: "23:59".to_owned(), days: vec![] }),
                None,
                vec![NotificationDestination::Channel { channel: Channel::Telegram, chat_id: "123".to_owned() }],
            )
            .expect("add_rule should succeed");

        dispatcher
            .notify(&team.team_id, "ping", "alice", "Alice", None, "pinged", NotificationResult::Info, "hi", "", 3)
            .await
            .expect("call should succeed");
        assert!(sink.sent().is_empty());

        dispatcher
            .notify(&team.team_id, "ping", "alice", "Alice", None, "pinged", NotificationResult::Info, "urgent", "", 1)
            .await
            .expect("call should succeed");
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn inbox_destination_enqueues_pending_message() {
        let (dispatcher, memory, _sink) = dispatcher();
        let team = memory.create_team("Acme", "owner@telegram", None, None).expect("create_team should succeed");
        dispatcher
            .add_rule(
                Some(team.team_id.clone()),
                "inbox copy",
                vec!["task_completed".to_owned()],
                vec![],
                vec![],
                0,
                None,
                None,
                None,
                vec![NotificationDestination::Inbox { agent_id: Some("bob".to_owned()) }],
            )
            .expect("add_rule should succeed");

        dispatcher
            .notify(&team.team_id, "task_completed", "alice", "Alice", None, "completed task", NotificationResult::Success, "done", "", 3)
            .await
            .expect("call should succeed");

        let mailbox = memory.drain_mailbox("bob").expect("drain_mailbox should succeed");
        assert_eq!(mailbox.len(), 1);
    }
}
