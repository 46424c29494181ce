//! C13: Group Policy — per-group activation mode, quiet hours, and an
//! allowlist layered on top of the Access Manager's group allow/block sets.

use std::sync::Arc;

use chrono::{NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{DbError, Store};

/// When a group-scoped message is eligible for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// The agent replies to every message in the group.
    Always,
    /// The agent only replies when explicitly mentioned.
    MentionOnly,
    /// The agent never initiates a reply (policy-muted).
    Off,
}

impl Default for ActivationMode {
    fn default() -> Self {
        Self::MentionOnly
    }
}

/// Per-group policy: activation mode and an optional quiet-hours window
/// during which the group is treated as muted regardless of mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// How eagerly the agent participates in this group.
    pub activation: ActivationMode,
    /// Quiet hours start, `HH:MM`, in UTC.
    pub quiet_hours_start: Option<String>,
    /// Quiet hours end, `HH:MM`, in UTC.
    pub quiet_hours_end: Option<String>,
}

/// Errors raised by group-policy operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupPolicyError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Loads and persists [`GroupPolicy`] rows, one per `(channel, group_id)`.
pub struct GroupPolicyManager {
    store: Arc<Store>,
}

impl GroupPolicyManager {
    /// Build a manager over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Load the policy for a group, defaulting to mention-only activation
    /// with no quiet hours when no row exists.
    ///
    /// # Errors
    ///
    /// Returns [`GroupPolicyError`] on storage failure.
    pub fn get(&self, channel: &str, group_id: &str) -> Result<GroupPolicy, GroupPolicyError> {
        let raw: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT policy_json FROM group_policies WHERE channel = ?1 AND group_id = ?2",
                rusqlite::params![channel, group_id],
                |row| row.get(0),
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

        Ok(raw
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default())
    }

    /// Persist a policy for a group, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns [`GroupPolicyError`] on storage failure.
    pub fn set(&self, channel: &str, group_id: &str, policy: &GroupPolicy) -> Result<(), GroupPolicyError> {
        let json = serde_json::to_string(policy).unwrap_or_default();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_policies (channel, group_id, policy_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT (channel, group_id) DO UPDATE SET policy_json = excluded.policy_json",
                rusqlite::params![channel, group_id, json],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Whether the group is currently in its quiet-hours window (UTC),
    /// supporting overnight windows where `start > end`.
    #[must_use]
    pub fn in_quiet_hours(policy: &GroupPolicy) -> bool {
        let (Some(start), Some(end)) = (&policy.quiet_hours_start, &policy.quiet_hours_end) else {
            return false;
        };
        let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
            return false;
        };
        let now = Utc::now().time();
        if start <= end {
            now >= start && now < end
        } else {
            now >= start || now < end
        }
    }

    /// Whether this group should gate an inbound message given its
    /// activation mode, quiet hours, and whether the agent was mentioned.
    #[must_use]
    pub fn should_respond(policy: &GroupPolicy, was_mentioned: bool) -> bool {
        if Self::in_quiet_hours(policy) {
            return false;
        }
        match policy.activation {
            ActivationMode::Always => true,
            ActivationMode::MentionOnly => was_mentioned,
            ActivationMode::Off => false,
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_mention_only_with_no_quiet_hours() {
        let mgr = GroupPolicyManager::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")));
        let policy = mgr.get("slack", "C123").expect("get should succeed");
        assert_eq!(policy.activation, ActivationMode::MentionOnly);
        assert!(!GroupPolicyManager::in_quiet_hours(&policy));
    }

    #[test]
    fn set_then_get_round_trips() {
        let mgr = GroupPolicyManager::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")));
        let policy = GroupPolicy {
            activation: ActivationMode::Always,
            quiet_hours_start: Some("22:00".to_owned()),
            quiet_hours_end: Some("07:00".to_owned()),
        };
        mgr.set("slack", "C123", &policy).expect("set should succeed");
        let loaded = mgr.get("slack", "C123").expect("get should succeed");
        assert_eq!(loaded.activation, ActivationMode::Always);
        assert_eq!(loaded.quiet_hours_start.as_deref(), Some("22:00"));
    }

    #[test]
    fn mention_only_requires_mention() {
        let policy = GroupPolicy {
            activation: ActivationMode::MentionOnly,
            ..Default::default()
        };
        assert!(!GroupPolicyManager::should_respond(&policy, false));
        assert!(GroupPolicyManager::should_respond(&policy, true));
    }

    #[test]
    fn off_never_responds() {
        let policy = GroupPolicy {
            activation: ActivationMode::Off,
            ..Default::default()
        };
        assert!(!GroupPolicyManager::should_respond(&policy, true));
    }

    #[test]
    fn overnight_quiet_hours_window_wraps_midnight() {
        let policy = GroupPolicy {
            quiet_hours_start: Some("00:00".to_owned()),
            quiet_hours_end: Some("23:59".to_owned()),
            ..Default::default()
        };
        assert!(GroupPolicyManager::in_quiet_hours(&policy));
    }
}
