//! C2: Access Manager — authorization decisions for normalized identities.
//!
//! Precedence, highest first: Owner > Admin > BlockedGroups > BlockedUsers
//! (a block overrides an allowed group) > AllowedGroups > AllowedUsers /
//! explicitly granted > [`crate::config::AccessConfig::default_policy`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::AccessConfig;
use crate::db::Store;
use crate::types::{AccessLevel, Channel, SessionKey};

/// Decision returned by [`AccessManager::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Access is granted.
    Allowed(AccessLevel),
    /// Access is explicitly blocked.
    Blocked,
    /// No standing grant and the default policy is `Ask` — caller should
    /// prompt the owner and fall through to the pairing flow.
    AskPending,
    /// No standing grant and the default policy is `Deny`.
    Denied,
}

impl Decision {
    /// Returns `true` when the decision permits the action to proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Returns `true` when the caller should be prompted (`ShouldAsk`),
    /// i.e. this is the *first* unresolved `Ask`-policy encounter for the
    /// identity. Once [`AccessManager::mark_asked`] has recorded the
    /// prompt, subsequent checks fall through to `Denied` instead.
    pub fn should_ask(&self) -> bool {
        matches!(self, Self::AskPending)
    }
}

/// Errors raised by access-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] crate::db::DbError),
    /// Owners are config-only; `grant` cannot mint one at runtime.
    #[error("owner access level can only be configured, not granted at runtime")]
    OwnerGrantNotAllowed,
}

/// Authorization gate for every inbound identity.
pub struct AccessManager {
    store: Arc<Store>,
    default_policy: DefaultPolicy,
    owner: SessionKey,
    /// Additional config-seeded owners (`AccessConfig::owners`), checked
    /// alongside `owner`. Unlike `owner`, these are not fixed at
    /// construction — [`AccessManager::seed_config`] can add to them.
    owners: HashSet<SessionKey>,
}

/// Mirrors [`crate::config::AccessConfig::default_policy`] as a typed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    /// Allow unknown principals.
    Allow,
    /// Deny unknown principals.
    Deny,
    /// Prompt the owner once, remembering the decision.
    Ask,
}

impl DefaultPolicy {
    /// Parse from the config string, defaulting to `Ask` on an unknown value.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "allow" => Self::Allow,
            "deny" => Self::Deny,
            _ => Self::Ask,
        }
    }
}

impl AccessManager {
    /// Build an access manager backed by `store`, with `owner` always
    /// treated as [`AccessLevel::Owner`].
    pub fn new(store: Arc<Store>, default_policy: DefaultPolicy, owner: SessionKey) -> Self {
        Self {
            store,
            default_policy,
            owner,
            owners: HashSet::new(),
        }
    }

    /// Seed config-defined identity sets (`AccessConfig::owners`/`admins`/
    /// `blocked_groups`/`blocked_users`/`allowed_groups`/`allowed_users`)
    /// into the manager and store at startup. Entries that fail to parse as
    /// `channel:jid` (e.g. `"telegram:12345"`) are skipped with a warning.
    /// Safe to call more than once; later calls only add to the sets.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] on storage failure.
    pub fn seed_config(&mut self, config: &AccessConfig) -> Result<(), AccessError> {
        for raw in &config.owners {
            match parse_identity(raw) {
                Some(key) => {
                    self.owners.insert(key);
                }
                None => tracing::warn!(entry = raw, "skipping malformed owner entry in config"),
            }
        }
        for raw in &config.admins {
            match parse_identity(raw) {
                Some(key) => self.grant(&key, AccessLevel::Admin)?,
                None => tracing::warn!(entry = raw, "skipping malformed admin entry in config"),
            }
        }
        for raw in &config.allowed_users {
            match parse_identity(raw) {
                Some(key) => self.grant(&key, AccessLevel::User)?,
                None => tracing::warn!(entry = raw, "skipping malformed allowed-user entry in config"),
            }
        }
        for raw in &config.blocked_users {
            match parse_identity(raw) {
                Some(key) => self.block_user(&key)?,
                None => tracing::warn!(entry = raw, "skipping malformed blocked-user entry in config"),
            }
        }
        for raw in &config.allowed_groups {
            match parse_identity(raw) {
                Some(key) => self.set_group_policy(key.channel, &key.jid, true)?,
                None => tracing::warn!(entry = raw, "skipping malformed allowed-group entry in config"),
            }
        }
        for raw in &config.blocked_groups {
            match parse_identity(raw) {
                Some(key) => self.set_group_policy(key.channel, &key.jid, false)?,
                None => tracing::warn!(entry = raw, "skipping malformed blocked-group entry in config"),
            }
        }
        Ok(())
    }

    /// Evaluate the authorization decision for `key`, optionally scoped to a
    /// group the message arrived in (`group_id`).
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] on storage failure.
    pub fn check(&self, key: &SessionKey, group_id: Option<&str>) -> Result<Decision, AccessError> {
        if *key == self.owner || self.owners.contains(key) {
            return Ok(Decision::Allowed(AccessLevel::Owner));
        }

        let grant = self.grant_level(key)?;
        if grant == AccessLevel::Admin {
            return Ok(Decision::Allowed(AccessLevel::Admin));
        }

        if let Some(group) = group_id {
            if self.group_blocked(key.channel, group)? {
                debug!(session = %key, group, "blocked via group block list");
                return Ok(Decision::Blocked);
            }
        }

        if self.user_blocked(key)? {
            debug!(session = %key, "blocked via user block list");
            return Ok(Decision::Blocked);
        }

        if let Some(group) = group_id {
            if self.group_allowed(key.channel, group)? {
                return Ok(Decision::Allowed(AccessLevel::User));
            }
        }

        if grant >= AccessLevel::User {
            return Ok(Decision::Allowed(grant));
        }

        match self.default_policy {
            DefaultPolicy::Allow => Ok(Decision::Allowed(AccessLevel::User)),
            DefaultPolicy::Deny => Ok(Decision::Denied),
            DefaultPolicy::Ask => {
                if self.already_asked(key)? {
                    Ok(Decision::Denied)
                } else {
                    Ok(Decision::AskPending)
                }
            }
        }
    }

    /// Record that the owner has been prompted about `key` so that a
    /// repeat `Ask`-policy encounter no longer sets `ShouldAsk`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] on storage failure.
    pub fn mark_asked(&self, key: &SessionKey) -> Result<(), AccessError> {
        let channel = format!("{:?}", key.channel);
        let now = Utc::now().to_rfc3339();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO access_asked (channel, jid, asked_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(channel, jid) DO UPDATE SET asked_at = excluded.asked_at",
                rusqlite::params![channel, key.jid, now],
            )?;
            Ok(())
        })?;
        debug!(session = %key, "marked as asked");
        Ok(())
    }

    fn already_asked(&self, key: &SessionKey) -> Result<bool, AccessError> {
        let channel = format!("{:?}", key.channel);
        let row: Option<i64> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM access_asked WHERE channel = ?1 AND jid = ?2",
                rusqlite::params![channel, key.jid],
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
        Ok(row.is_some())
    }

    /// Grant `level` to `key`, persisting the decision so a future `Ask`
    /// outcome is remembered (ask-once semantics).
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::OwnerGrantNotAllowed`] if `level` is
    /// [`AccessLevel::Owner`] — owners are config-only, see
    /// [`AccessManager::seed_config`]. Returns [`AccessError::Storage`] on
    /// storage failure.
    pub fn grant(&self, key: &SessionKey, level: AccessLevel) -> Result<(), AccessError> {
        if level == AccessLevel::Owner {
            return Err(AccessError::OwnerGrantNotAllowed);
        }
        let channel = format!("{:?}", key.channel);
        let level_str = format!("{level:?}");
        let now = Utc::now().to_rfc3339();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO access_grants (channel, jid, level, granted_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel, jid) DO UPDATE SET level = excluded.level, granted_at = excluded.granted_at",
                rusqlite::params![channel, key.jid, level_str, now],
            )?;
            Ok(())
        })?;
        info!(session = %key, level = ?level, "access granted");
        Ok(())
    }

    /// Revoke any standing grant for `key`, reverting it to the default
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] on storage failure.
    pub fn revoke(&self, key: &SessionKey) -> Result<(), AccessError> {
        let channel = format!("{:?}", key.channel);
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM access_grants WHERE channel = ?1 AND jid = ?2",
                rusqlite::params![channel, key.jid],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Block `key` explicitly, overriding any allowed-group membership.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] on storage failure.
    pub fn block_user(&self, key: &SessionKey) -> Result<(), AccessError> {
        self.grant(key, AccessLevel::None)?;
        let channel = format!("{:?}", key.channel);
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO access_groups (channel, group_id, allowed) VALUES (?1, ?2, 0)",
                rusqlite::params![channel, format!("user:{}", key.jid)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Allow or block an entire group.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError`] on storage failure.
    pub fn set_group_policy(
        &self,
        channel: Channel,
        group_id: &str,
        allowed: bool,
    ) -> Result<(), AccessError> {
        let channel_str = format!("{channel:?}");
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO access_groups (channel, group_id, allowed) VALUES (?1, ?2, ?3)
                 ON CONFLICT(channel, group_id) DO UPDATE SET allowed = excluded.allowed",
                rusqlite::params![channel_str, group_id, i64::from(allowed)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn grant_level(&self, key: &SessionKey) -> Result<AccessLevel, AccessError> {
        let channel = format!("{:?}", key.channel);
        let level: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT level FROM access_grants WHERE channel = ?1 AND jid = ?2",
                rusqlite::params![channel, key.jid],
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

        Ok(match level.as_deref() {
            Some("Admin") => AccessLevel::Admin,
            Some("User") => AccessLevel::User,
            Some("Owner") => AccessLevel::Owner,
            _ => AccessLevel::None,
        })
    }

    fn user_blocked(&self, key: &SessionKey) -> Result<bool, AccessError> {
        let channel = format!("{:?}", key.channel);
        self.group_allowed_raw(&channel, &format!("user:{}", key.jid))
            .map(|allowed| allowed == Some(false))
    }

    fn group_blocked(&self, channel: Channel, group_id: &str) -> Result<bool, AccessError> {
        let channel_str = format!("{channel:?}");
        self.group_allowed_raw(&channel_str, group_id)
            .map(|allowed| allowed == Some(false))
    }

    fn group_allowed(&self, channel: Channel, group_id: &str) -> Result<bool, AccessError> {
        let channel_str = format!("{channel:?}");
        self.group_allowed_raw(&channel_str, group_id)
            .map(|allowed| allowed == Some(true))
    }

    fn group_allowed_raw(&self, channel: &str, group_id: &str) -> Result<Option<bool>, AccessError> {
        let row: Option<i64> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT allowed FROM access_groups WHERE channel = ?1 AND group_id = ?2",
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
        Ok(row.map(|v| v != 0))
    }
}

/// Parse a config-seeded `"channel:jid"` entry, e.g. `"telegram:12345"` or
/// `"whatsapp:+15551234567"`. Channel names are case-insensitive; the jid is
/// taken verbatim (config entries should already be in normalized form).
fn parse_identity(raw: &str) -> Option<SessionKey> {
    let (channel_str, jid) = raw.split_once(':')?;
    let channel = match channel_str.to_ascii_lowercase().as_str() {
        "telegram" => Channel::Telegram,
        "slack" => Channel::Slack,
        "whatsapp" => Channel::WhatsApp,
        "webhook" => Channel::Webhook,
        "cron" => Channel::Cron,
        _ => return None,
    };
    if jid.is_empty() {
        return None;
    }
    Some(SessionKey::new(channel, jid.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(policy: DefaultPolicy) -> AccessManager {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let owner = SessionKey::new(Channel::Telegram, "owner");
        AccessManager::new(store, policy, owner)
    }

    #[test]
    fn owner_is_always_allowed() {
        let mgr = manager(DefaultPolicy::Deny);
        let owner = SessionKey::new(Channel::Telegram, "owner");
        assert_eq!(
            mgr.check(&owner, None).expect("check should succeed"),
            Decision::Allowed(AccessLevel::Owner)
        );
    }

    #[test]
    fn unknown_user_follows_default_policy() {
        let mgr = manager(DefaultPolicy::Deny);
        let stranger = SessionKey::new(Channel::Telegram, "stranger");
        assert_eq!(mgr.check(&stranger, None).expect("check should succeed"), Decision::Denied);

        let mgr = manager(DefaultPolicy::Ask);
        assert_eq!(mgr.check(&stranger, None).expect("check should succeed"), Decision::AskPending);
    }

    #[test]
    fn explicit_grant_overrides_default_deny() {
        let mgr = manager(DefaultPolicy::Deny);
        let user = SessionKey::new(Channel::Telegram, "user1");
        mgr.grant(&user, AccessLevel::User).expect("grant should succeed");
        assert_eq!(
            mgr.check(&user, None).expect("check should succeed"),
            Decision::Allowed(AccessLevel::User)
        );
    }

    #[test]
    fn user_block_overrides_allowed_group() {
        let mgr = manager(DefaultPolicy::Deny);
        let user = SessionKey::new(Channel::Telegram, "user2");
        mgr.set_group_policy(Channel::Telegram, "grp1", true).expect("set_group_policy should succeed");
        mgr.block_user(&user).expect("block_user should succeed");
        assert_eq!(mgr.check(&user, Some("grp1")).expect("check should succeed"), Decision::Blocked);
    }

    #[test]
    fn group_allow_grants_user_level() {
        let mgr = manager(DefaultPolicy::Deny);
        let user = SessionKey::new(Channel::Telegram, "user3");
        mgr.set_group_policy(Channel::Telegram, "grp2", true).expect("set_group_policy should succeed");
        assert_eq!(
            mgr.check(&user, Some("grp2")).expect("check should succeed"),
            Decision::Allowed(AccessLevel::User)
        );
    }

    #[test]
    fn group_block_rejects_even_without_user_block() {
        let mgr = manager(DefaultPolicy::Allow);
        let user = SessionKey::new(Channel::Telegram, "user4");
        mgr.set_group_policy(Channel::Telegram, "grp3", false).expect("set_group_policy should succeed");
        assert_eq!(mgr.check(&user, Some("grp3")).expect("check should succeed"), Decision::Blocked);
    }

    #[test]
    fn ask_once_stops_asking_after_mark_asked() {
        let mgr = manager(DefaultPolicy::Ask);
        let stranger = SessionKey::new(Channel::Telegram, "stranger2");

        let first = mgr.check(&stranger, None).expect("check should succeed");
        assert_eq!(first, Decision::AskPending);
        assert!(first.should_ask());
        assert!(!first.is_allowed());

        mgr.mark_asked(&stranger).expect("mark_asked should succeed");

        let second = mgr.check(&stranger, None).expect("check should succeed");
        assert_eq!(second, Decision::Denied);
        assert!(!second.should_ask());
        assert!(!second.is_allowed());
    }

    #[test]
    fn grant_owner_level_is_rejected() {
        let mgr = manager(DefaultPolicy::Deny);
        let user = SessionKey::new(Channel::Telegram, "user6");
        let err = mgr
            .grant(&user, AccessLevel::Owner)
            .expect_err("granting Owner at runtime must be rejected");
        assert!(matches!(err, AccessError::OwnerGrantNotAllowed));
        assert_eq!(mgr.check(&user, None).expect("check should succeed"), Decision::Denied);
    }

    #[test]
    fn seed_config_installs_additional_owner() {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let primary_owner = SessionKey::new(Channel::Telegram, "owner");
        let mut mgr = AccessManager::new(Arc::clone(&store), DefaultPolicy::Deny, primary_owner);
        let config = AccessConfig {
            owners: vec!["telegram:second-owner".to_owned()],
            ..AccessConfig::default()
        };
        mgr.seed_config(&config).expect("seed_config should succeed");

        let second_owner = SessionKey::new(Channel::Telegram, "second-owner");
        assert_eq!(
            mgr.check(&second_owner, None).expect("check should succeed"),
            Decision::Allowed(AccessLevel::Owner)
        );
    }

    #[test]
    fn seed_config_installs_admins_and_blocked_users() {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let owner = SessionKey::new(Channel::Telegram, "owner");
        let mut mgr = AccessManager::new(Arc::clone(&store), DefaultPolicy::Allow, owner);
        let config = AccessConfig {
            admins: vec!["telegram:staff".to_owned()],
            blocked_users: vec!["telegram:troll".to_owned()],
            ..AccessConfig::default()
        };
        mgr.seed_config(&config).expect("seed_config should succeed");

        let admin = SessionKey::new(Channel::Telegram, "staff");
        assert_eq!(
            mgr.check(&admin, None).expect("check should succeed"),
            Decision::Allowed(AccessLevel::Admin)
        );

        let troll = SessionKey::new(Channel::Telegram, "troll");
        assert_eq!(mgr.check(&troll, None).expect("check should succeed"), Decision::Blocked);
    }

    #[test]
    fn revoke_reverts_to_default_policy() {
        let mgr = manager(DefaultPolicy::Deny);
        let user = SessionKey::new(Channel::Telegram, "user5");
        mgr.grant(&user, AccessLevel::User).expect("grant should succeed");
        mgr.revoke(&user).expect("revoke should succeed");
        assert_eq!(mgr.check(&user, None).expect("check should succeed"), Decision::Denied);
    }
}
