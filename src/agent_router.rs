//! C14: Agent Router — selects which agent profile handles an inbound
//! message for a given `(channel, user, group)` tuple.
//!
//! Routing rules are persisted so the owner can steer specific users or
//! groups to a non-default profile (e.g. a specialist persistent agent)
//! without a config reload. The most specific match wins: an exact
//! `(channel, jid, group)` row beats a `(channel, jid, *)` row, which beats
//! a `(channel, *, group)` row, which beats the configured default. The
//! empty string stands in for "no group"/"any jid" since SQLite's PRIMARY
//! KEY uniqueness does not dedupe `NULL` columns.

use std::sync::Arc;

use crate::db::{DbError, Store};

/// Sentinel used in place of "no group" / "any jid" in the routes table.
const WILDCARD: &str = "";

/// Errors raised by agent-routing lookups.
#[derive(Debug, thiserror::Error)]
pub enum AgentRouterError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Resolves `(channel, jid, group_id)` to an agent profile id.
pub struct AgentRouter {
    store: Arc<Store>,
    default_profile: String,
}

impl AgentRouter {
    /// Build a router; `default_profile` is returned when no routing rule
    /// matches.
    pub fn new(store: Arc<Store>, default_profile: impl Into<String>) -> Self {
        Self {
            store,
            default_profile: default_profile.into(),
        }
    }

    /// Resolve the agent profile id that should handle a message from `jid`
    /// on `channel`, optionally within `group_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentRouterError`] on storage failure.
    pub fn resolve(
        &self,
        channel: &str,
        jid: &str,
        group_id: Option<&str>,
    ) -> Result<String, AgentRouterError> {
        let group_id = group_id.unwrap_or(WILDCARD);

        if group_id != WILDCARD {
            if let Some(profile) = self.lookup(channel, jid, group_id)? {
                return Ok(profile);
            }
        }
        if let Some(profile) = self.lookup(channel, jid, WILDCARD)? {
            return Ok(profile);
        }
        if group_id != WILDCARD {
            if let Some(profile) = self.lookup(channel, WILDCARD, group_id)? {
                return Ok(profile);
            }
        }
        Ok(self.default_profile.clone())
    }

    /// Register (or replace) a routing rule. Pass `group_id = None` for a
    /// user-wide route, `jid = None` for a group-wide route.
    ///
    /// # Errors
    ///
    /// Returns [`AgentRouterError`] on storage failure.
    pub fn set_route(
        &self,
        channel: &str,
        jid: Option<&str>,
        group_id: Option<&str>,
        profile_id: &str,
    ) -> Result<(), AgentRouterError> {
        let jid = jid.unwrap_or(WILDCARD);
        let group_id = group_id.unwrap_or(WILDCARD);
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_routes (channel, jid, group_id, profile_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (channel, jid, group_id) DO UPDATE SET profile_id = excluded.profile_id",
                rusqlite::params![channel, jid, group_id, profile_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn lookup(&self, channel: &str, jid: &str, group_id: &str) -> Result<Option<String>, AgentRouterError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT profile_id FROM agent_routes WHERE channel = ?1 AND jid = ?2 AND group_id = ?3",
                rusqlite::params![channel, jid, group_id],
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
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_with_no_routes() {
        let router = AgentRouter::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")), "generalist");
        assert_eq!(router.resolve("telegram", "user1", None).expect("resolve should succeed"), "generalist");
    }

    #[test]
    fn exact_user_route_wins_over_default() {
        let router = AgentRouter::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")), "generalist");
        router.set_route("telegram", Some("user1"), None, "specialist").expect("set_route should succeed");
        assert_eq!(router.resolve("telegram", "user1", None).expect("resolve should succeed"), "specialist");
        assert_eq!(router.resolve("telegram", "user2", None).expect("resolve should succeed"), "generalist");
    }

    #[test]
    fn re_setting_a_route_updates_it_in_place() {
        let router = AgentRouter::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")), "generalist");
        router.set_route("telegram", Some("user1"), None, "first").expect("set_route should succeed");
        router.set_route("telegram", Some("user1"), None, "second").expect("set_route should succeed");
        assert_eq!(router.resolve("telegram", "user1", None).expect("resolve should succeed"), "second");
    }

    #[test]
    fn group_specific_route_wins_over_user_wide_route() {
        let router = AgentRouter::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")), "generalist");
        router.set_route("slack", Some("u1"), None, "user-wide").expect("set_route should succeed");
        router
            .set_route("slack", Some("u1"), Some("team-chan"), "group-specific")
            .expect("set_route should succeed");
        assert_eq!(
            router.resolve("slack", "u1", Some("team-chan")).expect("resolve should succeed"),
            "group-specific"
        );
        assert_eq!(router.resolve("slack", "u1", Some("other-chan")).expect("resolve should succeed"), "user-wide");
    }

    #[test]
    fn group_wide_route_applies_to_any_user_in_the_group() {
        let router = AgentRouter::new(Arc::new(Store::open_in_memory().expect("open_in_memory should succeed")), "generalist");
        router
            .set_route("slack", None, Some("team-chan"), "group-bot")
            .expect("set_route should succeed");
        assert_eq!(router.resolve("slack", "anyone", Some("team-chan")).expect("resolve should succeed"), "group-bot");
    }
}
