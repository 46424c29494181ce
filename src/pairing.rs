//! C3: Pairing Manager — bootstraps trust for principals the Access Manager
//! doesn't yet recognize.
//!
//! Two paths into the system:
//!
//! - An unrecognized principal messages in → [`PairingManager::request`]
//!   records a [`PairingRequest`] → the owner is notified out-of-band (C11)
//!   and calls [`PairingManager::approve`]/[`deny`](PairingManager::deny).
//! - An owner/admin mints a single-use-or-multi-use [`PairingToken`] out of
//!   band (e.g. a join link for a new teammate) and the requester redeems it
//!   with [`PairingManager::redeem_token`], which either grants access
//!   immediately (`auto_approve`) or files a [`PairingRequest`] for an admin
//!   to approve, exactly as the unsolicited path does.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::info;
use uuid::Uuid;

use crate::access::AccessManager;
use crate::db::Store;
use crate::types::{AccessLevel, Channel, PairingRequest, PairingRole, PairingToken, SessionKey};

/// A message-prefix grammar recognized when scanning inbound text for an
/// embedded pairing token, in addition to a bare 48-hex-character token.
const TOKEN_PREFIX: &str = "token:";

/// Length in hex characters of a minted token (24 CSPRNG bytes).
const TOKEN_HEX_LEN: usize = 48;

/// Errors raised by pairing operations.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] crate::db::DbError),
    /// Access manager failure while granting/revoking.
    #[error("access error: {0}")]
    Access(#[from] crate::access::AccessError),
    /// No pairing request found for the given id.
    #[error("pairing request not found: {0}")]
    RequestNotFound(Uuid),
    /// The token does not exist, was revoked, expired, or exhausted its uses.
    #[error("pairing token invalid, expired, or exhausted")]
    TokenInvalid,
    /// The redeemer already holds at least the access level the token grants.
    #[error("principal already has access")]
    AlreadyHasAccess,
}

/// Outcome of redeeming a pairing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    /// Access was granted immediately.
    Granted(AccessLevel),
    /// A pairing request was filed; an admin must approve it.
    PendingApproval(Uuid),
}

/// Manages pending pairing requests and pairing tokens.
pub struct PairingManager {
    store: Arc<Store>,
    access: Arc<AccessManager>,
    token_ttl: Duration,
}

impl PairingManager {
    /// Build a pairing manager with the given token lifetime.
    pub fn new(store: Arc<Store>, access: Arc<AccessManager>, token_ttl_secs: u64) -> Self {
        Self {
            store,
            access,
            token_ttl: Duration::seconds(i64::try_from(token_ttl_secs).unwrap_or(i64::MAX)),
        }
    }

    /// Record a new pairing request from an unrecognized principal.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError`] on storage failure.
    pub fn request(
        &self,
        session_key: SessionKey,
        display_name: Option<String>,
        team_id: Option<String>,
    ) -> Result<PairingRequest, PairingError> {
        let request = PairingRequest {
            request_id: Uuid::new_v4(),
            session_key,
            display_name,
            team_id,
            requested_at: Utc::now(),
        };

        let channel = channel_str(request.session_key.channel);
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pairing_requests (request_id, channel, jid, display_name, team_id, requested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    request.request_id.to_string(),
                    channel,
                    request.session_key.jid,
                    request.display_name,
                    request.team_id,
                    request.requested_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        info!(request_id = %request.request_id, session = %request.session_key, "pairing request recorded");
        Ok(request)
    }

    /// Approve a pairing request, granting the requester `level`, and remove
    /// the request record.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::RequestNotFound`] if no such request exists,
    /// or a storage/access error.
    pub fn approve(
        &self,
        request_id: Uuid,
        level: AccessLevel,
    ) -> Result<SessionKey, PairingError> {
        let request = self.take_request(request_id)?;
        self.access.grant(&request.session_key, level)?;
        info!(request_id = %request_id, session = %request.session_key, "pairing request approved");
        Ok(request.session_key)
    }

    /// Deny a pairing request, removing it without granting access.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::RequestNotFound`] if no such request exists.
    pub fn deny(&self, request_id: Uuid) -> Result<SessionKey, PairingError> {
        let request = self.take_request(request_id)?;
        info!(request_id = %request_id, session = %request.session_key, "pairing request denied");
        Ok(request.session_key)
    }

    /// Mint a pairing token for out-of-band distribution.
    ///
    /// `max_uses` of `0` means unlimited redemptions. When `auto_approve` is
    /// `false`, redemption files a pending [`PairingRequest`] instead of
    /// granting access outright.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError`] on storage failure.
    #[allow(clippy::too_many_arguments)]
    pub fn mint_token(
        &self,
        channel: Channel,
        role: PairingRole,
        max_uses: u32,
        auto_approve: bool,
        workspace_id: Option<String>,
        note: Option<String>,
        created_by: Option<SessionKey>,
    ) -> Result<PairingToken, PairingError> {
        let now = Utc::now();
        let token = PairingToken {
            token: random_token(),
            channel,
            role,
            max_uses,
            use_count: 0,
            auto_approve,
            workspace_id,
            note,
            created_by: created_by.map(|k| k.to_string()),
            created_at: now,
            expires_at: now + self.token_ttl,
            revoked: false,
        };

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pairing_tokens
                    (token, channel, created_at, expires_at, role, max_uses, use_count,
                     auto_approve, workspace_id, note, created_by, revoked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
                rusqlite::params![
                    token.token,
                    channel_str(channel),
                    token.created_at.to_rfc3339(),
                    token.expires_at.to_rfc3339(),
                    role_str(role),
                    token.max_uses,
                    token.use_count,
                    i32::from(token.auto_approve),
                    token.workspace_id,
                    token.note,
                    token.created_by,
                ],
            )?;
            Ok(())
        })?;

        info!(channel = ?channel, max_uses = token.max_uses, "pairing token minted");
        Ok(token)
    }

    /// Revoke a token before it expires or exhausts its uses.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError`] on storage failure.
    pub fn revoke_token(&self, token: &str, revoked_by: Option<&SessionKey>) -> Result<(), PairingError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE pairing_tokens SET revoked = 1, revoked_at = ?2, revoked_by = ?3 WHERE token = ?1",
                rusqlite::params![
                    token,
                    Utc::now().to_rfc3339(),
                    revoked_by.map(SessionKey::to_string),
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Scan inbound message text for an embedded pairing token: a bare
    /// 48-character lowercase-hex string, or one prefixed with `token:`.
    #[must_use]
    pub fn extract_token_from_message(text: &str) -> Option<String> {
        for word in text.split_whitespace() {
            let candidate = word
                .strip_prefix(TOKEN_PREFIX)
                .unwrap_or(word)
                .trim_matches(|c: char| !c.is_ascii_hexdigit());
            if candidate.len() == TOKEN_HEX_LEN
                && candidate.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            {
                return Some(candidate.to_owned());
            }
        }
        None
    }

    /// Redeem a pairing token for `key`.
    ///
    /// If `key` already holds at least the access level the token would
    /// grant, this is a no-op returning [`PairingError::AlreadyHasAccess`]
    /// without consuming a use. Otherwise, if the token auto-approves,
    /// access is granted immediately; else a pending [`PairingRequest`] is
    /// filed for admin approval. Either way the token's use count is
    /// incremented, and a token is deleted once `use_count` reaches
    /// `max_uses` — unless `max_uses` is `0`, which means unlimited
    /// redemptions and is never exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::TokenInvalid`] if the token does not exist,
    /// was revoked, has expired, or has no uses remaining.
    pub fn redeem_token(
        &self,
        token: &str,
        key: &SessionKey,
        display_name: Option<String>,
    ) -> Result<RedemptionOutcome, PairingError> {
        let row = self.load_token(token)?.ok_or(PairingError::TokenInvalid)?;
        // `max_uses == 0` means unlimited; such a token never exhausts.
        let exhausted = row.max_uses != 0 && row.use_count >= row.max_uses;
        if row.revoked || row.expires_at < Utc::now() || exhausted {
            if exhausted || row.expires_at < Utc::now() {
                self.delete_token(token)?;
            }
            return Err(PairingError::TokenInvalid);
        }

        let current = self.access.check(key, None)?;
        if current.is_allowed() {
            return Err(PairingError::AlreadyHasAccess);
        }

        let new_use_count = row.use_count.saturating_add(1);
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE pairing_tokens SET use_count = ?2 WHERE token = ?1",
                rusqlite::params![token, new_use_count],
            )?;
            Ok(())
        })?;
        if row.max_uses != 0 && new_use_count >= row.max_uses {
            self.delete_token(token)?;
        }

        let outcome = if row.auto_approve {
            self.access.grant(key, row.role.access_level())?;
            if let Some(workspace_id) = row.workspace_id {
                self.assign_workspace(key, &workspace_id)?;
            }
            info!(session = %key, "pairing token redeemed with auto-approve");
            RedemptionOutcome::Granted(row.role.access_level())
        } else {
            let request = self.request(key.clone(), display_name, row.workspace_id)?;
            RedemptionOutcome::PendingApproval(request.request_id)
        };

        Ok(outcome)
    }

    /// Best-effort workspace assignment after a token redemption grants
    /// access. A failure here does not roll back the access grant itself —
    /// the principal is paired either way and can be assigned to a
    /// workspace later by an admin.
    fn assign_workspace(&self, key: &SessionKey, workspace_id: &str) -> Result<(), PairingError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO team_members (team_id, channel, jid, joined_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT DO NOTHING",
                rusqlite::params![
                    workspace_id,
                    channel_str(key.channel),
                    key.jid,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn load_token(&self, token: &str) -> Result<Option<TokenRow>, PairingError> {
        let row = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT role, max_uses, use_count, auto_approve, workspace_id,
                        expires_at, revoked
                 FROM pairing_tokens WHERE token = ?1",
                rusqlite::params![token],
                |row| {
                    let role: String = row.get(0)?;
                    let expires_at: String = row.get(5)?;
                    Ok(RawTokenRow {
                        role: parse_role(&role),
                        max_uses: row.get(1)?,
                        use_count: row.get(2)?,
                        auto_approve: row.get::<_, i64>(3)? != 0,
                        workspace_id: row.get(4)?,
                        expires_at: expires_at
                            .parse()
                            .unwrap_or_else(|_| Utc::now()),
                        revoked: row.get::<_, i64>(6)? != 0,
                    })
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

        Ok(row)
    }

    fn delete_token(&self, token: &str) -> Result<(), PairingError> {
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM pairing_tokens WHERE token = ?1", rusqlite::params![token])?;
            Ok(())
        })?;
        Ok(())
    }

    fn take_request(&self, request_id: Uuid) -> Result<PairingRequest, PairingError> {
        let row: Option<(String, String, Option<String>, Option<String>, String)> =
            self.store.with_conn(|conn| {
                conn.query_row(
                    "SELECT channel, jid, display_name, team_id, requested_at
                     FROM pairing_requests WHERE request_id = ?1",
                    rusqlite::params![request_id.to_string()],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
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

        let (channel, jid, display_name, team_id, requested_at) =
            row.ok_or(PairingError::RequestNotFound(request_id))?;

        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM pairing_requests WHERE request_id = ?1",
                rusqlite::params![request_id.to_string()],
            )?;
            Ok(())
        })?;

        Ok(PairingRequest {
            request_id,
            session_key: SessionKey::new(parse_channel(&channel), jid),
            display_name,
            team_id,
            requested_at: requested_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// In-memory view of a `pairing_tokens` row used for redemption checks.
struct RawTokenRow {
    role: PairingRole,
    max_uses: u32,
    use_count: u32,
    auto_approve: bool,
    workspace_id: Option<String>,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

type TokenRow = RawTokenRow;



fn channel_str(channel: Channel) -> &'static str {
    match channel {
        Channel::Telegram => "telegram",
        Channel::Slack => "slack",
        Channel::WhatsApp => "whatsapp",
        Channel::Webhook => "webhook",
        Channel::Cron => "cron",
    }
}

fn parse_channel(raw: &str) -> Channel {
    match raw {
        "slack" | "Slack" => Channel::Slack,
        "whatsapp" | "WhatsApp" => Channel::WhatsApp,
        "webhook" | "Webhook" => Channel::Webhook,
        "cron" | "Cron" => Channel::Cron,
        _ => Channel::Telegram,
    }
}

fn role_str(role: PairingRole) -> &'static str {
    match role {
        PairingRole::User => "user",
        PairingRole::Admin => "admin",
    }
}

fn parse_role(raw: &str) -> PairingRole {
    match raw {
        "admin" => PairingRole::Admin,
        _ => PairingRole::User,
    }
}

/// Generate a 48-lowercase-hex-character token from 24 bytes of CSPRNG
/// output.
fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
