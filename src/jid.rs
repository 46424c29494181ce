//! C1: JID normalization — collapse channel-specific identity strings into
//! the canonical form used as a [`crate::types::SessionKey`].
//!
//! Each channel has its own native id shape (Telegram numeric ids, WhatsApp
//! `<number>@s.whatsapp.net`, Slack `<workspace>/<channel>/<user>`). This
//! module is the only place that understands those shapes.

use crate::types::{Channel, SessionKey};

/// Errors produced while normalizing a raw channel identity.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JidError {
    /// The raw identity string was empty after trimming.
    #[error("empty identity string")]
    Empty,
    /// A WhatsApp-shaped identity was missing its `@` domain part.
    #[error("malformed WhatsApp jid: {0}")]
    MalformedWhatsApp(String),
    /// A Slack-shaped identity did not have exactly three `/`-separated parts.
    #[error("malformed Slack jid: {0}")]
    MalformedSlack(String),
}

/// Normalize a raw, channel-native identity string into a [`SessionKey`].
///
/// # Errors
///
/// Returns [`JidError`] when the raw string is empty or does not match the
/// expected shape for its channel.
pub fn normalize(channel: Channel, raw: &str) -> Result<SessionKey, JidError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(JidError::Empty);
    }

    let jid = match channel {
        Channel::Telegram | Channel::Webhook | Channel::Cron => trimmed.to_owned(),
        Channel::WhatsApp => normalize_whatsapp(trimmed)?,
        Channel::Slack => normalize_slack(trimmed)?,
    };

    Ok(SessionKey::new(channel, jid))
}

/// Strip the `@s.whatsapp.net` / `@g.us` suffix, any `:device` suffix on the
/// local part, and any non-digit characters from a WhatsApp JID, leaving the
/// bare phone number or group id. For `@s.whatsapp.net` numbers, also
/// collapses the legacy Brazilian 11-digit mobile format (`55` + 9-digit
/// local number) down to the 10-digit form carriers use today, so the same
/// subscriber normalizes identically regardless of which form a channel
/// happened to hand us.
fn normalize_whatsapp(raw: &str) -> Result<String, JidError> {
    let (local, domain) = raw
        .split_once('@')
        .ok_or_else(|| JidError::MalformedWhatsApp(raw.to_owned()))?;
    let local = local.split_once(':').map_or(local, |(number, _device)| number);
    let mut digits: String = local.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(JidError::MalformedWhatsApp(raw.to_owned()));
    }
    if domain == "s.whatsapp.net" && digits.len() == 13 && digits.starts_with("55") {
        digits.remove(4);
    }
    Ok(digits)
}

/// Lowercase and join a `workspace/channel/user` Slack triple with `:`.
fn normalize_slack(raw: &str) -> Result<String, JidError> {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(JidError::MalformedSlack(raw.to_owned()));
    }
    Ok(parts
        .iter()
        .map(|p| p.to_lowercase())
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_jid_passes_through_trimmed() {
        let key = normalize(Channel::Telegram, "  415494855  ").expect("normalize should succeed");
        assert_eq!(key.jid, "415494855");
    }

    #[test]
    fn whatsapp_jid_strips_domain_and_non_digits() {
        let key = normalize(Channel::WhatsApp, "447700900000@s.whatsapp.net").expect("normalize should succeed");
        assert_eq!(key.jid, "447700900000");
    }

    #[test]
    fn whatsapp_jid_without_at_is_rejected() {
        assert_eq!(
            normalize(Channel::WhatsApp, "447700900000"),
            Err(JidError::MalformedWhatsApp("447700900000".to_owned()))
        );
    }

    #[test]
    fn slack_jid_lowercases_and_joins() {
        let key = normalize(Channel::Slack, "Acme/General/U123").expect("normalize should succeed");
        assert_eq!(key.jid, "acme:general:u123");
    }

    #[test]
    fn slack_jid_requires_three_parts() {
        assert!(matches!(
            normalize(Channel::Slack, "Acme/General"),
            Err(JidError::MalformedSlack(_))
        ));
    }

    #[test]
    fn empty_raw_is_rejected() {
        assert_eq!(normalize(Channel::Telegram, "   "), Err(JidError::Empty));
    }

    #[test]
    fn whatsapp_jid_strips_device_suffix() {
        let key = normalize(Channel::WhatsApp, "447700900000:5@s.whatsapp.net").expect("normalize should succeed");
        assert_eq!(key.jid, "447700900000");
    }

    #[test]
    fn whatsapp_jid_collapses_brazil_11_to_10_digits() {
        let with_suffix = normalize(Channel::WhatsApp, "5511999999999:5@s.whatsapp.net").expect("normalize should succeed");
        let without_suffix = normalize(Channel::WhatsApp, "5511999999999@s.whatsapp.net").expect("normalize should succeed");
        assert_eq!(with_suffix.jid, "551199999999");
        assert_eq!(with_suffix.jid, without_suffix.jid);
    }

    #[test]
    fn whatsapp_jid_leaves_non_brazil_13_digit_numbers_alone() {
        let key = normalize(Channel::WhatsApp, "1234567890123@s.whatsapp.net").expect("normalize should succeed");
        assert_eq!(key.jid, "1234567890123");
    }

    #[test]
    fn whatsapp_group_jid_is_not_collapsed() {
        let key = normalize(Channel::WhatsApp, "5511999999999@g.us").expect("normalize should succeed");
        assert_eq!(key.jid, "5511999999999");
    }
}
