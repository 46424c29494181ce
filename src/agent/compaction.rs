//! C7 context compaction: three escalating levels that keep an Agent Run's
//! message list under the model's context window.
//!
//! Each level preserves the original system prompt at index 0, the first
//! user message ("goal"), and the latest user message at the tail — only
//! the middle shrinks.

use crate::providers::{
    CompletionRequest, ContentPart, LlmProvider, Message, MessageContent, ProviderError, Role,
};

/// Approximate characters per token, matching the conservative heuristic
/// used for conversation trimming elsewhere in this codebase.
const CHARS_PER_TOKEN: u64 = 4;

/// Number of most-recent messages kept verbatim at the
/// [`CompactionLevel::Managed`] level.
pub const MANAGED_KEEP_RECENT: usize = 6;

/// Number of most-recent messages kept verbatim at the
/// [`CompactionLevel::Aggressive`] level.
pub const AGGRESSIVE_KEEP_RECENT: usize = 2;

/// Escalating compaction strategy applied when the running token estimate
/// crosses a soft threshold, or when a completion still overflows context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CompactionLevel {
    /// Default strategy: summary over the middle, last [`MANAGED_KEEP_RECENT`]
    /// messages kept verbatim.
    #[default]
    Managed,
    /// Used after repeated overflow within one turn: stricter summary
    /// prompt, only [`AGGRESSIVE_KEEP_RECENT`] messages kept verbatim.
    Aggressive,
    /// Used if a completion still returns a context-length error. No LLM
    /// call — purely structural and byte-deterministic.
    Emergency,
}

impl CompactionLevel {
    /// The next level to try after this one still overflows.
    #[must_use]
    pub fn escalate(self) -> Self {
        match self {
            Self::Managed => Self::Aggressive,
            Self::Aggressive | Self::Emergency => Self::Emergency,
        }
    }
}

/// Estimate tokens for a slice of messages using a 4-chars-per-token
/// heuristic. Intentionally conservative (overestimates) to avoid
/// exceeding limits.
pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

fn estimate_message_tokens(message: &Message) -> u64 {
    let text = message.content.text();
    let char_count = u64::try_from(text.len()).unwrap_or(u64::MAX);
    char_count.saturating_add(CHARS_PER_TOKEN.saturating_sub(1)) / CHARS_PER_TOKEN
}

/// Run one compaction pass at `level`, using `provider` for the auxiliary
/// summary call if `level` requires one.
///
/// # Errors
///
/// Returns [`ProviderError`] if the auxiliary summary call fails. Callers
/// should fall back to the next escalation level (eventually
/// [`CompactionLevel::Emergency`], which never errors) rather than failing
/// the run outright.
pub async fn compact(
    provider: &dyn LlmProvider,
    messages: &[Message],
    level: CompactionLevel,
) -> Result<Vec<Message>, ProviderError> {
    match level {
        CompactionLevel::Managed => {
            build_compacted(provider, messages, MANAGED_KEEP_RECENT, false).await
        }
        CompactionLevel::Aggressive => {
            build_compacted(provider, messages, AGGRESSIVE_KEEP_RECENT, true).await
        }
        CompactionLevel::Emergency => Ok(compact_emergency(messages)),
    }
}

async fn build_compacted(
    provider: &dyn LlmProvider,
    messages: &[Message],
    keep_recent: usize,
    strict: bool,
) -> Result<Vec<Message>, ProviderError> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }
    let system = messages[0].clone();
    let body = &messages[1..];
    if body.is_empty() {
        return Ok(vec![system]);
    }

    let goal = body[0].clone();
    let rest = &body[1..];
    let keep = keep_recent.min(rest.len());
    let split = rest.len().saturating_sub(keep);
    let middle = &rest[..split];
    let tail = &rest[split..];

    let summary = summarize(provider, middle, strict).await?;

    let mut out = Vec::with_capacity(3 + tail.len());
    out.push(system);
    out.push(goal);
    if let Some(text) = summary {
        out.push(Message {
            role: Role::System,
            content: MessageContent::Text(format!("[compacted summary] {text}")),
        });
    }
    out.extend_from_slice(tail);
    Ok(out)
}

/// Deterministically keep [original system, compression notice, the last
/// assistant message before the last user message if one exists, the last
/// user message]. No LLM call.
fn compact_emergency(messages: &[Message]) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    let system = messages[0].clone();
    let notice = Message {
        role: Role::System,
        content: MessageContent::Text(
            "[context compacted: emergency level, history truncated]".to_owned(),
        ),
    };

    let mut out = vec![system, notice];
    if let Some(user_idx) = messages.iter().rposition(|m| m.role == Role::User) {
        if let Some(assistant_idx) = messages[..user_idx]
            .iter()
            .rposition(|m| m.role == Role::Assistant)
        {
            out.push(messages[assistant_idx].clone());
        }
        out.push(messages[user_idx].clone());
    }
    out
}

/// Summarize `middle` via an auxiliary LLM call. Returns `None` without
/// calling out when `middle` is empty (tie-break: no summary message).
async fn summarize(
    provider: &dyn LlmProvider,
    middle: &[Message],
    strict: bool,
) -> Result<Option<String>, ProviderError> {
    if middle.is_empty() {
        return Ok(None);
    }

    let instruction = if strict {
        "Summarize the conversation below in 2-3 terse sentences. Preserve any open \
         commitments and unresolved tool results. Be as brief as possible."
    } else {
        "Summarize the conversation below, preserving open commitments, facts learned, \
         and unresolved tool results."
    };

    let transcript = middle
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content.text()))
        .collect::<Vec<_>>()
        .join("\n");

    let request = CompletionRequest {
        messages: vec![Message {
            role: Role::User,
            content: MessageContent::Text(transcript),
        }],
        system: Some(instruction.to_owned()),
        tools: Vec::new(),
        max_tokens: Some(if strict { 200 } else { 400 }),
        stop_sequences: Vec::new(),
    };

    let response = provider.complete(request).await?;
    let text: String = response
        .content
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    Ok(Some(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: MessageContent::Text(text.to_owned()),
        }
    }

    struct StubProvider;

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<crate::providers::CompletionResponse, ProviderError> {
            Ok(crate::providers::CompletionResponse {
                content: vec![ContentPart::Text {
                    text: "summary text".to_owned(),
                }],
                stop_reason: crate::providers::StopReason::EndTurn,
                usage: crate::providers::UsageStats {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                model: "stub".to_owned(),
            })
        }

        fn supports_tool_calling(&self) -> bool {
            false
        }

        fn supports_streaming(&self) -> bool {
            false
        }

        fn model_id(&self) -> &str {
            "stub"
        }
    }

    #[tokio::test]
    async fn managed_preserves_system_goal_and_tail() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "goal"),
            msg(Role::Assistant, "a1"),
            msg(Role::User, "u1"),
            msg(Role::Assistant, "a2"),
            msg(Role::User, "u2"),
            msg(Role::Assistant, "a3"),
            msg(Role::User, "latest"),
        ];
        let result = compact(&StubProvider, &messages, CompactionLevel::Managed)
            .await
            .expect("call should succeed");
        assert_eq!(result[0], messages[0]);
        assert_eq!(result[1], messages[1]);
        assert_eq!(result.last().expect("last should succeed"), messages.last().expect("last should succeed"));
        assert!(result.len() < messages.len());
    }

    #[tokio::test]
    async fn managed_emits_no_summary_when_middle_empty() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "goal"),
            msg(Role::Assistant, "a1"),
        ];
        let result = compact(&StubProvider, &messages, CompactionLevel::Managed)
            .await
            .expect("call should succeed");
        assert_eq!(result.len(), 3);
        assert_eq!(result, messages);
    }

    #[tokio::test]
    async fn aggressive_keeps_only_two_tail_messages() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "goal"),
            msg(Role::Assistant, "a1"),
            msg(Role::User, "u1"),
            msg(Role::Assistant, "a2"),
            msg(Role::User, "latest"),
        ];
        let result = compact(&StubProvider, &messages, CompactionLevel::Aggressive)
            .await
            .expect("call should succeed");
        let tail = &result[result.len() - 2..];
        assert_eq!(tail[0], messages[messages.len() - 2]);
        assert_eq!(tail[1], messages[messages.len() - 1]);
    }

    #[test]
    fn emergency_is_deterministic_and_makes_no_llm_call() {
        let messages = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "goal"),
            msg(Role::Assistant, "a1"),
            msg(Role::User, "u1"),
            msg(Role::Assistant, "last-assistant"),
            msg(Role::User, "last-user"),
        ];
        let first = compact_emergency(&messages);
        let second = compact_emergency(&messages);
        assert_eq!(first, second);
        assert_eq!(first[0], messages[0]);
        assert_eq!(first[2].content.text(), "last-assistant");
        assert_eq!(first[3].content.text(), "last-user");
    }

    #[test]
    fn emergency_with_no_prior_assistant_keeps_just_the_user_message() {
        let messages = vec![msg(Role::System, "sys"), msg(Role::User, "only-user")];
        let result = compact_emergency(&messages);
        assert_eq!(result.len(), 3);
        assert_eq!(result[2].content.text(), "only-user");
    }

    #[test]
    fn escalation_caps_at_emergency() {
        assert_eq!(CompactionLevel::Managed.escalate(), CompactionLevel::Aggressive);
        assert_eq!(CompactionLevel::Aggressive.escalate(), CompactionLevel::Emergency);
        assert_eq!(CompactionLevel::Emergency.escalate(), CompactionLevel::Emergency);
    }

    #[test]
    fn token_estimate_is_conservative_ceiling() {
        let messages = vec![msg(Role::User, "12345678")];
        assert_eq!(estimate_messages_tokens(&messages), 2);
    }
}
