//! Seeded scenario: a 202-message conversation (1 system, 100 user/
//! assistant pairs, 1 final user message) compacted at the emergency
//! level yields exactly 4 messages, the last being the final question.

use async_trait::async_trait;
use devclaw::agent::compaction::{compact, CompactionLevel};
use devclaw::providers::{
    CompletionRequest, CompletionResponse, LlmProvider, Message, MessageContent, ProviderError,
    Role,
};

struct UnreachableProvider;

#[async_trait]
impl LlmProvider for UnreachableProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        panic!("emergency compaction must never call the LLM");
    }

    fn supports_tool_calling(&self) -> bool {
        false
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn model_id(&self) -> &str {
        "unreachable"
    }
}

fn msg(role: Role, text: impl Into<String>) -> Message {
    Message {
        role,
        content: MessageContent::Text(text.into()),
    }
}

#[tokio::test]
async fn emergency_compaction_of_a_202_message_conversation_keeps_four_messages() {
    let mut messages = vec![msg(Role::System, "system prompt")];
    for i in 0..100 {
        messages.push(msg(Role::User, format!("user turn {i}")));
        messages.push(msg(Role::Assistant, format!("assistant turn {i}")));
    }
    messages.push(msg(Role::User, "Final question"));
    assert_eq!(messages.len(), 202);

    let result = compact(&UnreachableProvider, &messages, CompactionLevel::Emergency)
        .await
        .expect("emergency compaction never fails");

    assert_eq!(result.len(), 4);
    assert_eq!(result[0].content.text(), "system prompt");
    assert_eq!(result.last().expect("non-empty").content.text(), "Final question");
}
