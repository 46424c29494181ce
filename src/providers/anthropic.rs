//! Anthropic `/v1/messages` provider implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;

use super::{
    check_http_response, CompletionRequest, CompletionResponse, ContentPart, DeltaStream,
    LlmProvider, Message, MessageContent, ProviderError, Role, StopReason, StreamDelta, UsageStats,
};
use crate::credentials::AnthropicAuth;

/// Default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value this client targets.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    auth: AnthropicAuth,
    model: String,
}

impl AnthropicProvider {
    /// Build a provider for `model`, authenticating with `auth`.
    pub fn new(model: impl Into<String>, auth: AnthropicAuth) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            auth,
            model: model.into(),
        }
    }

    /// Override the base URL — used in tests against a mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            AnthropicAuth::ApiKey(key) => builder.header("x-api-key", key),
            AnthropicAuth::OAuth { access_token, .. } => {
                builder.header("Authorization", format!("Bearer {access_token}"))
            }
        }
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> AnthropicRequest {
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: role_string(m.role).to_owned(),
                content: to_anthropic_content(&m.content),
            })
            .collect();

        let system = request.system.clone().or_else(|| {
            request
                .messages
                .iter()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.text())
        });

        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(4096),
            messages,
            system,
            tools: request
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect(),
            stop_sequences: request.stop_sequences.clone(),
            stream,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    stream: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// A single parsed Server-Sent Event from the streaming Messages API.
/// Fields not read here (e.g. `index`) are left for serde to ignore.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessageStart,
    },
    ContentBlockStart {
        content_block: AnthropicStreamBlockStart,
    },
    ContentBlockDelta {
        delta: AnthropicStreamBlockDelta,
    },
    ContentBlockStop {},
    MessageDelta {
        delta: AnthropicMessageDelta,
        usage: AnthropicPartialUsage,
    },
    MessageStop {},
    Ping {},
    Error {
        error: AnthropicStreamError,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessageStart {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamBlockStart {
    Text { text: String },
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamBlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicPartialUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamError {
    message: String,
}

/// Parse one `\n\n`-delimited SSE event block into zero or more deltas,
/// tracking `input_tokens` across events since only `message_start` carries
/// it (later `message_delta` events carry only the running `output_tokens`).
fn parse_sse_event(raw: &str, input_tokens: &mut u32) -> Vec<Result<StreamDelta, ProviderError>> {
    let data: String = raw
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return Vec::new();
    }

    let event: AnthropicStreamEvent = match serde_json::from_str(&data) {
        Ok(event) => event,
        Err(e) => return vec![Err(ProviderError::Parse(e.to_string()))],
    };

    match event {
        AnthropicStreamEvent::MessageStart { message } => {
            *input_tokens = message.usage.input_tokens;
            Vec::new()
        }
        AnthropicStreamEvent::ContentBlockStart { content_block } => match content_block {
            AnthropicStreamBlockStart::Text { text } if text.is_empty() => Vec::new(),
            AnthropicStreamBlockStart::Text { text } => vec![Ok(StreamDelta::TextDelta(text))],
            AnthropicStreamBlockStart::ToolUse { id, name } => {
                vec![Ok(StreamDelta::ToolUseStart { id, name })]
            }
        },
        AnthropicStreamEvent::ContentBlockDelta { delta } => match delta {
            AnthropicStreamBlockDelta::TextDelta { text } => vec![Ok(StreamDelta::TextDelta(text))],
            AnthropicStreamBlockDelta::InputJsonDelta { partial_json } => {
                vec![Ok(StreamDelta::ToolUseInputDelta(partial_json))]
            }
        },
        AnthropicStreamEvent::MessageDelta { delta, usage } => vec![Ok(StreamDelta::Done {
            stop_reason: parse_stop_reason(delta.stop_reason.as_deref()),
            usage: UsageStats {
                input_tokens: *input_tokens,
                output_tokens: usage.output_tokens,
            },
        })],
        AnthropicStreamEvent::Error { error } => vec![Err(ProviderError::Parse(error.message))],
        AnthropicStreamEvent::ContentBlockStop {}
        | AnthropicStreamEvent::MessageStop {}
        | AnthropicStreamEvent::Ping {} => Vec::new(),
    }
}

fn parse_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("end_turn") => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        Some(other) => StopReason::Other(other.to_owned()),
        None => StopReason::EndTurn,
    }
}

fn role_string(role: Role) -> &'static str {
    match role {
        Role::System | Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
    }
}

fn to_anthropic_content(content: &MessageContent) -> Vec<serde_json::Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::ToolUse { id, name, input } => {
                    json!({"type": "tool_use", "id": id, "name": name, "input": input})
                }
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                }),
            })
            .collect(),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = self.build_body(&request, false);

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let response = self.apply_auth(builder).send().await?;

        let body = check_http_response(response).await?;
        let parsed: AnthropicResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = parsed
            .content
            .into_iter()
            .map(|block| match block {
                AnthropicContentBlock::Text { text } => ContentPart::Text { text },
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    ContentPart::ToolUse { id, name, input }
                }
            })
            .collect();

        let stop_reason = parse_stop_reason(parsed.stop_reason.as_deref());

        Ok(CompletionResponse {
            content,
            stop_reason,
            usage: UsageStats {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
            model: parsed.model,
        })
    }

    async fn chat_stream(&self, request: CompletionRequest) -> Result<DeltaStream, ProviderError> {
        let body = self.build_body(&request, true);
        let builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let response = self.apply_auth(builder).send().await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await?;
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }

        let mut byte_stream = response.bytes_stream();
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut buf = String::new();
            let mut input_tokens = 0u32;
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Request(e))).await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find("\n\n") {
                    let raw_event = buf[..pos].to_owned();
                    buf.drain(..=pos + 1);
                    for delta in parse_sse_event(&raw_event, &mut input_tokens) {
                        if tx.send(delta).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    fn supports_tool_calling(&self) -> bool {
        true
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_mapping_collapses_tool_and_system_into_user() {
        assert_eq!(role_string(Role::Tool), "user");
        assert_eq!(role_string(Role::System), "user");
        assert_eq!(role_string(Role::User), "user");
        assert_eq!(role_string(Role::Assistant), "assistant");
    }

    #[test]
    fn text_content_becomes_single_text_block() {
        let blocks = to_anthropic_content(&MessageContent::Text("hi".to_owned()));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "text");
    }

    #[test]
    fn tool_use_part_serializes_with_input() {
        let blocks = to_anthropic_content(&MessageContent::Parts(vec![ContentPart::ToolUse {
            id: "call1".to_owned(),
            name: "read_file".to_owned(),
            input: json!({"path": "a.txt"}),
        }]));
        assert_eq!(blocks[0]["type"], "tool_use");
        assert_eq!(blocks[0]["name"], "read_file");
    }

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("claude-test", AnthropicAuth::ApiKey("test-key".to_owned()))
    }

    fn completion_request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text("hi".to_owned()),
            }],
            system: None,
            tools: Vec::new(),
            max_tokens: None,
            stop_sequences: Vec::new(),
        }
    }

    #[test]
    fn build_body_sets_stream_flag() {
        let p = provider();
        assert!(!p.build_body(&completion_request(), false).stream);
        assert!(p.build_body(&completion_request(), true).stream);
    }

    #[test]
    fn sse_text_delta_event_parses() {
        let mut input_tokens = 0;
        let raw = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}";
        let deltas = parse_sse_event(raw, &mut input_tokens);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].as_ref().expect("delta should parse"), &StreamDelta::TextDelta("Hi".to_owned()));
    }

    #[test]
    fn sse_tool_use_start_then_input_delta_parse() {
        let mut input_tokens = 0;
        let start = "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"call1\",\"name\":\"read_file\",\"input\":{}}}";
        let deltas = parse_sse_event(start, &mut input_tokens);
        assert_eq!(
            deltas[0].as_ref().expect("delta should parse"),
            &StreamDelta::ToolUseStart { id: "call1".to_owned(), name: "read_file".to_owned() }
        );

        let partial = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"path\\\":\"}}";
        let deltas = parse_sse_event(partial, &mut input_tokens);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(deltas[0], Ok(StreamDelta::ToolUseInputDelta(_))));
    }

    #[test]
    fn sse_message_start_then_message_delta_carries_usage() {
        let mut input_tokens = 0;
        let start = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":42,\"output_tokens\":0}}}";
        assert!(parse_sse_event(start, &mut input_tokens).is_empty());
        assert_eq!(input_tokens, 42);

        let end = "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}";
        let deltas = parse_sse_event(end, &mut input_tokens);
        assert_eq!(
            deltas[0].as_ref().expect("delta should parse"),
            &StreamDelta::Done {
                stop_reason: StopReason::EndTurn,
                usage: UsageStats { input_tokens: 42, output_tokens: 7 },
            }
        );
    }

    #[test]
    fn sse_ping_and_block_stop_produce_no_deltas() {
        let mut input_tokens = 0;
        assert!(parse_sse_event("event: ping\ndata: {\"type\":\"ping\"}", &mut input_tokens).is_empty());
        assert!(parse_sse_event(
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}",
            &mut input_tokens
        )
        .is_empty());
    }
}
