//! Ollama `/api/chat` provider implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    check_http_response, CompletionRequest, CompletionResponse, ContentPart, LlmProvider,
    MessageContent, ProviderError, Role, StopReason, UsageStats,
};

/// Default local Ollama endpoint.
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434/api/chat";

/// Ollama chat API provider. No native tool-calling result schema across all
/// models, so tool calls are parsed defensively from `message.tool_calls`.
pub struct OllamaProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaProvider {
    /// Build a provider for `model` against the default local endpoint.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            model: model.into(),
        }
    }

    /// Override the chat endpoint — used for a remote Ollama host or tests.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

fn ollama_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(json!({
                "role": ollama_role(message.role),
                "content": message.content.text(),
            }));
        }

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect();

        let mut options = json!({});
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        if !request.stop_sequences.is_empty() {
            options["stop"] = json!(request.stop_sequences);
        }

        let body = json!({
            "model": self.model,
            "messages": messages,
            "tools": tools,
            "stream": false,
            "options": options,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let parsed: OllamaResponse =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let mut content = Vec::new();
        if !parsed.message.content.is_empty() {
            content.push(ContentPart::Text {
                text: parsed.message.content,
            });
        }
        let has_tool_calls = !parsed.message.tool_calls.is_empty();
        for call in parsed.message.tool_calls {
            content.push(ContentPart::ToolUse {
                id: Uuid::new_v4().to_string(),
                name: call.function.name,
                input: call.function.arguments,
            });
        }

        let stop_reason = if has_tool_calls {
            StopReason::ToolUse
        } else if parsed.done {
            StopReason::EndTurn
        } else {
            StopReason::Other("incomplete".to_owned())
        };

        Ok(CompletionResponse {
            content,
            stop_reason,
            usage: UsageStats {
                input_tokens: parsed.prompt_eval_count,
                output_tokens: parsed.eval_count,
            },
            model: if parsed.model.is_empty() {
                self.model.clone()
            } else {
                parsed.model
            },
        })
    }

    fn supports_tool_calling(&self) -> bool {
        true
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_mapping_keeps_tool_distinct_from_user() {
        assert_eq!(ollama_role(Role::Tool), "tool");
        assert_eq!(ollama_role(Role::System), "system");
    }
}
