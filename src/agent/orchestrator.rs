//! C7: Agent Run — the orchestration state machine driving an LLM through
//! tool-calling rounds under token/wallclock/tool-call budgets, with context
//! compaction, streaming-as-delta forwarding, and crash recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::budget::SessionBudget;
use crate::agent::compaction::{self, CompactionLevel};
use crate::channel::ChannelSink;
use crate::config::BudgetConfig;
use crate::db::Store;
use crate::failover::{classify_provider_error, ModelFailover};
use crate::metrics::{MetricsCollector, RunOutcome as MetricsOutcome};
use crate::providers::{
    CompletionRequest, CompletionResponse, ContentPart, LlmProvider, Message, MessageContent,
    ProviderError, Role, StopReason, StreamDelta, UsageStats,
};
use tokio_stream::StreamExt;
use crate::session::{SessionEntry, SessionStore};
use crate::tools::executor::ToolRouter;
use crate::types::{ActiveRun, AccessLevel, RunBudget, SessionKey};

/// Soft context-window threshold (in estimated tokens) above which the next
/// round compacts the message list before calling the model.
const SOFT_COMPACTION_THRESHOLD: u64 = 120_000;

/// Tokens requested for the final forced summary once a budget is exceeded.
const FINAL_SUMMARY_MAX_TOKENS: u32 = 512;

/// User-visible reply for [`AgentRunOutcome::ServiceUnavailable`].
const SERVICE_UNAVAILABLE_RETRY_HINT: &str =
    "All configured models are currently unavailable. Please try again in a few minutes.";

/// A persistent or ad-hoc agent's identity and capabilities for one run.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// System prompt / instructions for this agent.
    pub instructions: String,
    /// Tool names this profile may call. Empty means "all registered tools".
    pub allowed_tools: Vec<String>,
    /// Per-run budget overrides; `None` falls back to the global config.
    pub budget_override: Option<RunBudget>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            allowed_tools: Vec::new(),
            budget_override: None,
        }
    }
}

/// Cooperative cancellation handle, checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Build a fresh, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A request to execute one Agent Run turn.
pub struct RunRequest {
    /// Session this run belongs to.
    pub session_key: SessionKey,
    /// The inbound user message (or a synthesized heartbeat prompt).
    pub user_message: String,
    /// Profile governing instructions, tool allowlist, and budget overrides.
    pub profile: AgentProfile,
    /// Access level of the caller, checked by the tool executor.
    pub caller_level: AccessLevel,
}

/// Terminal state of an Agent Run.
#[derive(Debug, Clone)]
pub enum AgentRunOutcome {
    /// The run produced a final reply normally.
    Completed {
        /// The assistant's final reply text.
        reply: String,
    },
    /// A round/token/wallclock budget was hit; `reply` is the forced final
    /// summary (or a generic notice if the summary call itself failed).
    BudgetExceeded {
        /// Best-effort final reply.
        reply: String,
    },
    /// Cancellation was observed at a suspension point.
    Cancelled,
    /// The run failed with no usable reply (e.g. every model exhausted).
    Failed {
        /// Human-readable error description.
        error: String,
    },
    /// Every model was already cooling down and the cooled-primary
    /// last-resort attempt still failed (spec §7, error kind 3). Distinct
    /// from [`AgentRunOutcome::BudgetExceeded`]: this is a service-health
    /// failure, not a budget ceiling.
    ServiceUnavailable {
        /// User-facing reply suggesting the caller retry later.
        retry_hint: String,
    },
}

/// Errors that can prevent a run from starting at all.
#[derive(Debug, thiserror::Error)]
pub enum AgentRunError {
    /// Underlying session-store failure.
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),
    /// No provider is registered for the model Failover selected.
    #[error("no provider registered for model {0:?}")]
    NoProvider(String),
}

/// Drives one Agent Run: the turn loop, tool dispatch, compaction, and
/// budget enforcement described by the orchestrator contract.
pub struct AgentRun {
    sessions: Arc<SessionStore>,
    tool_router: Arc<ToolRouter>,
    failover: Arc<ModelFailover>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    metrics: Arc<MetricsCollector>,
    channel_sink: Arc<dyn ChannelSink>,
    budget_config: BudgetConfig,
    session_budget: Arc<SessionBudget>,
}

impl AgentRun {
    /// Build an orchestrator from its capability handles.
    ///
    /// `providers` must contain an entry for every model string Failover's
    /// primary/fallback chain can select (the composition root builds one
    /// concrete [`LlmProvider`] per configured model).
    pub fn new(
        sessions: Arc<SessionStore>,
        tool_router: Arc<ToolRouter>,
        failover: Arc<ModelFailover>,
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        metrics: Arc<MetricsCollector>,
        channel_sink: Arc<dyn ChannelSink>,
        budget_config: BudgetConfig,
        session_budget: Arc<SessionBudget>,
    ) -> Self {
        Self {
            sessions,
            tool_router,
            failover,
            providers,
            metrics,
            channel_sink,
            budget_config,
            session_budget,
        }
    }

    /// On process startup, recover any `ActiveRun` rows left by a prior
    /// process. This crate has no concrete channel transport to re-dispatch
    /// the original message through, so every interrupted run posts a
    /// "resumed after restart" notice to its session and is then deleted —
    /// the "transport declines" branch of the contract.
    ///
    /// # Errors
    ///
    /// Returns [`AgentRunError`] on session-store failure.
    pub async fn recover_interrupted_runs(&self) -> Result<usize, AgentRunError> {
        let interrupted = self.sessions.recover_interrupted_runs()?;
        for run in &interrupted {
            let notice = format!(
                "Run {} was interrupted by a restart and could not be resumed automatically.",
                run.run_id
            );
            if let Err(e) = self
                .channel_sink
                .send(run.session_key.channel, &run.session_key.jid, &notice)
                .await
            {
                warn!(run_id = %run.run_id, error = %e, "failed to deliver run-resumed notice");
            }
            self.sessions.end_run(run.run_id)?;
            info!(run_id = %run.run_id, session = %run.session_key, "interrupted run recovered and discarded");
        }
        Ok(interrupted.len())
    }

    /// Execute one Agent Run turn loop to completion.
    ///
    /// # Errors
    ///
    /// Returns [`AgentRunError`] if the run cannot even be opened (session
    /// store failure). Failures during the turn loop itself are captured in
    /// [`AgentRunOutcome::Failed`] rather than propagated, per the
    /// orchestrator's failure-isolation contract.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<AgentRunOutcome, AgentRunError> {
        let run_id = Uuid::new_v4();
        let budget = request.profile.budget_override.unwrap_or(RunBudget {
            max_rounds: self.budget_config.max_rounds,
            max_tokens: self.budget_config.max_tokens_per_session,
            max_wallclock_secs: self.budget_config.max_wallclock_secs,
        });
        let active_run = ActiveRun {
            run_id,
            session_key: request.session_key.clone(),
            rounds_used: 0,
            tokens_used: 0,
            started_at: Utc::now(),
            budget,
        };
        self.sessions.begin_run(&active_run)?;
        self.metrics.agent_run_start();

        let outcome = self
            .run_inner(run_id, &request, &budget, active_run.started_at, cancel)
            .await;

        self.sessions.end_run(run_id)?;
        self.tool_router.forget_run(&run_id.to_string());
        self.metrics.agent_run_complete(metrics_outcome(&outcome));

        if let Some(reply) = outcome_reply(&outcome) {
            self.persist_exchange(&request, &reply)?;
            if let Err(e) = self
                .channel_sink
                .send(
                    request.session_key.channel,
                    &request.session_key.jid,
                    &reply,
                )
                .await
            {
                warn!(run_id = %run_id, error = %e, "failed to deliver final reply");
            }
        }

        Ok(outcome)
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        request: &RunRequest,
        budget: &RunBudget,
        started_at: chrono::DateTime<Utc>,
        cancel: CancellationToken,
    ) -> AgentRunOutcome {
        let mut messages = self.build_initial_messages(request);
        let mut level = CompactionLevel::Managed;
        let mut rounds_used: u32 = 0;
        let mut tokens_used: u64 = 0;
        let run_id_str = run_id.to_string();

        loop {
            if cancel.is_cancelled() {
                return AgentRunOutcome::Cancelled;
            }

            let elapsed = Utc::now().signed_duration_since(started_at).num_seconds();
            let elapsed = u64::try_from(elapsed.max(0)).unwrap_or(u64::MAX);
            let exhausted = rounds_used >= budget.max_rounds
                || tokens_used >= budget.max_tokens
                || elapsed >= budget.max_wallclock_secs;
            if exhausted {
                let reply = self.final_summary(&messages).await;
                return AgentRunOutcome::BudgetExceeded { reply };
            }

            if compaction::estimate_messages_tokens(&messages) > SOFT_COMPACTION_THRESHOLD {
                messages = self.compact_with_escalation(&messages, &mut level).await;
            }

            let all_cooling = self.failover.all_models_cooling().unwrap_or(false);
            let model = match self.failover.select_model() {
                Ok(model) => model,
                Err(e) => return AgentRunOutcome::Failed { error: e.to_string() },
            };
            let Some(provider) = self.providers.get(&model).cloned() else {
                return AgentRunOutcome::Failed {
                    error: format!("no provider registered for model {model:?}"),
                };
            };

            let tools = self.tool_definitions(&request.profile);
            let estimated = compaction::estimate_messages_tokens(&messages);
            if let Err(e) = self.session_budget.check_budget(estimated) {
                return AgentRunOutcome::BudgetExceeded { reply: e.to_string() };
            }

            let completion_request = CompletionRequest {
                messages: messages.clone(),
                system: Some(request.profile.instructions.clone()),
                tools,
                max_tokens: None,
                stop_sequences: Vec::new(),
            };

            if cancel.is_cancelled() {
                return AgentRunOutcome::Cancelled;
            }

            let response = match self.request_completion(&provider, &model, completion_request).await {
                Ok(response) => response,
                Err(e) => {
                    let class = classify_provider_error(&e);
                    let _ = self.failover.report_failure(&model, class, &e.to_string());
                    if all_cooling {
                        warn!(
                            model = %model,
                            error = %e,
                            "all models cooling down and the last-resort attempt failed"
                        );
                        return AgentRunOutcome::ServiceUnavailable {
                            retry_hint: SERVICE_UNAVAILABLE_RETRY_HINT.to_owned(),
                        };
                    }
                    warn!(model = %model, error = %e, "LLM completion failed, retrying with next model");
                    continue;
                }
            };

            let _ = self.failover.report_success(&model);
            let _ = self.failover.record_usage(
                &request.session_key.to_string(),
                &model,
                response.usage.input_tokens,
                response.usage.output_tokens,
            );
            let round_tokens =
                u64::from(response.usage.input_tokens) + u64::from(response.usage.output_tokens);
            tokens_used = tokens_used.saturating_add(round_tokens);
            self.session_budget.record_usage(
                u64::from(response.usage.input_tokens),
                u64::from(response.usage.output_tokens),
            );
            self.metrics.record_tokens(round_tokens);

            messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::Parts(response.content.clone()),
            });

            let tool_calls: Vec<(String, String, Value)> = response
                .content
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            if tool_calls.is_empty() {
                let reply = response_text(&response.content);
                return AgentRunOutcome::Completed { reply };
            }

            rounds_used = rounds_used.saturating_add(1);
            if let Err(e) = self.session_budget.check_tool_calls(
                u32::try_from(tool_calls.len()).unwrap_or(u32::MAX),
            ) {
                messages.push(tool_results_message(
                    tool_calls
                        .iter()
                        .map(|(id, _, _)| (id.clone(), e.to_string(), true))
                        .collect(),
                ));
                continue;
            }

            if cancel.is_cancelled() {
                return AgentRunOutcome::Cancelled;
            }

            let results = self
                .dispatch_tool_calls(&run_id_str, tool_calls, request.caller_level)
                .await;
            messages.push(tool_results_message(results));
        }
    }

    /// The model-call suspension point: uses [`LlmProvider::chat_stream`]
    /// when the provider advertises `supports_streaming()`, reassembling the
    /// delta stream into the same [`CompletionResponse`] shape `complete`
    /// returns, so the rest of the turn loop doesn't need to know which path
    /// ran. Falls back to `complete` otherwise.
    async fn request_completion(
        &self,
        provider: &Arc<dyn LlmProvider>,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if !provider.supports_streaming() {
            return provider.complete(request).await;
        }

        let mut stream = provider.chat_stream(request).await?;
        let mut content: Vec<ContentPart> = Vec::new();
        let mut text = String::new();
        let mut tool_use: Option<(String, String, String)> = None;
        let mut stop_reason = StopReason::EndTurn;
        let mut usage = UsageStats { input_tokens: 0, output_tokens: 0 };

        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(fragment) => text.push_str(&fragment),
                StreamDelta::ToolUseStart { id, name } => {
                    flush_text_delta(&mut text, &mut content);
                    flush_tool_use_delta(&mut tool_use, &mut content);
                    tool_use = Some((id, name, String::new()));
                }
                StreamDelta::ToolUseInputDelta(fragment) => match tool_use.as_mut() {
                    Some((_, _, partial_json)) => partial_json.push_str(&fragment),
                    None => warn!("tool-use input delta with no open tool-use block, dropping"),
                },
                StreamDelta::Done { stop_reason: reason, usage: final_usage } => {
                    stop_reason = reason;
                    usage = final_usage;
                }
            }
        }
        flush_text_delta(&mut text, &mut content);
        flush_tool_use_delta(&mut tool_use, &mut content);

        Ok(CompletionResponse { content, stop_reason, usage, model: model.to_owned() })
    }

    fn build_initial_messages(&self, request: &RunRequest) -> Vec<Message> {
        let mut messages = vec![Message {
            role: Role::System,
            content: MessageContent::Text(request.profile.instructions.clone()),
        }];

        if let Ok(history) = self.sessions.recent(&request.session_key) {
            for entry in history {
                messages.push(Message {
                    role: Role::User,
                    content: MessageContent::Text(entry.user_message),
                });
                messages.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::Text(entry.assistant_response),
                });
            }
        }

        messages.push(Message {
            role: Role::User,
            content: MessageContent::Text(request.user_message.clone()),
        });
        messages
    }

    fn tool_definitions(&self, profile: &AgentProfile) -> Vec<crate::providers::ToolDefinition> {
        let all = self.tool_router.definitions();
        if profile.allowed_tools.is_empty() {
            return all;
        }
        let expanded: Vec<String> = profile
            .allowed_tools
            .iter()
            .flat_map(|name| crate::tools::team_tools::expand_tool_group(name))
            .collect();
        all.into_iter()
            .filter(|def| expanded.iter().any(|name| name == &def.name))
            .collect()
    }

    async fn compact_with_escalation(
        &self,
        messages: &[Message],
        level: &mut CompactionLevel,
    ) -> Vec<Message> {
        loop {
            let model = match self.failover.select_model() {
                Ok(model) => model,
                Err(_) => return compaction::compact(&NoopProvider, messages, CompactionLevel::Emergency)
                    .await
                    .unwrap_or_else(|_| messages.to_vec()),
            };
            let Some(provider) = self.providers.get(&model) else {
                *level = CompactionLevel::Emergency;
                return compaction::compact(&NoopProvider, messages, CompactionLevel::Emergency)
                    .await
                    .unwrap_or_else(|_| messages.to_vec());
            };

            match compaction::compact(provider.as_ref(), messages, *level).await {
                Ok(compacted) => return compacted,
                Err(e) => {
                    warn!(level = ?level, error = %e, "compaction summary call failed, escalating");
                    *level = level.escalate();
                    if *level == CompactionLevel::Emergency {
                        return compaction::compact(provider.as_ref(), messages, CompactionLevel::Emergency)
                            .await
                            .unwrap_or_else(|_| messages.to_vec());
                    }
                }
            }
        }
    }

    async fn final_summary(&self, messages: &[Message]) -> String {
        let Ok(model) = self.failover.select_model() else {
            return "Budget exceeded and no model is available for a final summary.".to_owned();
        };
        let Some(provider) = self.providers.get(&model) else {
            return "Budget exceeded; unable to produce a final summary.".to_owned();
        };

        let request = CompletionRequest {
            messages: messages.to_vec(),
            system: Some(
                "The turn budget has been exhausted. Provide a brief final summary of progress \
                 and any remaining open items. You have no tools available."
                    .to_owned(),
            ),
            tools: Vec::new(),
            max_tokens: Some(FINAL_SUMMARY_MAX_TOKENS),
            stop_sequences: Vec::new(),
        };

        match provider.complete(request).await {
            Ok(response) => {
                let text = response_text(&response.content);
                if text.is_empty() {
                    "Budget exceeded; no further progress was reported.".to_owned()
                } else {
                    text
                }
            }
            Err(e) => {
                warn!(error = %e, "final summary call failed");
                "Budget exceeded; unable to produce a final summary.".to_owned()
            }
        }
    }

    /// Dispatch independent tool calls concurrently while preserving the
    /// model's call-id order in the returned results, regardless of
    /// completion order.
    async fn dispatch_tool_calls(
        &self,
        run_id: &str,
        calls: Vec<(String, String, Value)>,
        caller_level: AccessLevel,
    ) -> Vec<(String, String, bool)> {
        let mut handles = Vec::with_capacity(calls.len());
        for (call_id, tool_name, input) in calls {
            let router = Arc::clone(&self.tool_router);
            let metrics = Arc::clone(&self.metrics);
            let run_id = run_id.to_owned();
            handles.push((
                call_id,
                tokio::spawn(async move {
                    let result = router.dispatch(&run_id, &tool_name, input, caller_level).await;
                    match result {
                        Ok(output) => {
                            metrics.record_tool_call(!output.is_error);
                            (output.content, output.is_error)
                        }
                        Err(e) => {
                            metrics.record_tool_call(false);
                            (e.to_string(), true)
                        }
                    }
                }),
            ));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (call_id, handle) in handles {
            match handle.await {
                Ok((content, is_error)) => results.push((call_id, content, is_error)),
                Err(e) => results.push((call_id, format!("tool task panicked: {e}"), true)),
            }
        }
        results
    }

    fn persist_exchange(&self, request: &RunRequest, reply: &str) -> Result<(), AgentRunError> {
        let entry = SessionEntry {
            user_message: request.user_message.clone(),
            assistant_response: reply.to_owned(),
            created_at: Utc::now(),
            meta: Value::Null,
        };
        self.sessions.append(&request.session_key, entry)?;
        Ok(())
    }
}

fn tool_results_message(results: Vec<(String, String, bool)>) -> Message {
    Message {
        role: Role::User,
        content: MessageContent::Parts(
            results
                .into_iter()
                .map(|(tool_use_id, content, is_error)| ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                })
                .collect(),
        ),
    }
}

/// Push accumulated text deltas as a `ContentPart::Text` and clear the buffer.
/// No-op if nothing has accumulated (e.g. a tool-only turn).
fn flush_text_delta(text: &mut String, content: &mut Vec<ContentPart>) {
    if !text.is_empty() {
        content.push(ContentPart::Text { text: std::mem::take(text) });
    }
}

/// Parse an in-progress tool-use block's accumulated JSON fragments and push
/// it as a `ContentPart::ToolUse`, clearing the slot. Malformed JSON (a
/// provider bug or a truncated stream) becomes an empty-object input rather
/// than silently dropping the call — the tool handler will reject it.
fn flush_tool_use_delta(tool_use: &mut Option<(String, String, String)>, content: &mut Vec<ContentPart>) {
    if let Some((id, name, partial_json)) = tool_use.take() {
        let input = serde_json::from_str(&partial_json).unwrap_or_else(|e| {
            warn!(tool = %name, error = %e, "tool-use input did not parse as JSON, using empty object");
            serde_json::json!({})
        });
        content.push(ContentPart::ToolUse { id, name, input });
    }
}

fn response_text(content: &[ContentPart]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn metrics_outcome(outcome: &AgentRunOutcome) -> MetricsOutcome {
    match outcome {
        AgentRunOutcome::Completed { .. } => MetricsOutcome::Success,
        AgentRunOutcome::BudgetExceeded { .. } => MetricsOutcome::Timeout,
        AgentRunOutcome::Cancelled
        | AgentRunOutcome::Failed { .. }
        | AgentRunOutcome::ServiceUnavailable { .. } => MetricsOutcome::Failed,
    }
}

fn outcome_reply(outcome: &AgentRunOutcome) -> Option<String> {
    match outcome {
        AgentRunOutcome::Completed { reply } | AgentRunOutcome::BudgetExceeded { reply } => {
            Some(reply.clone())
        }
        AgentRunOutcome::ServiceUnavailable { retry_hint } => Some(retry_hint.clone()),
        AgentRunOutcome::Cancelled | AgentRunOutcome::Failed { .. } => None,
    }
}

/// Placeholder provider used only to reach [`CompactionLevel::Emergency`]
/// (which never calls it) when no live provider can be resolved.
struct NoopProvider;

#[async_trait::async_trait]
impl LlmProvider for NoopProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<crate::providers::CompletionResponse, crate::providers::ProviderError> {
        Err(crate::providers::ProviderError::Unavailable(
            "no provider configured".to_owned(),
        ))
    }

    fn supports_tool_calling(&self) -> bool {
        false
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn model_id(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::ModelsConfig;
    use crate::failover::FailureClass;
    use crate::tools::{ToolGuard, ToolHandler, ToolOutput};
    use crate::types::Channel;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticReplyProvider {
        model: String,
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for StaticReplyProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<crate::providers::CompletionResponse, crate::providers::ProviderError> {
            Ok(crate::providers::CompletionResponse {
                content: vec![ContentPart::Text {
                    text: self.reply.clone(),
                }],
                stop_reason: StopReason::EndTurn,
                usage: crate::providers::UsageStats {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                model: self.model.clone(),
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

    /// Streams its reply one word at a time instead of returning it whole,
    /// to exercise the delta-reassembly path in [`AgentRun::request_completion`].
    struct StreamingReplyProvider {
        model: String,
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for StreamingReplyProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<crate::providers::CompletionResponse, crate::providers::ProviderError> {
            panic!("streaming provider's complete() should not be called");
        }

        async fn chat_stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<crate::providers::DeltaStream, crate::providers::ProviderError> {
            let mut deltas: Vec<Result<StreamDelta, crate::providers::ProviderError>> = self
                .reply
                .split_inclusive(' ')
                .map(|word| Ok(StreamDelta::TextDelta(word.to_owned())))
                .collect();
            deltas.push(Ok(StreamDelta::Done {
                stop_reason: StopReason::EndTurn,
                usage: UsageStats { input_tokens: 7, output_tokens: 3 },
            }));
            Ok(Box::pin(tokio_stream::iter(deltas)))
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

    /// Always fails its completion call with a retryable-looking error, to
    /// exercise the all-models-cooling / service-unavailable path.
    struct FailingProvider {
        model: String,
    }

    #[async_trait]
    impl LlmProvider for FailingProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<crate::providers::CompletionResponse, crate::providers::ProviderError> {
            Err(crate::providers::ProviderError::HttpStatus {
                status: 503,
                body: "upstream unavailable".to_owned(),
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

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn definition(&self) -> crate::providers::ToolDefinition {
            crate::providers::ToolDefinition {
                name: "echo".to_owned(),
                description: "echoes input".to_owned(),
                input_schema: json!({"type": "object"}),
            }
        }

        fn guard(&self) -> ToolGuard {
            ToolGuard::User
        }

        async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok(arguments.to_string()))
        }
    }

    fn build_run(reply: &str) -> (AgentRun, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&store)));
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let tool_router = Arc::new(ToolRouter::new(vec![Box::new(EchoTool)], audit));
        let models = ModelsConfig {
            primary: "anthropic/claude-sonnet-4".to_owned(),
            fallbacks: Vec::new(),
        };
        let failover = Arc::new(ModelFailover::new(&models, Arc::clone(&store)));
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert(
            "anthropic/claude-sonnet-4".to_owned(),
            Arc::new(StaticReplyProvider {
                model: "anthropic/claude-sonnet-4".to_owned(),
                reply: reply.to_owned(),
            }),
        );
        let metrics = Arc::new(MetricsCollector::new());
        let sink = Arc::new(crate::channel::RecordingChannelSink::new());
        let budget_config = BudgetConfig::default();
        let session_budget = Arc::new(SessionBudget::new(
            Arc::new(crate::agent::budget::DailyBudget::new(budget_config.max_tokens_per_day)),
            budget_config,
        ));
        let run = AgentRun::new(
            sessions, tool_router, failover, providers, metrics, sink, budget_config,
            session_budget,
        );
        (run, store)
    }

    fn build_run_with_provider(provider: Arc<dyn LlmProvider>) -> (AgentRun, Arc<Store>) {
        let (run, store, _failover) = build_run_with_provider_and_failover(provider);
        (run, store)
    }

    fn build_run_with_provider_and_failover(
        provider: Arc<dyn LlmProvider>,
    ) -> (AgentRun, Arc<Store>, Arc<ModelFailover>) {
        let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
        let sessions = Arc::new(SessionStore::new(Arc::clone(&store)));
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let tool_router = Arc::new(ToolRouter::new(vec![Box::new(EchoTool)], audit));
        let models = ModelsConfig {
            primary: "anthropic/claude-sonnet-4".to_owned(),
            fallbacks: Vec::new(),
        };
        let failover = Arc::new(ModelFailover::new(&models, Arc::clone(&store)));
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        providers.insert("anthropic/claude-sonnet-4".to_owned(), provider);
        let metrics = Arc::new(MetricsCollector::new());
        let sink = Arc::new(crate::channel::RecordingChannelSink::new());
        let budget_config = BudgetConfig::default();
        let session_budget = Arc::new(SessionBudget::new(
            Arc::new(crate::agent::budget::DailyBudget::new(budget_config.max_tokens_per_day)),
            budget_config,
        ));
        let run = AgentRun::new(
            sessions, tool_router, Arc::clone(&failover), providers, metrics, sink, budget_config,
            session_budget,
        );
        (run, store, failover)
    }

    #[tokio::test]
    async fn completed_run_persists_exchange_and_reports_success() {
        let (run, store) = build_run("hello back");
        let request = RunRequest {
            session_key: SessionKey::new(Channel::Telegram, "123"),
            user_message: "hi".to_owned(),
            profile: AgentProfile::default(),
            caller_level: AccessLevel::User,
        };
        let outcome = run.run(request, CancellationToken::new()).await.expect("call should succeed");
        assert!(matches!(outcome, AgentRunOutcome::Completed { reply } if reply == "hello back"));

        let count: i64 = store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM session_entries", [], |row| row.get(0))
            })
            .expect("with_conn should succeed");
        assert_eq!(count, 1);

        let active: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM active_runs", [], |row| row.get(0)))
            .expect("with_conn should succeed");
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn streaming_provider_reassembles_deltas_into_final_reply() {
        let provider = Arc::new(StreamingReplyProvider {
            model: "anthropic/claude-sonnet-4".to_owned(),
            reply: "hello from the stream".to_owned(),
        });
        let (run, _store) = build_run_with_provider(provider);
        let request = RunRequest {
            session_key: SessionKey::new(Channel::Telegram, "999"),
            user_message: "hi".to_owned(),
            profile: AgentProfile::default(),
            caller_level: AccessLevel::User,
        };
        let outcome = run.run(request, CancellationToken::new()).await.expect("call should succeed");
        assert!(
            matches!(outcome, AgentRunOutcome::Completed { reply } if reply == "hello from the stream")
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_produces_no_reply_and_clears_active_run() {
        let (run, store) = build_run("unused");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = RunRequest {
            session_key: SessionKey::new(Channel::Telegram, "456"),
            user_message: "hi".to_owned(),
            profile: AgentProfile::default(),
            caller_level: AccessLevel::User,
        };
        let outcome = run.run(request, cancel).await.expect("call should succeed");
        assert!(matches!(outcome, AgentRunOutcome::Cancelled));
        let active: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM active_runs", [], |row| row.get(0)))
            .expect("with_conn should succeed");
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn all_models_cooling_and_last_resort_failure_surfaces_service_unavailable() {
        let provider = Arc::new(FailingProvider {
            model: "anthropic/claude-sonnet-4".to_owned(),
        });
        let (run, _store, failover) = build_run_with_provider_and_failover(provider);
        failover
            .report_failure("anthropic/claude-sonnet-4", FailureClass::Server, "seeded cooldown")
            .expect("report_failure should succeed");
        assert!(
            failover.all_models_cooling().expect("all_models_cooling should succeed"),
            "the sole configured model must already be cooling before the run starts"
        );

        let request = RunRequest {
            session_key: SessionKey::new(Channel::Telegram, "service-unavailable"),
            user_message: "hi".to_owned(),
            profile: AgentProfile::default(),
            caller_level: AccessLevel::User,
        };
        let outcome = run.run(request, CancellationToken::new()).await.expect("call should succeed");
        assert!(matches!(outcome, AgentRunOutcome::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn recover_interrupted_runs_deletes_stale_rows() {
        let (run, store) = build_run("unused");
        let stale = ActiveRun {
            run_id: Uuid::new_v4(),
            session_key: SessionKey::new(Channel::Telegram, "789"),
            rounds_used: 1,
            tokens_used: 10,
            started_at: Utc::now(),
            budget: RunBudget {
                max_rounds: 10,
                max_tokens: 1000,
                max_wallclock_secs: 60,
            },
        };
        run.sessions.begin_run(&stale).expect("begin_run should succeed");
        let recovered = run.recover_interrupted_runs().await.expect("call should succeed");
        assert_eq!(recovered, 1);
        let active: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM active_runs", [], |row| row.get(0)))
            .expect("with_conn should succeed");
        assert_eq!(active, 0);
    }
}
