//! The C4 dispatch pipeline itself: [`ToolRouter::dispatch`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{info, warn};

use super::loop_detect::{LoopDetector, Severity};
use super::risk::{self, RiskAction};
use super::{ToolHandler, ToolOutput};
use crate::audit::AuditLog;
use crate::providers::ToolDefinition;
use crate::types::AccessLevel;

/// Errors that can short-circuit a tool call before the handler runs.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// No tool registered under that name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// Caller's access level does not satisfy the tool's guard.
    #[error("access denied for tool: {0}")]
    AccessDenied(String),
    /// Exec-command risk analysis blocked the call outright.
    #[error("command blocked by risk policy: {0}")]
    RiskBlocked(String),
    /// An approval is required before this call can run.
    #[error("command requires approval: {0}")]
    RequiresApproval(String),
    /// The loop detector's breaker tripped.
    #[error("loop breaker tripped for tool: {0}")]
    LoopBreaker(String),
    /// Arguments did not deserialize against the tool's schema.
    #[error("invalid arguments for tool {tool}: {source}")]
    InvalidArgs {
        /// Tool name.
        tool: String,
        /// Underlying deserialization error.
        #[source]
        source: anyhow::Error,
    },
    /// The handler itself returned an error.
    #[error("tool handler failed: {0}")]
    HandlerFailed(#[from] anyhow::Error),
}

/// Routes tool calls through access control, risk analysis, and loop
/// detection before invoking the registered handler.
pub struct ToolRouter {
    handlers: HashMap<String, Box<dyn ToolHandler>>,
    loop_detectors: Mutex<HashMap<String, LoopDetector>>,
    audit: std::sync::Arc<AuditLog>,
    /// Tool names that bypass `RequireApproval` friction outright, e.g. a
    /// trusted CI tool. Never bypasses an outright `Deny`.
    auto_approve: HashSet<String>,
}

impl ToolRouter {
    /// Build a router from a list of handlers with no auto-approved tools.
    pub fn new(handlers: Vec<Box<dyn ToolHandler>>, audit: std::sync::Arc<AuditLog>) -> Self {
        Self::with_auto_approve(handlers, audit, HashSet::new())
    }

    /// Build a router whose `auto_approve` tool names bypass `RequireApproval`
    /// friction (but never an outright `Deny`) regardless of caller level.
    pub fn with_auto_approve(
        handlers: Vec<Box<dyn ToolHandler>>,
        audit: std::sync::Arc<AuditLog>,
        auto_approve: HashSet<String>,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.definition().name.clone(), h))
            .collect();
        Self {
            handlers,
            loop_detectors: Mutex::new(HashMap::new()),
            audit,
            auto_approve,
        }
    }

    /// All tool definitions advertised to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.values().map(|h| h.definition()).collect()
    }

    /// Run the full dispatch pipeline for a single tool call.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] if any pipeline stage rejects the call.
    pub async fn dispatch(
        &self,
        run_id: &str,
        tool_name: &str,
        arguments: Value,
        caller_level: AccessLevel,
    ) -> Result<ToolOutput, ToolError> {
        let Some(handler) = self.handlers.get(tool_name) else {
            self.audit.record(run_id, tool_name, &arguments, false, "unknown tool");
            return Err(ToolError::UnknownTool(tool_name.to_owned()));
        };

        if !handler.guard().satisfied_by(caller_level) {
            self.audit.record(run_id, tool_name, &arguments, false, "access denied");
            return Err(ToolError::AccessDenied(tool_name.to_owned()));
        }

        if handler.is_shell_command() {
            if let Some(command) = arguments.get("command").and_then(Value::as_str) {
                match risk::classify(command).default_action() {
                    RiskAction::Deny => {
                        self.audit.record(run_id, tool_name, &arguments, false, "risk blocked");
                        return Err(ToolError::RiskBlocked(command.to_owned()));
                    }
                    RiskAction::RequireApproval => {
                        // Owners bypass confirmation; so does a tool on the
                        // auto-approve list. Neither bypasses `Deny` above.
                        if caller_level == AccessLevel::Owner || self.auto_approve.contains(tool_name) {
                            warn!(
                                run_id,
                                tool = tool_name,
                                command,
                                "dangerous command auto-approved for caller"
                            );
                        } else {
                            self.audit
                                .record(run_id, tool_name, &arguments, false, "pending approval");
                            return Err(ToolError::RequiresApproval(command.to_owned()));
                        }
                    }
                    RiskAction::AllowLog => {
                        warn!(run_id, tool = tool_name, command, "moderate-risk command allowed");
                    }
                    RiskAction::Allow => {}
                }
            }
        }

        let fingerprint_args = canonical_json(&arguments);
        let severity = {
            let mut detectors = self.loop_detectors.lock().expect("loop detector lock");
            let detector = detectors.entry(run_id.to_owned()).or_default();
            detector.record(tool_name, &fingerprint_args)
        };
        if severity == Severity::Breaker {
            self.audit.record(run_id, tool_name, &arguments, false, "loop breaker");
            return Err(ToolError::LoopBreaker(tool_name.to_owned()));
        }
        if severity == Severity::Critical {
            warn!(run_id, tool = tool_name, "loop detector critical — consider aborting");
        }

        let result = handler.call(arguments.clone()).await;

        match result {
            Ok(output) => {
                self.audit.record(run_id, tool_name, &arguments, !output.is_error, "ok");
                info!(run_id, tool = tool_name, "tool call completed");
                Ok(output)
            }
            Err(e) => {
                self.audit.record(run_id, tool_name, &arguments, false, "handler error");
                Err(ToolError::HandlerFailed(e))
            }
        }
    }

    /// Drop loop-detector state for a finished run.
    pub fn forget_run(&self, run_id: &str) {
        self.loop_detectors
            .lock()
            .expect("loop detector lock")
            .remove(run_id);
    }
}

/// Serialize arguments with sorted keys so semantically identical calls
/// fingerprint identically regardless of field order.
fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by_key(|(k, _)| k.clone());
                let mut sorted = serde_json::Map::new();
                for (k, v) in entries {
                    sorted.insert(k.clone(), sort(v));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolGuard;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".to_owned(),
                description: "Echo back the input.".to_owned(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok(arguments.to_string()))
        }
    }

    struct AdminOnlyTool;

    #[async_trait]
    impl ToolHandler for AdminOnlyTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "admin_tool".to_owned(),
                description: "Restricted.".to_owned(),
                input_schema: json!({"type": "object"}),
            }
        }

        fn guard(&self) -> ToolGuard {
            ToolGuard::Admin
        }

        async fn call(&self, _arguments: Value) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok("granted"))
        }
    }

    struct ShellTool;

    #[async_trait]
    impl ToolHandler for ShellTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "shell_exec".to_owned(),
                description: "Run a shell command.".to_owned(),
                input_schema: json!({"type": "object"}),
            }
        }

        fn is_shell_command(&self) -> bool {
            true
        }

        async fn call(&self, _arguments: Value) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok("ran"))
        }
    }

    fn router(handlers: Vec<Box<dyn ToolHandler>>) -> ToolRouter {
        let audit = Arc::new(AuditLog::new(Arc::new(crate::db::Store::open_in_memory().expect("open_in_memory should succeed"))));
        ToolRouter::new(handlers, audit)
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let router = router(vec![]);
        let result = router
            .dispatch("run1", "nope", json!({}), AccessLevel::User)
            .await;
        assert!(matches!(result, Err(ToolError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn unknown_tool_still_writes_an_audit_row() {
        let audit = Arc::new(AuditLog::new(Arc::new(
            crate::db::Store::open_in_memory().expect("open_in_memory should succeed"),
        )));
        let router = ToolRouter::new(vec![], Arc::clone(&audit));
        let result = router
            .dispatch("run1", "nope", json!({}), AccessLevel::User)
            .await;
        assert!(matches!(result, Err(ToolError::UnknownTool(_))));
        assert_eq!(
            audit.count_for_run("run1"),
            1,
            "spec §4.2 step 6: the audit append is always written, even on deny"
        );
    }

    #[tokio::test]
    async fn guard_blocks_insufficient_access() {
        let router = router(vec![Box::new(AdminOnlyTool)]);
        let result = router
            .dispatch("run1", "admin_tool", json!({}), AccessLevel::User)
            .await;
        assert!(matches!(result, Err(ToolError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn guard_allows_sufficient_access() {
        let router = router(vec![Box::new(AdminOnlyTool)]);
        let result = router
            .dispatch("run1", "admin_tool", json!({}), AccessLevel::Admin)
            .await
            .expect("call should succeed");
        assert_eq!(result.content, "granted");
    }

    #[tokio::test]
    async fn dangerous_shell_command_requires_approval_for_non_owner() {
        let router = router(vec![Box::new(ShellTool)]);
        let result = router
            .dispatch(
                "run1",
                "shell_exec",
                json!({"command": "sudo rm -rf build"}),
                AccessLevel::User,
            )
            .await;
        assert!(matches!(result, Err(ToolError::RequiresApproval(_))));
    }

    #[tokio::test]
    async fn owner_bypasses_approval_for_dangerous_command() {
        let router = router(vec![Box::new(ShellTool)]);
        let result = router
            .dispatch(
                "run1",
                "shell_exec",
                json!({"command": "sudo rm -rf build"}),
                AccessLevel::Owner,
            )
            .await
            .expect("owner should bypass the approval gate");
        assert_eq!(result.content, "ran");
    }

    #[tokio::test]
    async fn auto_approve_list_bypasses_approval_for_any_caller() {
        let audit = Arc::new(AuditLog::new(Arc::new(
            crate::db::Store::open_in_memory().expect("open_in_memory should succeed"),
        )));
        let router = ToolRouter::with_auto_approve(
            vec![Box::new(ShellTool)],
            audit,
            HashSet::from(["shell_exec".to_owned()]),
        );
        let result = router
            .dispatch(
                "run1",
                "shell_exec",
                json!({"command": "sudo rm -rf build"}),
                AccessLevel::User,
            )
            .await
            .expect("auto-approved tool should bypass the approval gate");
        assert_eq!(result.content, "ran");
    }

    #[tokio::test]
    async fn owner_does_not_bypass_an_outright_deny() {
        let router = router(vec![Box::new(ShellTool)]);
        let result = router
            .dispatch(
                "run1",
                "shell_exec",
                json!({"command": "rm -rf /"}),
                AccessLevel::Owner,
            )
            .await;
        assert!(matches!(result, Err(ToolError::RiskBlocked(_))));
    }

    #[tokio::test]
    async fn blocked_shell_command_is_denied() {
        let router = router(vec![Box::new(ShellTool)]);
        let result = router
            .dispatch(
                "run1",
                "shell_exec",
                json!({"command": "rm -rf /"}),
                AccessLevel::Owner,
            )
            .await;
        assert!(matches!(result, Err(ToolError::RiskBlocked(_))));
    }

    #[tokio::test]
    async fn repeated_identical_calls_trip_loop_breaker() {
        let router = router(vec![Box::new(EchoTool)]);
        let mut last = Ok(ToolOutput::ok(""));
        for _ in 0..9 {
            last = router
                .dispatch("run1", "echo", json!({"a": 1}), AccessLevel::User)
                .await;
        }
        assert!(matches!(last, Err(ToolError::LoopBreaker(_))));
    }

    #[tokio::test]
    async fn argument_key_order_does_not_evade_loop_detection() {
        let router = router(vec![Box::new(EchoTool)]);
        let mut last = Ok(ToolOutput::ok(""));
        for i in 0..9 {
            let args = if i % 2 == 0 {
                json!({"a": 1, "b": 2})
            } else {
                json!({"b": 2, "a": 1})
            };
            last = router.dispatch("run1", "echo", args, AccessLevel::User).await;
        }
        assert!(matches!(last, Err(ToolError::LoopBreaker(_))));
    }
}
