//! C4: Tool Executor — dispatch pipeline for every tool call an agent run
//! makes.
//!
//! Pipeline order: existence/schema check → [`crate::access`] gate →
//! [`risk`] classification → [`loop_detect`] → handler invocation → audit
//! append. Any stage short of the handler can short-circuit the call with a
//! [`ToolError`].

pub mod builtin;
pub mod executor;
pub mod loop_detect;
pub mod risk;
pub mod team_tools;

use async_trait::async_trait;
use serde_json::Value;

use crate::providers::ToolDefinition;
use crate::types::AccessLevel;

/// Minimum access level required to invoke a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolGuard {
    /// Anyone with [`AccessLevel::User`] or above may call this tool.
    User,
    /// Requires [`AccessLevel::Admin`] or above.
    Admin,
    /// Requires [`AccessLevel::Owner`].
    Owner,
}

impl ToolGuard {
    /// Returns `true` when `level` satisfies this guard.
    pub fn satisfied_by(self, level: AccessLevel) -> bool {
        match self {
            Self::User => level >= AccessLevel::User,
            Self::Admin => level >= AccessLevel::Admin,
            Self::Owner => level >= AccessLevel::Owner,
        }
    }
}

/// Outcome of a handler invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Result content returned to the LLM as a tool message.
    pub content: String,
    /// Whether the handler itself reported failure.
    pub is_error: bool,
}

impl ToolOutput {
    /// Build a successful output.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Build a failed output.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A single in-process tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Static tool definition advertised to the LLM.
    fn definition(&self) -> ToolDefinition;

    /// Minimum access level required to call this tool.
    fn guard(&self) -> ToolGuard {
        ToolGuard::User
    }

    /// Whether this tool's `command` argument should go through exec-command
    /// risk analysis before running.
    fn is_shell_command(&self) -> bool {
        false
    }

    /// Invoke the tool with validated arguments.
    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput>;
}
