//! Built-in tool handlers available to every agent run without any
//! dynamic registration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ToolGuard, ToolHandler, ToolOutput};
use crate::providers::ToolDefinition;

/// Maximum bytes of command output surfaced to the LLM before truncation.
const MAX_OUTPUT_BYTES: usize = 8_000;

/// Shrink `body` to at most [`MAX_OUTPUT_BYTES`], appending a marker when
/// truncated, without splitting a UTF-8 codepoint.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_OUTPUT_BYTES {
        return body.to_owned();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !body.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    format!("{}\n...[truncated]", &body[..end])
}

/// Reads a UTF-8 text file from within the agent's workspace.
pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    /// Build a reader scoped to `workspace`.
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    fn resolve(&self, relative: &str) -> anyhow::Result<PathBuf> {
        resolve_within(&self.workspace, relative)
    }
}

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_owned(),
            description: "Read a UTF-8 text file from the workspace.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: PathArgs = serde_json::from_value(arguments)?;
        let resolved = self.resolve(&args.path)?;
        match std::fs::read_to_string(&resolved) {
            Ok(body) => Ok(ToolOutput::ok(truncate_body(&body))),
            Err(e) => Ok(ToolOutput::error(format!("read failed: {e}"))),
        }
    }
}

/// Writes a UTF-8 text file within the agent's workspace.
pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    /// Build a writer scoped to `workspace`.
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_owned(),
            description: "Write a UTF-8 text file within the workspace, creating parent directories as needed.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn guard(&self) -> ToolGuard {
        ToolGuard::User
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: WriteArgs = serde_json::from_value(arguments)?;
        let resolved = resolve_within(&self.workspace, &args.path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::write(&resolved, &args.content) {
            Ok(()) => Ok(ToolOutput::ok(format!("wrote {} bytes", args.content.len()))),
            Err(e) => Ok(ToolOutput::error(format!("write failed: {e}"))),
        }
    }
}

/// Lists entries in a workspace directory.
pub struct ListDirTool {
    workspace: PathBuf,
}

impl ListDirTool {
    /// Build a lister scoped to `workspace`.
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ToolHandler for ListDirTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_dir".to_owned(),
            description: "List entries in a workspace directory.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": { "path": { "type": "string", "default": "." } }
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let path = arguments
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".")
            .to_owned();
        let resolved = resolve_within(&self.workspace, &path)?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&resolved)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(ToolOutput::ok(names.join("\n")))
    }
}

/// Fetches a URL over HTTP(S) and returns the response body, subject to
/// [`MAX_OUTPUT_BYTES`] truncation.
pub struct HttpGetTool {
    client: reqwest::Client,
}

impl HttpGetTool {
    /// Build an HTTP GET tool with default client settings.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGetTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct UrlArgs {
    url: String,
}

#[async_trait]
impl ToolHandler for HttpGetTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "http_get".to_owned(),
            description: "Fetch a URL over HTTP(S) and return the response body.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: UrlArgs = serde_json::from_value(arguments)?;
        let url: url::Url = args.url.parse()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Ok(ToolOutput::error("only http/https URLs are allowed"));
        }
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok(ToolOutput::ok(truncate_body(&body)))
                } else {
                    Ok(ToolOutput::error(format!("HTTP {status}: {}", truncate_body(&body))))
                }
            }
            Err(e) => Ok(ToolOutput::error(format!("request failed: {e}"))),
        }
    }
}

/// Maximum wall-clock time allowed for a single shell command.
const SHELL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Runs a shell command inside the agent's workspace.
///
/// Unlike [`ReadFileTool`]/[`WriteFileTool`], every invocation passes through
/// the exec-command risk analysis stage of the dispatch pipeline before it
/// reaches this handler (see [`ToolHandler::is_shell_command`]).
pub struct ShellExecTool {
    workspace: PathBuf,
}

impl ShellExecTool {
    /// Build a shell runner scoped to `workspace`.
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[derive(Debug, Deserialize)]
struct CommandArgs {
    command: String,
}

#[async_trait]
impl ToolHandler for ShellExecTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "bash".to_owned(),
            description: "Run a shell command in the agent's workspace.".to_owned(),
            input_schema: json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
        }
    }

    fn guard(&self) -> ToolGuard {
        ToolGuard::User
    }

    fn is_shell_command(&self) -> bool {
        true
    }

    async fn call(&self, arguments: Value) -> anyhow::Result<ToolOutput> {
        let args: CommandArgs = serde_json::from_value(arguments)?;
        let run = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&args.command)
            .current_dir(&self.workspace)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(SHELL_TIMEOUT, run).await {
            Ok(Ok(output)) => {
                let mut body = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !body.is_empty() {
                        body.push('\n');
                    }
                    body.push_str(&stderr);
                }
                if output.status.success() {
                    Ok(ToolOutput::ok(truncate_body(&body)))
                } else {
                    Ok(ToolOutput::error(format!(
                        "exit status {}: {}",
                        output.status.code().unwrap_or(-1),
                        truncate_body(&body)
                    )))
                }
            }
            Ok(Err(e)) => Ok(ToolOutput::error(format!("failed to spawn command: {e}"))),
            Err(_) => Ok(ToolOutput::error(format!(
                "command timed out after {}s",
                SHELL_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Ensure `relative` resolves to a path inside `root`, rejecting `..`
/// escapes and absolute paths.
fn resolve_within(root: &Path, relative: &str) -> anyhow::Result<PathBuf> {
    if Path::new(relative).is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {relative}");
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => anyhow::bail!("path traversal is not allowed: {relative}"),
            _ => anyhow::bail!("unsupported path component in {relative}"),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_body_leaves_short_bodies_untouched() {
        assert_eq!(truncate_body("hello"), "hello");
    }

    #[test]
    fn truncate_body_caps_long_bodies() {
        let long = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("...[truncated]"));
        assert!(truncated.len() < long.len());
    }

    #[test]
    fn resolve_within_rejects_parent_traversal() {
        let root = Path::new("/tmp/workspace");
        assert!(resolve_within(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn resolve_within_rejects_absolute_paths() {
        let root = Path::new("/tmp/workspace");
        assert!(resolve_within(root, "/etc/passwd").is_err());
    }

    #[test]
    fn resolve_within_accepts_relative_paths() {
        let root = Path::new("/tmp/workspace");
        let resolved = resolve_within(root, "notes/todo.md").expect("resolve_within should succeed");
        assert_eq!(resolved, Path::new("/tmp/workspace/notes/todo.md"));
    }
}
