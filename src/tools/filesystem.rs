//! Filesystem tools for RelayClaw
//!
//! `read_file`, `write_file` and `list_dir`. Every path goes through the
//! shared [`SecurityPolicy`], which resolves it against the workspace and
//! enforces containment when configured.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{RelayError, Result};
use crate::security::SecurityPolicy;
use crate::utils::string::truncate_with_notice;

use super::{parse_args, Tool, ToolCategory, ToolContext, ToolResult};

/// Characters of file content returned to the model.
const MAX_READ_CHARS: usize = 50_000;

fn resolve(policy: &SecurityPolicy, path: &str, ctx: &ToolContext) -> Result<PathBuf> {
    let workspace = ctx.require_workspace()?;
    policy.resolve_path(path, workspace)
}

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
}

/// Reads a UTF-8 text file.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use relayclaw::security::SecurityPolicy;
/// use relayclaw::tools::{Tool, ToolContext};
/// use relayclaw::tools::filesystem::ReadFileTool;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();
///
/// let tool = ReadFileTool::new(Arc::new(SecurityPolicy::default()));
/// let ctx = ToolContext::new().with_workspace(dir.path());
/// let result = tool.execute(json!({"path": "hello.txt"}), &ctx).await.unwrap();
/// assert_eq!(result.for_llm, "hello");
/// # });
/// ```
pub struct ReadFileTool {
    policy: Arc<SecurityPolicy>,
}

impl ReadFileTool {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: ReadArgs = parse_args(args)?;
        let full_path = resolve(&self.policy, &args.path, ctx)?;

        let content = tokio::fs::read_to_string(&full_path)
            .await
            .map_err(|e| RelayError::Tool(format!("Failed to read '{}': {}", args.path, e)))?;

        Ok(ToolResult::llm_only(truncate_with_notice(
            &content,
            MAX_READ_CHARS,
        )))
    }
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

/// Writes a file, creating parent directories as needed.
pub struct WriteFileTool {
    policy: Arc<SecurityPolicy>,
}

impl WriteFileTool {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating it if necessary"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemWrite
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: WriteArgs = parse_args(args)?;
        let full_path = resolve(&self.policy, &args.path, ctx)?;

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RelayError::Tool(format!("Failed to create parent of '{}': {}", args.path, e))
            })?;
        }

        tokio::fs::write(&full_path, args.content.as_bytes())
            .await
            .map_err(|e| RelayError::Tool(format!("Failed to write '{}': {}", args.path, e)))?;

        Ok(ToolResult::llm_only(format!(
            "Wrote {} bytes to {}",
            args.content.len(),
            args.path
        )))
    }
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default = "default_dir")]
    path: String,
}

fn default_dir() -> String {
    ".".to_string()
}

/// Lists a directory, one entry per line, directories suffixed with `/`.
pub struct ListDirTool {
    policy: Arc<SecurityPolicy>,
}

impl ListDirTool {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the workspace (default: workspace root)"
                }
            }
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: ListArgs = parse_args(args)?;
        let full_path = resolve(&self.policy, &args.path, ctx)?;

        let mut entries = tokio::fs::read_dir(&full_path)
            .await
            .map_err(|e| RelayError::Tool(format!("Failed to list '{}': {}", args.path, e)))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        if names.is_empty() {
            return Ok(ToolResult::llm_only(format!("{} is empty", args.path)));
        }
        Ok(ToolResult::llm_only(names.join("\n")))
    }
}
