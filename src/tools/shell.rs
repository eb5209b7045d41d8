//! Shell tool for RelayClaw
//!
//! `exec` runs a command through `sh -c` in the workspace. The command is
//! checked against the security policy first, and the child is killed when
//! the turn is cancelled or the timeout expires.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::warn;

use crate::error::{RelayError, Result};
use crate::security::SecurityPolicy;
use crate::utils::string::truncate_with_notice;

use super::{parse_args, Tool, ToolCategory, ToolContext, ToolResult};

/// Characters of combined output returned to the model.
const MAX_OUTPUT_CHARS: usize = 20_000;

#[derive(Deserialize)]
struct ExecArgs {
    command: String,
    timeout_secs: Option<u64>,
}

/// Executes shell commands.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use relayclaw::security::SecurityPolicy;
/// use relayclaw::tools::{Tool, ToolContext};
/// use relayclaw::tools::shell::ShellTool;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let tool = ShellTool::new(Arc::new(SecurityPolicy::default()));
/// let ctx = ToolContext::new().with_workspace(dir.path());
/// let result = tool.execute(json!({"command": "echo hello"}), &ctx).await.unwrap();
/// assert_eq!(result.for_llm.trim(), "hello");
/// # });
/// ```
pub struct ShellTool {
    policy: Arc<SecurityPolicy>,
}

impl ShellTool {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }
}

fn format_output(stdout: &[u8], stderr: &[u8], code: Option<i32>) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    let mut out = stdout.trim_end().to_string();
    if !stderr.trim().is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("[stderr]\n");
        out.push_str(stderr.trim_end());
    }
    match code {
        Some(0) => {}
        Some(code) => out.push_str(&format!("\n[exit code: {}]", code)),
        None => out.push_str("\n[terminated by signal]"),
    }
    if out.is_empty() {
        out.push_str("(no output)");
    }
    out
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its output"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run with sh -c"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default from configuration)"
                }
            },
            "required": ["command"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: ExecArgs = parse_args(args)?;
        self.policy.check_command(&args.command)?;

        let timeout = args
            .timeout_secs
            .map(|s| Duration::from_secs(s.max(1)))
            .unwrap_or_else(|| self.policy.exec_timeout());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&args.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref workspace) = ctx.workspace {
            cmd.current_dir(workspace);
        }

        let child = cmd
            .spawn()
            .map_err(|e| RelayError::Tool(format!("Failed to start command: {}", e)))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                warn!(command = %args.command, "Command cancelled");
                return Err(RelayError::Cancelled("command cancelled".to_string()));
            }
            res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
                Ok(output) => output?,
                Err(_) => {
                    return Err(RelayError::Timeout(format!(
                        "command exceeded {}s",
                        timeout.as_secs()
                    )));
                }
            },
        };

        let text = truncate_with_notice(
            &format_output(&output.stdout, &output.stderr, output.status.code()),
            MAX_OUTPUT_CHARS,
        );
        if output.status.success() {
            Ok(ToolResult::llm_only(text))
        } else {
            Ok(ToolResult::error(text))
        }
    }
}
