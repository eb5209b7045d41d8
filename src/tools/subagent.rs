//! Synchronous delegation tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::DelegationManager;
use crate::error::{RelayError, Result};
use crate::utils::string::preview;

use super::{parse_args, Capability, Tool, ToolCategory, ToolContext, ToolResult};

/// Characters of the report shown to the user.
const USER_PREVIEW_CHARS: usize = 200;

#[derive(Deserialize)]
struct SubagentArgs {
    task: String,
}

/// Runs a focused sub-agent and waits for its report.
pub struct SubagentTool {
    manager: Arc<DelegationManager>,
}

impl SubagentTool {
    pub fn new(manager: Arc<DelegationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "subagent"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a sub-agent and wait for its report."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete instructions for the sub-agent"
                }
            },
            "required": ["task"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::ChatContext]
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Delegation
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: SubagentArgs = parse_args(args)?;
        let task = args.task.trim();
        if task.is_empty() {
            return Err(RelayError::Tool("Task description is empty".to_string()));
        }

        let origin = ctx.session_key();
        let report = self
            .manager
            .run_subagent(task, origin.as_deref(), &ctx.cancel)
            .await?;

        let for_llm = format!(
            "Subagent finished ({}, {} iterations)\n\n{}",
            report.terminal, report.iterations, report.content
        );
        let for_user = format!(
            "Sub-agent: {}",
            preview(report.content.trim(), USER_PREVIEW_CHARS)
        );
        Ok(ToolResult::split(for_llm, for_user))
    }
}
