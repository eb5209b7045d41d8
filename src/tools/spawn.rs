//! Background sub-task tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::DelegationManager;
use crate::error::{RelayError, Result};
use crate::utils::string::preview;

use super::{parse_args, Capability, Tool, ToolCategory, ToolContext, ToolResult};

#[derive(Deserialize)]
struct SpawnArgs {
    task: String,
    label: Option<String>,
}

/// Tool to spawn a delegated background task.
///
/// Returns at once with an async result; the task's report arrives later as
/// a `system` message for the calling conversation.
pub struct SpawnTool {
    manager: Arc<DelegationManager>,
}

impl SpawnTool {
    pub fn new(manager: Arc<DelegationManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a delegated background task. The result is reported back to this \
         conversation when the task completes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Task description for delegated execution"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short task label"
                }
            },
            "required": ["task"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::ChatContext, Capability::AsyncCallback]
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Delegation
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: SpawnArgs = parse_args(args)?;
        let task = args.task.trim();
        if task.is_empty() {
            return Err(RelayError::Tool("Task description is empty".to_string()));
        }
        let sink = ctx
            .completion
            .clone()
            .ok_or_else(|| RelayError::Tool("Background tasks are unavailable here".to_string()))?;

        let label = args
            .label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| preview(task, 30));

        let task_id = self.manager.spawn(task, &label, sink).await?;
        Ok(ToolResult::async_task(format!(
            "Spawned background task '{}' (id: {}). Its result will arrive as a new message.",
            label, task_id
        )))
    }
}
