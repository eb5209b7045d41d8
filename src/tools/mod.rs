//! Tools module - Tool definitions and dispatch for LLM function calling
//!
//! This module provides the infrastructure for defining and executing tools
//! that the model can call during a turn.
//!
//! # Overview
//!
//! - `Tool` trait: the interface every tool implements
//! - `ToolResult`: dual-audience result (model text, optional user text)
//! - `ToolContext`: per-call context, gated by declared [`Capability`]
//! - `ToolRegistry`: name-keyed registry with schema export and dispatch
//!
//! # Built-in Tools
//!
//! - `EchoTool`: echoes its input, for diagnostics and tests
//! - `ReadFileTool`, `WriteFileTool`, `ListDirTool`: workspace files
//! - `ShellTool`: `exec`, runs shell commands
//! - `MessageTool`: sends a message to a chat directly
//! - `SpawnTool`, `SubagentTool`: delegation
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use relayclaw::session::ToolCall;
//! use relayclaw::tools::{DispatchContext, EchoTool, ToolRegistry};
//!
//! # tokio_test::block_on(async {
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(EchoTool)).unwrap();
//!
//! let call = ToolCall::new("call_1", "echo", r#"{"message": "Hello!"}"#);
//! let result = registry.dispatch(&call, &DispatchContext::new()).await;
//! assert_eq!(result.for_llm, "Hello!");
//! assert_eq!(registry.schemas().len(), 1);
//! # });
//! ```

pub mod filesystem;
pub mod message;
mod registry;
pub mod shell;
pub mod spawn;
pub mod subagent;
mod types;

pub use registry::{validate_arguments, DispatchContext, ToolRegistry};
pub use types::{
    parse_args, Capability, CompletionSink, Tool, ToolCategory, ToolContext, ToolResult,
    TOOL_FAILURE_MESSAGE,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

#[derive(Deserialize)]
struct EchoArgs {
    message: String,
}

/// A simple echo tool for testing purposes.
///
/// # Example
///
/// ```rust
/// use relayclaw::tools::{EchoTool, Tool, ToolContext};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let result = EchoTool
///     .execute(json!({"message": "Hello"}), &ToolContext::new())
///     .await
///     .unwrap();
/// assert_eq!(result.for_llm, "Hello");
/// # });
/// ```
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Diagnostics
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let args: EchoArgs = parse_args(args)?;
        Ok(ToolResult::llm_only(args.message))
    }
}
