//! Tool registry for RelayClaw
//!
//! Holds tools by unique name, exposes their schemas to the model, and
//! dispatches model-emitted calls. Dispatch never fails: every fault becomes
//! an `is_error` [`ToolResult`] with sanitized text, so one bad tool call
//! cannot abort the loop that issued it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};
use crate::providers::ToolDefinition;
use crate::session::ToolCall;

use super::{Capability, CompletionSink, Tool, ToolContext, ToolResult};

/// Everything the caller of [`ToolRegistry::dispatch`] knows about the turn.
///
/// The registry narrows this to a [`ToolContext`] per tool, according to the
/// capabilities the tool declares.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub workspace: Option<PathBuf>,
    pub completion: Option<CompletionSink>,
    pub cancel: CancellationToken,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: &str, chat_id: &str) -> Self {
        self.channel = Some(channel.to_string());
        self.chat_id = Some(chat_id.to_string());
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_completion(mut self, sink: CompletionSink) -> Self {
        self.completion = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The context a tool with `capabilities` is allowed to see.
    pub fn for_tool(&self, capabilities: &[Capability]) -> ToolContext {
        let mut ctx = ToolContext {
            workspace: self.workspace.clone(),
            cancel: self.cancel.clone(),
            ..Default::default()
        };
        if capabilities.contains(&Capability::ChatContext) {
            ctx.channel = self.channel.clone();
            ctx.chat_id = self.chat_id.clone();
        }
        if capabilities.contains(&Capability::AsyncCallback) {
            ctx.completion = self.completion.clone();
        }
        ctx
    }
}

/// A registry that holds and dispatches tools.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use relayclaw::session::ToolCall;
/// use relayclaw::tools::{DispatchContext, EchoTool, ToolRegistry};
///
/// # tokio_test::block_on(async {
/// let mut registry = ToolRegistry::new();
/// registry.register(Arc::new(EchoTool)).unwrap();
///
/// let call = ToolCall::new("call_1", "echo", r#"{"message": "hello"}"#);
/// let result = registry.dispatch(&call, &DispatchContext::new()).await;
/// assert_eq!(result.for_llm, "hello");
/// # });
/// ```
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique; a second registration is a
    /// configuration error.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RelayError::Config(format!(
                "Tool '{}' is already registered",
                name
            )));
        }
        debug!(tool = %name, category = %tool.category(), "Registering tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool definitions for the model, sorted by name.
    pub fn schemas(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// A copy of this registry without the tools named in `exclude`.
    pub fn isolated(&self, exclude: &[&str]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| !exclude.contains(&name.as_str()))
                .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
                .collect(),
        }
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch one model-emitted call.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &DispatchContext) -> ToolResult {
        let Some(tool) = self.get(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "Model requested unknown tool");
            return ToolResult::error(format!("Tool not found: {}", call.name));
        };

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Malformed tool arguments");
                return ToolResult::error(format!(
                    "Invalid arguments for '{}': arguments must be a JSON object",
                    call.name
                ))
                .with_detail(e.to_string());
            }
        };

        if let Err(reason) = validate_arguments(&tool.parameters(), &args) {
            warn!(tool = %call.name, reason = %reason, "Tool arguments failed validation");
            return ToolResult::error(format!("Invalid arguments for '{}': {}", call.name, reason));
        }

        let tool_ctx = ctx.for_tool(tool.capabilities());
        let start = Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(args, &tool_ctx))
            .catch_unwind()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                info!(
                    tool = %call.name,
                    latency_ms,
                    is_error = result.is_error,
                    is_async = result.is_async,
                    "Tool executed"
                );
                result
            }
            Ok(Err(e)) => {
                error!(tool = %call.name, latency_ms, error = %e, "Tool execution failed");
                if e.is_model_safe() {
                    ToolResult::error(e.to_string()).with_detail(format!("{:?}", e))
                } else {
                    ToolResult::internal_error(e.to_string())
                }
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(tool = %call.name, latency_ms, panic = %detail, "Tool panicked");
                ToolResult::internal_error(format!("panic: {}", detail))
            }
        }
    }
}

fn parse_arguments(raw: &str) -> serde_json::Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Check `args` against the subset of JSON Schema tools declare: an object
/// with required keys and primitive property types.
pub fn validate_arguments(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if obj.get(key).map_or(true, Value::is_null) {
                return Err(format!("missing required field '{}'", key));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in obj {
            if value.is_null() {
                continue;
            }
            let expected = props
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !type_matches(expected, value) {
                    return Err(format!("field '{}' must be of type {}", key, expected));
                }
            }
        }
    }

    Ok(())
}
