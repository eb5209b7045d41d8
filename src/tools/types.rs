//! Tool types for RelayClaw
//!
//! This module defines the [`Tool`] trait every tool implements, the typed
//! [`ToolResult`] it returns, and the [`ToolContext`] it runs with.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::{InboundMessage, MessageBus};
use crate::error::{RelayError, Result};

/// What a tool needs from the dispatcher beyond its arguments.
///
/// The registry hands out chat context and the completion sink only to tools
/// that declare the matching capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Receives the originating channel and chat id.
    ChatContext,
    /// Receives a [`CompletionSink`] for reporting results later.
    AsyncCallback,
}

/// Coarse classification used in logs and prompt listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FilesystemRead,
    FilesystemWrite,
    Shell,
    Messaging,
    Delegation,
    Diagnostics,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilesystemRead => write!(f, "filesystem_read"),
            Self::FilesystemWrite => write!(f, "filesystem_write"),
            Self::Shell => write!(f, "shell"),
            Self::Messaging => write!(f, "messaging"),
            Self::Delegation => write!(f, "delegation"),
            Self::Diagnostics => write!(f, "diagnostics"),
        }
    }
}

/// Text returned to the model when a tool fails in a way that must not leak.
pub const TOOL_FAILURE_MESSAGE: &str = "The tool failed with an internal error.";

/// Dual-audience tool result.
///
/// `for_llm` is what the model sees; `for_user` is what the human sees, if
/// anything. `detail` is internal-only and never rendered to either.
/// An async result carries only an acknowledgement: its real content arrives
/// later as a new inbound message on the `system` channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResult {
    pub for_llm: String,
    pub for_user: Option<String>,
    /// Suppress `for_user` even when present.
    pub silent: bool,
    pub is_error: bool,
    pub is_async: bool,
    /// Content the tool already delivered to the user directly.
    pub delivered: Option<String>,
    /// Raw error detail for logs.
    pub detail: Option<String>,
}

impl ToolResult {
    /// Model-only result. The user sees nothing.
    pub fn llm_only(content: impl Into<String>) -> Self {
        Self {
            for_llm: content.into(),
            ..Default::default()
        }
    }

    /// Both model and user see the same content.
    ///
    /// # Example
    /// ```
    /// use relayclaw::tools::ToolResult;
    ///
    /// let result = ToolResult::user_visible("done");
    /// assert_eq!(result.user_content(), Some("done"));
    /// ```
    pub fn user_visible(content: impl Into<String>) -> Self {
        let s = content.into();
        Self {
            for_llm: s.clone(),
            for_user: Some(s),
            ..Default::default()
        }
    }

    /// Different content for model and user.
    pub fn split(for_llm: impl Into<String>, for_user: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            for_user: Some(for_user.into()),
            ..Default::default()
        }
    }

    /// Model-only result that is also flagged silent.
    pub fn silent(content: impl Into<String>) -> Self {
        Self {
            for_llm: content.into(),
            silent: true,
            ..Default::default()
        }
    }

    /// Error the model may read verbatim.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            for_llm: content.into(),
            is_error: true,
            ..Default::default()
        }
    }

    /// Error whose cause stays internal; the model sees a generic message.
    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self {
            for_llm: TOOL_FAILURE_MESSAGE.to_string(),
            is_error: true,
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    /// Background work started; only an acknowledgement for the model.
    pub fn async_task(ack: impl Into<String>) -> Self {
        Self {
            for_llm: ack.into(),
            is_async: true,
            ..Default::default()
        }
    }

    /// The tool sent `content` to the user itself.
    pub fn delivered(for_llm: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            silent: true,
            delivered: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Content to show the user right away, honoring `silent`.
    pub fn user_content(&self) -> Option<&str> {
        if self.silent || self.is_async {
            return None;
        }
        self.for_user.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Trait that all tools must implement.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use relayclaw::tools::{Tool, ToolContext, ToolResult};
/// use relayclaw::error::Result;
///
/// struct MyTool;
///
/// #[async_trait]
/// impl Tool for MyTool {
///     fn name(&self) -> &str { "my_tool" }
///     fn description(&self) -> &str { "Does something useful" }
///     fn parameters(&self) -> Value {
///         serde_json::json!({"type": "object", "properties": {}, "required": []})
///     }
///     async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
///         Ok(ToolResult::llm_only("Done!"))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls the tool by.
    fn name(&self) -> &str;

    /// Description sent to the model.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments. The registry validates calls against it.
    fn parameters(&self) -> Value;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Defaults to `Shell`, the most restrictive reading.
    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }

    /// Run the tool on arguments that already passed schema validation.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult>;
}

/// Deserialize validated arguments into a tool's own argument struct.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| RelayError::Tool(format!("Invalid arguments: {}", e)))
}

/// Publishes delegated-task completions back onto the bus.
///
/// Completions re-enter as `system` inbound messages addressed to the
/// originating conversation, so the session keeps a single writer.
#[derive(Clone)]
pub struct CompletionSink {
    bus: MessageBus,
    origin_key: String,
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSink")
            .field("origin_key", &self.origin_key)
            .finish()
    }
}

impl CompletionSink {
    pub fn new(bus: MessageBus, origin_key: &str) -> Self {
        Self {
            bus,
            origin_key: origin_key.to_string(),
        }
    }

    pub fn origin_key(&self) -> &str {
        &self.origin_key
    }

    /// Publish one completion message for the origin conversation.
    pub async fn complete(
        &self,
        sender_id: &str,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut msg = InboundMessage::system_completion(&self.origin_key, sender_id, content);
        msg.metadata = metadata;
        self.bus.publish_inbound(msg).await
    }
}

/// Context a tool runs with.
///
/// Channel and chat id are set only for tools declaring
/// [`Capability::ChatContext`]; `completion` only for
/// [`Capability::AsyncCallback`].
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub workspace: Option<PathBuf>,
    pub completion: Option<CompletionSink>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// # Example
    /// ```
    /// use relayclaw::tools::ToolContext;
    ///
    /// let ctx = ToolContext::new().with_channel("telegram", "123456");
    /// assert_eq!(ctx.session_key().as_deref(), Some("telegram:123456"));
    /// ```
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

    /// The "channel:chat_id" key of the calling conversation, if known.
    pub fn session_key(&self) -> Option<String> {
        match (&self.channel, &self.chat_id) {
            (Some(channel), Some(chat)) => Some(format!("{}:{}", channel, chat)),
            _ => None,
        }
    }

    /// The workspace, or a `Tool` error for tools that cannot run without one.
    pub fn require_workspace(&self) -> Result<&PathBuf> {
        self.workspace
            .as_ref()
            .ok_or_else(|| RelayError::Tool("No workspace configured".to_string()))
    }
}
