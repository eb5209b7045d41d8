//! Provider types for RelayClaw
//!
//! The model backend is an external collaborator. The engine only needs the
//! [`LLMProvider`] contract below; concrete HTTP clients live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{RelayError, Result};
use crate::session::Message;

/// Definition of a tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (unique within a registry)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// # Example
    /// ```
    /// use relayclaw::providers::ToolDefinition;
    /// use serde_json::json;
    ///
    /// let tool = ToolDefinition::new(
    ///     "read_file",
    ///     "Read a file from the workspace",
    ///     json!({
    ///         "type": "object",
    ///         "properties": { "path": { "type": "string" } },
    ///         "required": ["path"]
    ///     }),
    /// );
    /// assert_eq!(tool.name, "read_file");
    /// ```
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Trait for model backends.
///
/// Implementations translate between the session message format and their
/// wire format. Failures should be reported as
/// [`ProviderError`](crate::error::ProviderError) so retries can classify them.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Send one chat completion request.
    ///
    /// `model` overrides [`default_model`](Self::default_model) when set.
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse>;

    /// Model used when the caller passes no override.
    fn default_model(&self) -> &str;

    /// Provider name for logs (e.g. "anthropic").
    fn name(&self) -> &str;
}

/// Sampling options for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl ChatOptions {
    /// # Example
    /// ```
    /// use relayclaw::providers::ChatOptions;
    ///
    /// let options = ChatOptions::new().with_max_tokens(1000).with_temperature(0.2);
    /// assert_eq!(options.max_tokens, Some(1000));
    /// assert_eq!(options.temperature, Some(0.2));
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// Response from one chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    /// Text content (may be empty when only tool calls are returned)
    pub content: String,
    /// Tool calls requested by the model, in order
    pub tool_calls: Vec<LLMToolCall>,
    pub usage: Option<Usage>,
}

impl LLMResponse {
    /// A plain text response.
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            tool_calls: vec![],
            usage: None,
        }
    }

    /// A response requesting tool calls, with optional accompanying text.
    ///
    /// # Example
    /// ```
    /// use relayclaw::providers::{LLMResponse, LLMToolCall};
    ///
    /// let call = LLMToolCall::new("call_1", "read_file", r#"{"path": "a.txt"}"#);
    /// let response = LLMResponse::with_tools("Reading...", vec![call]);
    /// assert!(response.has_tool_calls());
    /// ```
    pub fn with_tools(content: &str, tool_calls: Vec<LLMToolCall>) -> Self {
        Self {
            content: content.to_string(),
            tool_calls,
            usage: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// A tool call as emitted by the model.
///
/// Arguments stay a JSON string here, at the wire edge; the registry parses
/// and validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

impl LLMToolCall {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Shared, replaceable handle to the current provider.
///
/// Everything that calls the model holds a clone, so replacing the provider
/// takes effect for the engine and delegated loops alike.
#[derive(Clone, Default)]
pub struct ProviderSlot(Arc<RwLock<Option<Arc<dyn LLMProvider>>>>);

impl ProviderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(provider: Arc<dyn LLMProvider>) -> Self {
        Self(Arc::new(RwLock::new(Some(provider))))
    }

    pub async fn set(&self, provider: Arc<dyn LLMProvider>) {
        *self.0.write().await = Some(provider);
    }

    /// The current provider. The lock is released before the caller uses it.
    pub async fn get(&self) -> Result<Arc<dyn LLMProvider>> {
        self.0
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| RelayError::Provider("No provider configured".into()))
    }

    pub async fn is_set(&self) -> bool {
        self.0.read().await.is_some()
    }
}
