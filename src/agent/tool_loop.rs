//! The shared tool-call iteration loop.
//!
//! `ToolLoop` drives one conversation turn: call the model, run the tools it
//! asks for, feed the results back, repeat until the model answers without
//! tool calls or the iteration limit is reached. The top-level engine and
//! delegated subagents use the same loop with different registries.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::bus::{is_internal_channel, MessageBus, OutboundMessage};
use crate::error::{RelayError, Result};
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, ToolCall};
use crate::tools::{DispatchContext, ToolRegistry, ToolResult};

/// Content returned when the limit is hit before the model produced any text.
pub const ITERATION_LIMIT_NOTICE: &str =
    "I stopped after reaching the maximum number of tool iterations for this turn.";

/// Tool result recorded for calls abandoned by cancellation.
const CANCELLED_RESULT: &str = "Tool call cancelled before completion.";

/// How a loop run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// The model answered without requesting tools.
    Done,
    /// The model still wanted tools after the last allowed round.
    IterationLimitReached,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Done => write!(f, "done"),
            Terminal::IterationLimitReached => write!(f, "iteration limit reached"),
        }
    }
}

/// Result of one loop run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Final answer, or the best partial text at the iteration limit.
    pub content: String,
    pub terminal: Terminal,
    /// Tool rounds executed.
    pub iterations: u32,
    /// Content tools delivered to the user directly during the run.
    pub delivered: Vec<String>,
}

/// Where user-visible tool output is published while the loop runs.
#[derive(Clone)]
pub struct UserRoute {
    bus: MessageBus,
    channel: String,
    chat_id: String,
}

impl UserRoute {
    pub fn new(bus: MessageBus, channel: &str, chat_id: &str) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
        }
    }
}

/// Per-run inputs besides the messages.
#[derive(Clone, Default)]
pub struct LoopContext {
    /// Context handed to the registry for every call. Its cancellation
    /// token also cancels the loop.
    pub dispatch: DispatchContext,
    pub user_route: Option<UserRoute>,
}

impl LoopContext {
    pub fn new(dispatch: DispatchContext) -> Self {
        Self {
            dispatch,
            user_route: None,
        }
    }

    pub fn with_user_route(mut self, route: UserRoute) -> Self {
        self.user_route = Some(route);
        self
    }
}

/// Iterate-call-tools-until-done state machine.
///
/// # Example
///
/// ```rust,ignore
/// let tool_loop = ToolLoop::new(provider, Arc::new(registry), 20)
///     .with_model("claude-sonnet-4-5-20250929")
///     .with_options(ChatOptions::new().with_max_tokens(4096));
///
/// let mut turn = vec![Message::user("What is in notes.md?")];
/// let outcome = tool_loop.run(&[Message::system(prompt)], &mut turn, &ctx).await?;
/// ```
pub struct ToolLoop {
    provider: Arc<dyn LLMProvider>,
    tools: Arc<ToolRegistry>,
    model: Option<String>,
    options: ChatOptions,
    max_iterations: u32,
}

impl ToolLoop {
    pub fn new(provider: Arc<dyn LLMProvider>, tools: Arc<ToolRegistry>, max_iterations: u32) -> Self {
        Self {
            provider,
            tools,
            model: None,
            options: ChatOptions::new(),
            max_iterations,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run the loop.
    ///
    /// `base` is sent with every model call but never modified. Every message
    /// the run produces (assistant replies, tool-call requests, tool results)
    /// is appended to `turn`, so on error `turn` still holds a well-formed
    /// prefix: each tool-call message is followed by one result per call.
    ///
    /// # Errors
    /// Model-call failures are propagated. Cancellation of
    /// `ctx.dispatch.cancel` yields [`RelayError::Cancelled`].
    pub async fn run(
        &self,
        base: &[Message],
        turn: &mut Vec<Message>,
        ctx: &LoopContext,
    ) -> Result<LoopOutcome> {
        let cancel = &ctx.dispatch.cancel;
        let schemas = self.tools.schemas();
        let mut iterations = 0u32;
        let mut best_partial: Option<String> = None;
        let mut delivered = Vec::new();

        loop {
            let mut messages = Vec::with_capacity(base.len() + turn.len());
            messages.extend_from_slice(base);
            messages.extend(turn.iter().cloned());

            debug!(state = "awaiting_model", iteration = iterations, messages = messages.len());
            let started = Instant::now();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RelayError::Cancelled("turn cancelled while awaiting the model".to_string()));
                }
                res = self.provider.chat(messages, schemas.clone(), self.model.as_deref(), self.options.clone()) => res?,
            };
            debug!(
                latency_ms = started.elapsed().as_millis() as u64,
                tool_calls = response.tool_calls.len(),
                "Model responded"
            );

            if !response.has_tool_calls() {
                turn.push(Message::assistant(&response.content));
                debug!(state = "done", iterations);
                return Ok(LoopOutcome {
                    content: response.content,
                    terminal: Terminal::Done,
                    iterations,
                    delivered,
                });
            }

            if !response.content.trim().is_empty() {
                best_partial = Some(response.content.clone());
            }

            if iterations >= self.max_iterations {
                warn!(
                    max_iterations = self.max_iterations,
                    pending_calls = response.tool_calls.len(),
                    "Tool iteration limit reached"
                );
                let content = best_partial.unwrap_or_else(|| ITERATION_LIMIT_NOTICE.to_string());
                turn.push(Message::assistant(&content));
                return Ok(LoopOutcome {
                    content,
                    terminal: Terminal::IterationLimitReached,
                    iterations,
                    delivered,
                });
            }
            iterations += 1;

            let calls: Vec<ToolCall> = response.tool_calls.iter().map(ToolCall::from).collect();
            turn.push(Message::assistant_with_tools(&response.content, calls.clone()));
            debug!(state = "executing_tools", iteration = iterations, calls = calls.len());

            for (idx, call) in calls.iter().enumerate() {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.tools.dispatch(call, &ctx.dispatch) => Some(result),
                };
                let Some(result) = result else {
                    abandon(&calls[idx..], turn);
                    return Err(RelayError::Cancelled(
                        "turn cancelled while executing tools".to_string(),
                    ));
                };

                debug!(tool = %call.name, id = %call.id, "Tool result recorded");
                turn.push(Message::tool_result(&call.id, &result.for_llm));
                self.publish_user_content(&result, ctx).await;
                if let Some(content) = result.delivered {
                    delivered.push(content);
                }
            }
        }
    }

    async fn publish_user_content(&self, result: &ToolResult, ctx: &LoopContext) {
        let (Some(route), Some(text)) = (&ctx.user_route, result.user_content()) else {
            return;
        };
        if is_internal_channel(&route.channel) {
            return;
        }
        let msg = OutboundMessage::new(&route.channel, &route.chat_id, text);
        if let Err(e) = route
            .bus
            .publish_outbound_until(msg, &ctx.dispatch.cancel)
            .await
        {
            warn!(channel = %route.channel, error = %e, "Failed to publish tool output");
        }
    }
}

/// Record a cancelled result for each call that did not finish.
fn abandon(calls: &[ToolCall], turn: &mut Vec<Message>) {
    for call in calls {
        warn!(tool = %call.name, id = %call.id, "Tool call abandoned");
        turn.push(Message::tool_result(&call.id, CANCELLED_RESULT));
    }
}
