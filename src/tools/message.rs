//! Message tool for proactive outbound messages.
//!
//! Publishes straight to the outbound bus. When the target is the calling
//! conversation, the result records the delivered text so the engine can
//! avoid sending the same content again as the turn's reply.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::bus::{is_internal_channel, MessageBus, OutboundMessage};
use crate::error::{RelayError, Result};

use super::{parse_args, Capability, Tool, ToolCategory, ToolContext, ToolResult};

#[derive(Deserialize)]
struct MessageArgs {
    content: String,
    channel: Option<String>,
    chat_id: Option<String>,
    reply_to: Option<String>,
}

/// Tool for sending outbound messages to channels.
pub struct MessageTool {
    bus: MessageBus,
}

impl MessageTool {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user right away. Defaults to the current conversation; \
         set channel and chat_id to reach a different one."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Message text to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Destination channel. Omit to reply in the current conversation."
                },
                "chat_id": {
                    "type": "string",
                    "description": "Destination chat id. Omit to reply in the current conversation."
                },
                "reply_to": {
                    "type": "string",
                    "description": "Optional message id to reply to"
                }
            },
            "required": ["content"]
        })
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::ChatContext]
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Messaging
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: MessageArgs = parse_args(args)?;
        let content = args.content.trim();
        if content.is_empty() {
            return Err(RelayError::Tool("Message content is empty".to_string()));
        }

        let channel = non_empty(args.channel)
            .or_else(|| ctx.channel.clone())
            .ok_or_else(|| RelayError::Tool("No target channel specified".to_string()))?;
        let chat_id = non_empty(args.chat_id)
            .or_else(|| ctx.chat_id.clone())
            .ok_or_else(|| RelayError::Tool("No target chat_id specified".to_string()))?;

        if is_internal_channel(&channel) {
            return Err(RelayError::Tool(format!(
                "Channel '{}' cannot receive messages",
                channel
            )));
        }

        let mut outbound = OutboundMessage::new(&channel, &chat_id, content);
        if let Some(reply_to) = non_empty(args.reply_to) {
            outbound = outbound.with_reply(&reply_to);
        }
        self.bus.publish_outbound_until(outbound, &ctx.cancel).await?;

        let same_conversation = ctx.channel.as_deref() == Some(channel.as_str())
            && ctx.chat_id.as_deref() == Some(chat_id.as_str());
        let ack = format!("Message sent to {}:{}", channel, chat_id);
        if same_conversation {
            Ok(ToolResult::delivered(ack, content))
        } else {
            Ok(ToolResult::llm_only(ack))
        }
    }
}
