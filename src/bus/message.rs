//! Message types carried by the RelayClaw bus
//!
//! Channel adapters and pollers produce [`InboundMessage`]s; only the
//! conversation engine produces [`OutboundMessage`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Channel identifiers reserved for traffic that never leaves the process.
///
/// Messages on these channels are never recorded as the last active user
/// channel and are never delivered outward.
pub const INTERNAL_CHANNELS: &[&str] = &["cli", "system", "subagent"];

/// Channel used for delegated-task completions re-entering the bus.
pub const SYSTEM_CHANNEL: &str = "system";

/// Returns `true` if `channel` is one of [`INTERNAL_CHANNELS`].
pub fn is_internal_channel(channel: &str) -> bool {
    INTERNAL_CHANNELS.contains(&channel)
}

/// A message arriving from a channel adapter or a poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Source channel (e.g. "telegram", "system")
    pub channel: String,
    /// Sender identifier within the channel
    pub sender_id: String,
    /// Chat or thread identifier within the channel
    pub chat_id: String,
    /// Text content
    pub content: String,
    /// Optional media reference
    pub media: Option<MediaAttachment>,
    /// Conversation key, always "channel:chat_id"
    pub session_key: String,
    /// Free-form metadata (e.g. `no_history`, `task_id`)
    pub metadata: HashMap<String, String>,
    /// When the message was created by its producer
    pub received_at: DateTime<Utc>,
}

/// A reply produced by the conversation engine for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Message id in the channel this replies to, if any
    pub reply_to: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Reference to media attached to an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub media_type: MediaType,
    /// Remote location, if hosted
    pub url: Option<String>,
    /// Local copy, if the adapter already downloaded it
    pub data: Option<Vec<u8>>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Audio,
    Video,
    Document,
}

impl InboundMessage {
    /// Creates an inbound message stamped with the current time.
    ///
    /// # Example
    /// ```
    /// use relayclaw::bus::message::InboundMessage;
    ///
    /// let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello, bot!");
    /// assert_eq!(msg.session_key, "telegram:chat456");
    /// ```
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: None,
            session_key: format!("{}:{}", channel, chat_id),
            metadata: HashMap::new(),
            received_at: Utc::now(),
        }
    }

    /// Builds the `system` message that reports a delegated task back to the
    /// conversation identified by `origin_key`.
    pub fn system_completion(origin_key: &str, sender_id: &str, content: &str) -> Self {
        Self::new(SYSTEM_CHANNEL, sender_id, origin_key, content)
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media = Some(media);
        self
    }

    /// Adds a metadata entry (builder pattern).
    ///
    /// # Example
    /// ```
    /// use relayclaw::bus::message::InboundMessage;
    ///
    /// let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello")
    ///     .with_metadata("no_history", "true");
    /// assert_eq!(msg.metadata.get("no_history"), Some(&"true".to_string()));
    /// ```
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    /// Whether this message arrived on an internal channel.
    pub fn is_internal(&self) -> bool {
        is_internal_channel(&self.channel)
    }

    /// Whether the producer asked for history and summary to be skipped.
    pub fn skips_history(&self) -> bool {
        self.metadata
            .get("no_history")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

impl OutboundMessage {
    /// # Example
    /// ```
    /// use relayclaw::bus::message::OutboundMessage;
    ///
    /// let msg = OutboundMessage::new("telegram", "chat456", "Hello from the bot!");
    /// assert_eq!(msg.channel, "telegram");
    /// ```
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_reply(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Creates a reply addressed to the chat an inbound message came from.
    ///
    /// Carries over the inbound `message_id` metadata as `reply_to` when present.
    pub fn reply_to(msg: &InboundMessage, content: &str) -> Self {
        let out = Self::new(&msg.channel, &msg.chat_id, content);
        match msg.metadata.get("message_id") {
            Some(id) => out.with_reply(id),
            None => out,
        }
    }

    /// Whether this message is addressed to an internal channel.
    pub fn is_internal(&self) -> bool {
        is_internal_channel(&self.channel)
    }
}

impl MediaAttachment {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            media_type,
            url: None,
            data: None,
            filename: None,
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }
}
