//! Channel trait and allow-list configuration

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::OutboundMessage;
use crate::error::Result;

/// The `Channel` trait is implemented by every platform adapter the host
/// plugs into the gateway.
///
/// Adapters publish inbound messages through
/// [`ChannelManager::admit`](super::ChannelManager::admit) and receive
/// outbound messages through [`send`](Channel::send).
///
/// # Example Implementation
///
/// ```ignore
/// use async_trait::async_trait;
/// use relayclaw::channels::{Channel, BaseChannelConfig};
/// use relayclaw::bus::OutboundMessage;
/// use relayclaw::error::Result;
///
/// struct MyChannel {
///     config: BaseChannelConfig,
///     running: bool,
/// }
///
/// #[async_trait]
/// impl Channel for MyChannel {
///     fn name(&self) -> &str {
///         &self.config.name
///     }
///
///     async fn start(&mut self) -> Result<()> {
///         self.running = true;
///         Ok(())
///     }
///
///     async fn stop(&mut self) -> Result<()> {
///         self.running = false;
///         Ok(())
///     }
///
///     async fn send(&self, msg: OutboundMessage) -> Result<()> {
///         println!("Sending: {}", msg.content);
///         Ok(())
///     }
///
///     fn is_running(&self) -> bool {
///         self.running
///     }
///
///     fn is_allowed(&self, sender_id: &str) -> bool {
///         self.config.is_allowed(sender_id)
///     }
/// }
/// ```
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique name, matched against `OutboundMessage::channel`.
    fn name(&self) -> &str;

    /// Connect and begin listening.
    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    /// Deliver an outbound message to the platform.
    async fn send(&self, msg: OutboundMessage) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Whether `sender_id` may talk to the agent through this channel.
    fn is_allowed(&self, sender_id: &str) -> bool;
}

/// Configuration shared by all channels.
///
/// # Example
///
/// ```
/// use relayclaw::channels::BaseChannelConfig;
///
/// let config = BaseChannelConfig::with_allow_list("telegram", ["user123", "user456"]);
/// assert!(config.is_allowed("user123"));
/// assert!(!config.is_allowed("user789"));
///
/// let open = BaseChannelConfig::new("slack");
/// assert!(open.is_allowed("anyone"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseChannelConfig {
    pub name: String,
    /// Allowed sender ids. Empty allows everyone.
    pub allow_list: HashSet<String>,
}

impl BaseChannelConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allow_list: HashSet::new(),
        }
    }

    pub fn with_allow_list<I, S>(name: &str, allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            allow_list: allow_list.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(sender_id)
    }
}
