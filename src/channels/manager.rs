//! Channel manager
//!
//! Owns the registered channels, admits their inbound messages onto the bus
//! and runs the outbound dispatcher that delivers replies back to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{is_internal_channel, InboundMessage, MessageBus, OutboundMessage};
use crate::error::{RelayError, Result};

use super::Channel;

type ChannelMap = Arc<RwLock<HashMap<String, Box<dyn Channel>>>>;

/// Manages the lifecycle of all channels and routes outbound messages.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use relayclaw::bus::MessageBus;
/// use relayclaw::channels::ChannelManager;
///
/// # tokio_test::block_on(async {
/// let manager = ChannelManager::new(Arc::new(MessageBus::new()));
/// assert!(manager.channels().await.is_empty());
/// # })
/// ```
pub struct ChannelManager {
    channels: ChannelMap,
    bus: Arc<MessageBus>,
    shutdown: std::sync::Mutex<CancellationToken>,
    dispatcher: RwLock<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            bus,
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            dispatcher: RwLock::new(None),
        }
    }

    /// Register a channel. Internal channel names and duplicates are rejected.
    pub async fn register(&self, channel: Box<dyn Channel>) -> Result<()> {
        let name = channel.name().to_string();
        if is_internal_channel(&name) {
            return Err(RelayError::Config(format!(
                "Channel name '{}' is reserved",
                name
            )));
        }
        let mut channels = self.channels.write().await;
        if channels.contains_key(&name) {
            return Err(RelayError::Config(format!(
                "Channel '{}' already registered",
                name
            )));
        }
        info!(channel = %name, "Registering channel");
        channels.insert(name, channel);
        Ok(())
    }

    pub async fn channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn has_channel(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    /// Enqueue `msg` if its sender passes the channel's allow-list.
    ///
    /// Returns `Ok(false)` when the sender is not allowed.
    pub async fn admit(&self, channel: &str, msg: InboundMessage) -> Result<bool> {
        let allowed = {
            let channels = self.channels.read().await;
            let registered = channels
                .get(channel)
                .ok_or_else(|| RelayError::NotFound(format!("channel '{}'", channel)))?;
            registered.is_allowed(&msg.sender_id)
        };
        if !allowed {
            warn!(channel, sender = %msg.sender_id, "Sender not in allow list");
            return Ok(false);
        }
        self.bus.publish_inbound(msg).await?;
        Ok(true)
    }

    /// Start every channel and the outbound dispatcher.
    ///
    /// Channel start failures are logged and do not stop the others.
    pub async fn start_all(&self) -> Result<()> {
        {
            let dispatcher = self.dispatcher.read().await;
            if dispatcher.as_ref().is_some_and(|h| !h.is_finished()) {
                warn!("Dispatcher already running, skipping start");
                return Ok(());
            }
        }

        {
            let mut channels = self.channels.write().await;
            for (name, channel) in channels.iter_mut() {
                info!(channel = %name, "Starting channel");
                if let Err(e) = channel.start().await {
                    error!(channel = %name, error = %e, "Failed to start channel");
                }
            }
        }

        let cancel = {
            let mut token = self
                .shutdown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let handle = tokio::spawn(dispatch_outbound(
            Arc::clone(&self.bus),
            Arc::clone(&self.channels),
            cancel,
        ));
        *self.dispatcher.write().await = Some(handle);
        Ok(())
    }

    /// Stop the dispatcher, then every channel.
    pub async fn stop_all(&self) -> Result<()> {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();

        if let Some(handle) = self.dispatcher.write().await.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(_) => info!("Dispatcher stopped cleanly"),
                Err(_) => warn!("Dispatcher did not stop within timeout"),
            }
        }

        let mut channels = self.channels.write().await;
        for (name, channel) in channels.iter_mut() {
            info!(channel = %name, "Stopping channel");
            if let Err(e) = channel.stop().await {
                error!(channel = %name, error = %e, "Failed to stop channel");
            }
        }
        Ok(())
    }

    /// Deliver `msg` to its channel directly, bypassing the bus.
    pub async fn send(&self, msg: OutboundMessage) -> Result<()> {
        deliver(&self.channels, msg).await
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }
}

async fn deliver(channels: &ChannelMap, msg: OutboundMessage) -> Result<()> {
    if is_internal_channel(&msg.channel) {
        debug!(channel = %msg.channel, "Dropping outbound message for internal channel");
        return Ok(());
    }
    let channels = channels.read().await;
    match channels.get(&msg.channel) {
        Some(channel) => channel.send(msg).await,
        None => Err(RelayError::NotFound(format!("channel '{}'", msg.channel))),
    }
}

/// Consume outbound messages until cancelled or the queue closes.
async fn dispatch_outbound(bus: Arc<MessageBus>, channels: ChannelMap, cancel: CancellationToken) {
    info!("Outbound dispatcher started");
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = bus.consume_outbound() => msg,
        };
        let Some(msg) = msg else {
            info!("Outbound channel closed");
            break;
        };
        let channel = msg.channel.clone();
        if let Err(e) = deliver(&channels, msg).await {
            error!(channel = %channel, error = %e, "Failed to deliver outbound message");
        }
    }
    info!("Outbound dispatcher stopped");
}
