//! Message Bus Module
//!
//! Bounded, ordered inbound/outbound queues that decouple channel adapters
//! and pollers from the conversation engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Channel /  │────>│  MessageBus │────>│ Conversation │
//! │   Poller    │     │  (inbound)  │     │    Engine    │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                            │
//!                            │ outbound
//!                            ▼
//! ┌─────────────┐     ┌─────────────┐
//! │   Channel   │<────│  MessageBus │
//! │   Manager   │     │  (outbound) │
//! └─────────────┘     └─────────────┘
//! ```
//!
//! Each direction is a single FIFO queue with one consumer group. Messages
//! from one producer are delivered in submission order. When a queue is full
//! the configured [`OverflowPolicy`] decides between waiting for capacity and
//! rejecting with [`RelayError::QueueFull`]; nothing is dropped silently.
//!
//! # Example
//!
//! ```
//! use relayclaw::bus::{MessageBus, InboundMessage};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = MessageBus::new();
//!
//!     let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello");
//!     bus.publish_inbound(msg).await.unwrap();
//!
//!     if let Some(received) = bus.consume_inbound().await {
//!         assert_eq!(received.content, "Hello");
//!     }
//! }
//! ```

pub mod message;

pub use message::{
    is_internal_channel, InboundMessage, MediaAttachment, MediaType, OutboundMessage,
    INTERNAL_CHANNELS, SYSTEM_CHANNEL,
};

use crate::config::BusConfig;
use crate::error::{RelayError, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default capacity for each direction
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// What `publish_*` does when the target queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot.
    #[default]
    Block,
    /// Fail immediately with `RelayError::QueueFull`.
    Reject,
}

/// One bounded queue plus its overflow policy.
struct Lane<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    policy: OverflowPolicy,
}

impl<T: Send + 'static> Lane<T> {
    fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            policy,
        }
    }

    async fn publish(&self, msg: T) -> Result<()> {
        match self.policy {
            OverflowPolicy::Block => self.tx.send(msg).await.map_err(|_| RelayError::BusClosed),
            OverflowPolicy::Reject => self.try_publish(msg),
        }
    }

    fn try_publish(&self, msg: T) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::QueueFull(self.name.to_string()),
            mpsc::error::TrySendError::Closed(_) => RelayError::BusClosed,
        })
    }

    async fn publish_until(&self, msg: T, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled(format!("{} publish", self.name))),
            res = self.publish(msg) => res,
        }
    }

    async fn consume(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    fn subscribe(&self) -> impl Stream<Item = T> + Send + 'static {
        let rx = Arc::clone(&self.rx);
        futures::stream::unfold(rx, |rx| async move {
            let next = rx.lock().await.recv().await;
            next.map(|msg| (msg, rx))
        })
    }

    fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl<T> Clone for Lane<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            policy: self.policy,
        }
    }
}

/// The central message bus for routing messages between channels and the engine.
///
/// Clones share the same underlying queues.
#[derive(Clone)]
pub struct MessageBus {
    inbound: Lane<InboundMessage>,
    outbound: Lane<OutboundMessage>,
}

impl MessageBus {
    /// Creates a bus with [`DEFAULT_BUFFER_SIZE`] per direction, blocking on overflow.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Creates a bus with the same capacity in both directions, blocking on overflow.
    ///
    /// # Example
    /// ```
    /// use relayclaw::bus::MessageBus;
    ///
    /// let bus = MessageBus::with_buffer_size(500);
    /// assert_eq!(bus.pending_inbound(), 0);
    /// ```
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self::from_config(&BusConfig {
            inbound_capacity: buffer_size,
            outbound_capacity: buffer_size,
            ..Default::default()
        })
    }

    /// Creates a bus with per-direction capacities and overflow policies.
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            inbound: Lane::new("inbound", config.inbound_capacity, config.inbound_overflow),
            outbound: Lane::new(
                "outbound",
                config.outbound_capacity,
                config.outbound_overflow,
            ),
        }
    }

    /// Publishes an inbound message according to the inbound overflow policy.
    ///
    /// # Errors
    /// `BusClosed` if the consumer side is gone, `QueueFull` if the queue is
    /// full and the policy is [`OverflowPolicy::Reject`].
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound.publish(msg).await
    }

    /// Publishes an inbound message, giving up when `cancel` fires first.
    ///
    /// This is how producers get non-blocking semantics on a blocking queue.
    pub async fn publish_inbound_until(
        &self,
        msg: InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inbound.publish_until(msg, cancel).await
    }

    /// Waits for the next inbound message. `None` once the bus is closed.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound.consume().await
    }

    /// Lazy stream over the inbound consumer group.
    ///
    /// Several subscribers share one group: each message is yielded once.
    pub fn subscribe_inbound(&self) -> impl Stream<Item = InboundMessage> + Send + 'static {
        self.inbound.subscribe()
    }

    /// Publishes an outbound message according to the outbound overflow policy.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound.publish(msg).await
    }

    pub async fn publish_outbound_until(
        &self,
        msg: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.outbound.publish_until(msg, cancel).await
    }

    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound.consume().await
    }

    pub fn subscribe_outbound(&self) -> impl Stream<Item = OutboundMessage> + Send + 'static {
        self.outbound.subscribe()
    }

    /// Publishes without waiting, regardless of policy.
    ///
    /// # Errors
    /// `QueueFull("inbound")` when full, `BusClosed` when closed.
    pub fn try_publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound.try_publish(msg)
    }

    pub fn try_publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound.try_publish(msg)
    }

    /// Number of inbound messages waiting to be consumed.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.pending()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.pending()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bus_inbound_flow() {
        let bus = MessageBus::new();
        let msg = InboundMessage::new("telegram", "user123", "chat456", "Hello");

        bus.publish_inbound(msg).await.unwrap();
        let received = bus.consume_inbound().await.unwrap();

        assert_eq!(received.content, "Hello");
        assert_eq!(received.sender_id, "user123");
    }

    #[tokio::test]
    async fn test_bus_outbound_flow() {
        let bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage::new("telegram", "chat456", "Response"))
            .await
            .unwrap();
        let received = bus.consume_outbound().await.unwrap();
        assert_eq!(received.content, "Response");
    }

    #[tokio::test]
    async fn test_bus_fifo_same_producer() {
        let bus = MessageBus::new();
        for i in 0..5 {
            let msg = InboundMessage::new("telegram", "user", "chat", &format!("Message {}", i));
            bus.publish_inbound(msg).await.unwrap();
        }
        for i in 0..5 {
            let received = bus.consume_inbound().await.unwrap();
            assert_eq!(received.content, format!("Message {}", i));
        }
    }

    #[tokio::test]
    async fn test_publish_blocks_when_full() {
        let bus = MessageBus::with_buffer_size(1);
        bus.publish_inbound(InboundMessage::new("t", "u", "c", "first"))
            .await
            .unwrap();

        let producer_bus = bus.clone();
        let producer = tokio::spawn(async move {
            producer_bus
                .publish_inbound(InboundMessage::new("t", "u", "c", "second"))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "publish should wait for capacity");

        assert_eq!(bus.consume_inbound().await.unwrap().content, "first");
        producer.await.unwrap().unwrap();
        assert_eq!(bus.consume_inbound().await.unwrap().content, "second");
    }

    #[tokio::test]
    async fn test_reject_policy_signals_queue_full() {
        let bus = MessageBus::from_config(&BusConfig {
            inbound_capacity: 1,
            inbound_overflow: OverflowPolicy::Reject,
            ..Default::default()
        });
        bus.publish_inbound(InboundMessage::new("t", "u", "c", "1"))
            .await
            .unwrap();
        let result = bus
            .publish_inbound(InboundMessage::new("t", "u", "c", "2"))
            .await;
        assert!(matches!(result, Err(RelayError::QueueFull(ref d)) if d == "inbound"));
        assert_eq!(bus.pending_inbound(), 1);
    }

    #[tokio::test]
    async fn test_policies_are_per_direction() {
        let bus = MessageBus::from_config(&BusConfig {
            inbound_capacity: 1,
            outbound_capacity: 1,
            inbound_overflow: OverflowPolicy::Block,
            outbound_overflow: OverflowPolicy::Reject,
        });
        bus.publish_outbound(OutboundMessage::new("t", "c", "1"))
            .await
            .unwrap();
        let result = bus
            .publish_outbound(OutboundMessage::new("t", "c", "2"))
            .await;
        assert!(matches!(result, Err(RelayError::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_publish_until_cancelled() {
        let bus = MessageBus::with_buffer_size(1);
        bus.publish_inbound(InboundMessage::new("t", "u", "c", "fill"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = bus
            .publish_inbound_until(InboundMessage::new("t", "u", "c", "late"), &cancel)
            .await;
        assert!(matches!(result, Err(RelayError::Cancelled(_))));
        assert_eq!(bus.pending_inbound(), 1);
    }

    #[tokio::test]
    async fn test_try_publish_inbound_full() {
        let bus = MessageBus::with_buffer_size(2);
        bus.try_publish_inbound(InboundMessage::new("t", "u", "c", "1"))
            .unwrap();
        bus.try_publish_inbound(InboundMessage::new("t", "u", "c", "2"))
            .unwrap();
        let result = bus.try_publish_inbound(InboundMessage::new("t", "u", "c", "3"));
        assert!(matches!(result, Err(RelayError::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_subscribe_inbound_yields_in_order() {
        let bus = MessageBus::new();
        for i in 0..3 {
            bus.publish_inbound(InboundMessage::new("t", "u", "c", &i.to_string()))
                .await
                .unwrap();
        }
        let stream = bus.subscribe_inbound();
        let got: Vec<String> = stream.take(3).map(|m| m.content).collect().await;
        assert_eq!(got, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_bus_concurrent_access() {
        let bus = Arc::new(MessageBus::new());
        let producer_bus = Arc::clone(&bus);

        let producer = tokio::spawn(async move {
            for i in 0..10 {
                let msg = InboundMessage::new("test", "user", "chat", &format!("Msg {}", i));
                producer_bus.publish_inbound(msg).await.unwrap();
            }
        });

        let consumer_bus = Arc::clone(&bus);
        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 10 {
                if let Some(msg) = consumer_bus.consume_inbound().await {
                    seen.push(msg.content);
                }
            }
            seen
        });

        producer.await.unwrap();
        let seen = consumer.await.unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("Msg {}", i)).collect();
        assert_eq!(seen, expected);
    }
}
