//! Channels module - the platform side of the gateway
//!
//! Concrete adapters (Telegram, Slack, ...) live in the host; this module
//! defines the [`Channel`] contract they implement and the
//! [`ChannelManager`] that admits their inbound messages and delivers
//! outbound replies.
//!
//! ```text
//! ┌──────────┐ admit  ┌────────────┐ inbound  ┌───────────┐
//! │ Channel  │──────> │  Channel   │────────> │           │
//! │ adapters │        │  Manager   │          │MessageBus │
//! │          │ <──────│(dispatcher)│ <────────│           │
//! └──────────┘  send  └────────────┘ outbound └───────────┘
//! ```

mod manager;
mod types;

pub use manager::ChannelManager;
pub use types::{BaseChannelConfig, Channel};
