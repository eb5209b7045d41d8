//! RelayClaw - conversation engine for a multi-channel AI agent gateway
//!
//! Channel adapters publish [`InboundMessage`]s onto the [`MessageBus`]; the
//! [`AgentLoop`] turns each one into a model conversation with tools,
//! persists it, and publishes an [`OutboundMessage`] back for delivery.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relayclaw::{AgentLoop, Config, MessageBus};
//! use relayclaw::channels::ChannelManager;
//! use relayclaw::session::SessionManager;
//! use relayclaw::state::StateStore;
//!
//! let config = Config::load()?;
//! relayclaw::utils::logging::init_logging(&config.logging)?;
//!
//! let bus = Arc::new(MessageBus::from_config(&config.bus));
//! let (writer, _reader) = StateStore::open(Config::state_path()).await?;
//! let agent = Arc::new(
//!     AgentLoop::new(config, SessionManager::new()?, Arc::clone(&bus)).with_state(writer),
//! );
//! agent.set_provider(provider).await;
//! agent.register_builtin_tools().await?;
//!
//! let channels = ChannelManager::new(Arc::clone(&bus));
//! channels.start_all().await?;
//! agent.start().await?;
//! ```

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod providers;
pub mod security;
pub mod session;
pub mod skills;
pub mod state;
pub mod tools;
pub mod utils;

pub use agent::AgentLoop;
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use error::{RelayError, Result};
pub use tools::{Tool, ToolRegistry, ToolResult};
