//! Heartbeat poller
//!
//! Periodically turns the workspace `HEARTBEAT.md` into a history-free
//! message for the conversation that was active last.

mod service;

pub use service::{
    is_empty, is_heartbeat_ok, HeartbeatResult, HeartbeatService, HEARTBEAT_OK, HEARTBEAT_SENDER,
};
