//! Process-wide agent state
//!
//! Holds the last active user (channel, chat) pair so pollers know where to
//! send unsolicited notifications. Access is split by handle:
//! [`StateWriter`] is owned by the conversation engine and is deliberately
//! not `Clone`; [`StateReader`] is cheap to clone and handed to pollers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::bus::is_internal_channel;
use crate::error::Result;
use crate::utils::fs::atomic_write_async;

/// The persisted state record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub last_channel: Option<String>,
    pub last_chat_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AgentState {
    /// The last active (channel, chat) pair, if both are known.
    pub fn last_active(&self) -> Option<(String, String)> {
        match (&self.last_channel, &self.last_chat_id) {
            (Some(channel), Some(chat)) => Some((channel.clone(), chat.clone())),
            _ => None,
        }
    }
}

struct Shared {
    state: RwLock<AgentState>,
    path: Option<PathBuf>,
}

/// Opens the state file and hands out the writer/reader pair.
pub struct StateStore;

impl StateStore {
    /// Load state from `path` (missing or unreadable files start empty).
    pub async fn open(path: impl AsRef<Path>) -> Result<(StateWriter, StateReader)> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt state file");
                AgentState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::split(state, Some(path)))
    }

    /// A store that never touches disk.
    pub fn in_memory() -> (StateWriter, StateReader) {
        Self::split(AgentState::default(), None)
    }

    fn split(state: AgentState, path: Option<PathBuf>) -> (StateWriter, StateReader) {
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            path,
        });
        (
            StateWriter {
                shared: Arc::clone(&shared),
            },
            StateReader { shared },
        )
    }
}

/// Single writer of [`AgentState`].
pub struct StateWriter {
    shared: Arc<Shared>,
}

impl StateWriter {
    /// Record a user-facing message as the last activity and persist it.
    ///
    /// Internal channels are ignored; returns whether the state changed.
    pub async fn record_activity(&self, channel: &str, chat_id: &str) -> Result<bool> {
        if is_internal_channel(channel) {
            return Ok(false);
        }

        let snapshot = {
            let mut state = self.shared.state.write().await;
            state.last_channel = Some(channel.to_string());
            state.last_chat_id = Some(chat_id.to_string());
            state.updated_at = Some(Utc::now());
            state.clone()
        };

        if let Some(ref path) = self.shared.path {
            atomic_write_async(path, serde_json::to_vec_pretty(&snapshot)?).await?;
            debug!(channel, chat_id, "Agent state persisted");
        }
        Ok(true)
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only handle to [`AgentState`].
#[derive(Clone)]
pub struct StateReader {
    shared: Arc<Shared>,
}

impl StateReader {
    pub async fn snapshot(&self) -> AgentState {
        self.shared.state.read().await.clone()
    }

    pub async fn last_active(&self) -> Option<(String, String)> {
        self.shared.state.read().await.last_active()
    }
}
