//! Configuration management for RelayClaw
//!
//! Configuration is loaded from `~/.relayclaw/config.json`, then overridden
//! by `RELAYCLAW_*` environment variables (a `.env` file is honoured).

mod types;
pub mod validate;

pub use types::*;

use crate::error::{RelayError, Result};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

/// Global configuration instance
static CONFIG: OnceCell<RwLock<Config>> = OnceCell::new();

/// Read `name` and parse it, ignoring unset or malformed values.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Returns the RelayClaw configuration directory (~/.relayclaw)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relayclaw")
    }

    /// Returns the path to the config file (~/.relayclaw/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply `RELAYCLAW_SECTION_KEY` environment overrides.
    fn apply_env_overrides(&mut self) {
        // Agent defaults
        let agent = &mut self.agents.defaults;
        if let Ok(val) = std::env::var("RELAYCLAW_AGENTS_DEFAULTS_WORKSPACE") {
            agent.workspace = val;
        }
        if let Ok(val) = std::env::var("RELAYCLAW_AGENTS_DEFAULTS_MODEL") {
            agent.model = val;
        }
        if let Some(v) = env_parse("RELAYCLAW_AGENTS_DEFAULTS_MAX_TOKENS") {
            agent.max_tokens = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_AGENTS_DEFAULTS_TEMPERATURE") {
            agent.temperature = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_AGENTS_DEFAULTS_MAX_TOOL_ITERATIONS") {
            agent.max_tool_iterations = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_AGENTS_DEFAULTS_AGENT_TIMEOUT_SECS") {
            agent.agent_timeout_secs = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_AGENTS_DEFAULTS_CONTEXT_WINDOW") {
            agent.context_window = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_AGENTS_DEFAULTS_WORKERS") {
            agent.workers = v;
        }

        // Bus
        if let Some(v) = env_parse("RELAYCLAW_BUS_INBOUND_CAPACITY") {
            self.bus.inbound_capacity = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_BUS_OUTBOUND_CAPACITY") {
            self.bus.outbound_capacity = v;
        }
        if let Ok(val) = std::env::var("RELAYCLAW_BUS_INBOUND_OVERFLOW") {
            if let Ok(policy) = serde_json::from_value(serde_json::Value::String(val)) {
                self.bus.inbound_overflow = policy;
            }
        }
        if let Ok(val) = std::env::var("RELAYCLAW_BUS_OUTBOUND_OVERFLOW") {
            if let Ok(policy) = serde_json::from_value(serde_json::Value::String(val)) {
                self.bus.outbound_overflow = policy;
            }
        }

        // Summarization
        if let Some(v) = env_parse("RELAYCLAW_SUMMARIZATION_ENABLED") {
            self.summarization.enabled = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_SUMMARIZATION_MESSAGE_THRESHOLD") {
            self.summarization.message_threshold = v;
        }
        if let Some(v) = env_parse("RELAYCLAW_SUMMARIZATION_TOKEN_RATIO") {
            self.summarization.token_ratio = v;
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::path())
    }

    /// Save configuration to a specific path, replacing it atomically.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        crate::utils::fs::atomic_write(path, content.as_bytes())
    }

    /// Initialize the global configuration from disk.
    ///
    /// Fails if the global config is already set.
    pub fn init() -> Result<()> {
        let config = Self::load()?;
        Self::init_with(config)
    }

    /// Initialize the global configuration with a specific config.
    pub fn init_with(config: Config) -> Result<()> {
        CONFIG
            .set(RwLock::new(config))
            .map_err(|_| RelayError::Config("Configuration already initialized".to_string()))
    }

    /// Get a clone of the current global configuration.
    ///
    /// Returns the defaults if not yet initialized.
    pub fn get() -> Config {
        CONFIG
            .get()
            .and_then(|lock| lock.read().ok())
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Update the global configuration.
    pub fn update<F>(f: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        let lock = CONFIG
            .get()
            .ok_or_else(|| RelayError::Config("Configuration not initialized".to_string()))?;
        let mut guard = lock
            .write()
            .map_err(|_| RelayError::Config("Failed to acquire config write lock".to_string()))?;
        f(&mut guard);
        Ok(())
    }

    /// Returns the expanded workspace path (resolves ~ to home directory)
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.agents.defaults.workspace)
    }

    /// Directory holding one JSON file per session
    pub fn sessions_dir() -> PathBuf {
        Self::dir().join("sessions")
    }

    /// File holding the persisted agent state
    pub fn state_path() -> PathBuf {
        Self::dir().join("state.json")
    }

    /// Workspace skills directory, honouring the override.
    pub fn skills_dir(&self) -> PathBuf {
        match &self.skills.workspace_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_path().join("skills"),
        }
    }

    /// Heartbeat file, honouring the override.
    pub fn heartbeat_path(&self) -> PathBuf {
        match &self.heartbeat.file_path {
            Some(path) => expand_home(path),
            None => self.workspace_path().join("HEARTBEAT.md"),
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
