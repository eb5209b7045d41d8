//! Session module - conversation state and its persistence
//!
//! [`SessionManager`] keeps an in-memory cache in front of one JSON file per
//! conversation key. Files are replaced atomically (temp file, fsync, rename),
//! so a crash mid-save never leaves a truncated session behind.
//!
//! # Example
//!
//! ```
//! use relayclaw::session::{SessionManager, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SessionManager::new_memory();
//!
//!     let mut session = manager.get_or_create("telegram:chat123").await.unwrap();
//!     session.add_message(Message::user("Hello!"));
//!     session.add_message(Message::assistant("Hi there!"));
//!
//!     manager.save(&session).await.unwrap();
//! }
//! ```

pub mod types;

pub use types::{Message, Role, Session, ToolCall};

use crate::config::Config;
use crate::error::Result;
use crate::utils::fs::atomic_write_async;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Session store with an in-memory cache and optional file persistence.
///
/// Clones share the same cache.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    storage_path: Option<PathBuf>,
}

impl SessionManager {
    /// Create a manager persisting to `~/.relayclaw/sessions/`.
    pub fn new() -> Result<Self> {
        Self::with_path(Config::sessions_dir())
    }

    /// Create an in-memory manager without persistence.
    pub fn new_memory() -> Self {
        Self::default()
    }

    /// Create a manager persisting to `path`, creating the directory.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(path),
        })
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        self.storage_path
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", sanitize_key(key))))
    }

    async fn load_from_disk(&self, key: &str) -> Result<Option<Session>> {
        let Some(file_path) = self.file_path(key) else {
            return Ok(None);
        };
        if !file_path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&file_path).await?;
        let session: Session = serde_json::from_str(&content)?;
        self.sessions
            .write()
            .await
            .insert(key.to_string(), session.clone());
        Ok(Some(session))
    }

    /// Get an existing session (cache, then disk) or create an empty one.
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        if let Some(session) = self.get(key).await? {
            return Ok(session);
        }
        let session = Session::new(key);
        self.sessions
            .write()
            .await
            .insert(key.to_string(), session.clone());
        Ok(session)
    }

    /// Get a session without creating it.
    pub async fn get(&self, key: &str) -> Result<Option<Session>> {
        if let Some(session) = self.sessions.read().await.get(key) {
            return Ok(Some(session.clone()));
        }
        self.load_from_disk(key).await
    }

    /// Save a session to the cache, then to disk if persistence is enabled.
    ///
    /// The cache is updated first, so the in-memory turn survives a failed
    /// disk write and a later save can retry it.
    pub async fn save(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.key.clone(), session.clone());

        if let Some(file_path) = self.file_path(&session.key) {
            let content = serde_json::to_vec_pretty(session)?;
            atomic_write_async(&file_path, content).await?;
            debug!(session = %session.key, messages = session.messages.len(), "Session persisted");
        }

        Ok(())
    }

    /// Delete a session from memory and disk.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.sessions.write().await.remove(key);

        if let Some(file_path) = self.file_path(key) {
            if file_path.exists() {
                tokio::fs::remove_file(&file_path).await?;
            }
        }

        Ok(())
    }

    /// List all session keys from memory and disk, sorted and deduplicated.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();

        if let Some(ref storage_path) = self.storage_path {
            let mut entries = tokio::fs::read_dir(storage_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                if let Some(stem) = name.strip_suffix(".json") {
                    keys.push(unsanitize_key(stem));
                }
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub async fn exists(&self, key: &str) -> bool {
        if self.sessions.read().await.contains_key(key) {
            return true;
        }
        self.file_path(key).is_some_and(|p| p.exists())
    }

    /// Drop the in-memory cache; persisted sessions stay on disk.
    pub async fn clear_cache(&self) {
        self.sessions.write().await.clear();
    }

    pub async fn cache_size(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Percent-encode characters that are unsafe in filenames.
///
/// `%` is encoded too, so the mapping is reversible by [`unsanitize_key`].
fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len() * 3);
    for c in key.chars() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '%' => {
                result.push_str(&format!("%{:02X}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

fn unsanitize_key(sanitized: &str) -> String {
    let mut result = String::with_capacity(sanitized.len());
    let mut chars = sanitized.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        match u8::from_str_radix(&hex, 16) {
            Ok(byte) if hex.len() == 2 => result.push(byte as char),
            _ => {
                result.push('%');
                result.push_str(&hex);
            }
        }
    }
    result
}
