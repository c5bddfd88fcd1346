//! Session module - Conversation state and history persistence
//!
//! This module provides the conversation model shared by every agent:
//! - [`Message`], [`Role`], [`ToolCall`] and [`SystemEvent`] envelopes
//! - The in-memory, append-only [`Conversation`] owned by one run loop
//! - [`HistoryStore`], file-based persistence of a conversation across restarts
//!
//! # Example
//!
//! ```
//! use tachikoma::session::{Conversation, HistoryStore, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dir = tempfile::tempdir().unwrap();
//!     let store = HistoryStore::with_path(dir.path().to_path_buf()).unwrap();
//!
//!     let mut conversation = Conversation::new();
//!     conversation.push(Message::user("bob", "Hello!"));
//!     store.save("agent-a", &conversation).await.unwrap();
//!
//!     let loaded = store.load("agent-a", 100).await.unwrap();
//!     assert_eq!(loaded.len(), 1);
//! }
//! ```

pub mod types;

pub use types::{generate_id, Action, Conversation, Message, Role, SystemEvent, ToolCall};

use crate::config::Config;
use crate::error::Result;
use std::path::PathBuf;
use tracing::debug;

/// File-based store for agent conversation logs.
///
/// Each agent's log lives in `<dir>/<speaker>.json` as a JSON array of
/// messages. The store never holds a log in memory: the run loop owns the
/// live [`Conversation`] and hands snapshots here to persist.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    storage_path: PathBuf,
}

impl HistoryStore {
    /// Create a store under `~/.tachikoma/history/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_path(Config::dir().join("history"))
    }

    /// Create a store rooted at a custom directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { storage_path: path })
    }

    /// Load a conversation, keeping the `limit` most recent messages.
    ///
    /// A missing file yields an empty conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(&self, key: &str, limit: usize) -> Result<Conversation> {
        let file_path = self.file_path(key);
        if !file_path.exists() {
            return Ok(Conversation::new());
        }
        let content = tokio::fs::read_to_string(&file_path).await?;
        let messages: Vec<Message> = serde_json::from_str(&content)?;
        debug!(key = %key, count = messages.len(), "Loaded history");
        Ok(Conversation::from_history(messages, limit))
    }

    /// Persist a conversation, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to disk fails.
    pub async fn save(&self, key: &str, conversation: &Conversation) -> Result<()> {
        let content = serde_json::to_string_pretty(conversation)?;
        tokio::fs::write(self.file_path(key), content).await?;
        Ok(())
    }

    /// Remove a stored conversation. Clearing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if deleting from disk fails.
    pub async fn clear(&self, key: &str) -> Result<()> {
        let file_path = self.file_path(key);
        if file_path.exists() {
            tokio::fs::remove_file(&file_path).await?;
        }
        Ok(())
    }

    /// Check whether a conversation has been stored for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.json", Self::sanitize_key(key)))
    }

    /// Replace characters that are invalid in filenames with underscores.
    fn sanitize_key(key: &str) -> String {
        key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
    }
}
