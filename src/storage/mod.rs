//! Storage layer
//!
//! Backend-agnostic persistence for the three durable tables the toolkit
//! owns: per-user conversation state, per-(user, session) value bags, and
//! the index of sent messages that carry callback URLs. Backends are
//! swappable behind small async traits and selected by configuration:
//! `memory` for tests and single-process development, `sqlite` for
//! durability across restarts.
//!
//! Absence is never an error anywhere in this layer: a missing session is
//! an empty map, a missing state row is `None`. Corrupt stored JSON
//! self-heals by dropping the bad row and reporting absence.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// JSON object payload stored per session and per scratch bag.
pub type JsonMap = Map<String, Value>;

/// Errors for storage operations.
///
/// "Not found" is deliberately absent: lookups return empty values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage task failed: {0}")]
    TaskJoin(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Per-user conversation state: current step label plus the scratch bag
/// accumulated while a multi-step flow is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    /// Current step label; `None` means idle.
    #[serde(default)]
    pub label: Option<String>,
    /// Ephemeral key-value data for the flow in progress.
    #[serde(default)]
    pub scratch: JsonMap,
}

impl UserState {
    /// Create an idle state for a user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            label: None,
            scratch: JsonMap::new(),
        }
    }
}

/// A sent message whose payload carries one or more embedded callback URLs.
///
/// These rows are what endpoint migration revisits: `callback_url` is the
/// first URL found in `payload` at record time and is the cheap skip check
/// for "already points at the new base".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiRecord {
    pub message_id: String,
    pub payload: Value,
    pub rendered_text: String,
    pub callback_url: String,
}

/// Generate a fresh session id for a new conversation instance.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current unix timestamp in milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Durable (user, session) -> value-bag mapping.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session's data. Missing or unreadable rows are an empty map.
    async fn get(&self, user_id: &str, session_id: &str) -> Result<JsonMap, StorageError>;

    /// Upsert a session, fully replacing its stored data.
    async fn set(&self, user_id: &str, session_id: &str, data: JsonMap)
        -> Result<(), StorageError>;

    /// Delete one session. Idempotent.
    async fn clear(&self, user_id: &str, session_id: &str) -> Result<(), StorageError>;

    /// Delete every session for a user.
    async fn clear_all(&self, user_id: &str) -> Result<(), StorageError>;
}

/// Durable per-user conversation state rows.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a user's state row, `None` if absent.
    async fn load(&self, user_id: &str) -> Result<Option<UserState>, StorageError>;

    /// Upsert a user's state row.
    async fn save(&self, state: &UserState) -> Result<(), StorageError>;
}

/// Durable index of messages carrying callback URLs.
#[async_trait]
pub trait UiRecordStore: Send + Sync {
    /// Upsert a record keyed by message id.
    async fn put(&self, record: UiRecord) -> Result<(), StorageError>;

    /// Fetch one record, `None` if absent.
    async fn get(&self, message_id: &str) -> Result<Option<UiRecord>, StorageError>;

    /// Delete one record. Idempotent.
    async fn delete(&self, message_id: &str) -> Result<(), StorageError>;

    /// List every record.
    async fn list(&self) -> Result<Vec<UiRecord>, StorageError>;
}

/// Handles to the three stores of one backend.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionStore>,
    pub state: Arc<dyn StateStore>,
    pub ui_records: Arc<dyn UiRecordStore>,
}

impl Storage {
    /// Open the backend named by the configuration.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::Sqlite => {
                let store = Arc::new(SqliteStorage::open(&config.sqlite_path())?);
                Ok(Self {
                    sessions: store.clone(),
                    state: store.clone(),
                    ui_records: store,
                })
            }
        }
    }

    /// Process-local storage, for tests and development.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStorage::new());
        Self {
            sessions: store.clone(),
            state: store.clone(),
            ui_records: store,
        }
    }
}
