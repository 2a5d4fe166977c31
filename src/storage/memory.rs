//! In-memory storage backend
//!
//! Process-local implementation of the three stores. Not durable across
//! restarts; intended for tests and single-process development runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{JsonMap, SessionStore, StateStore, StorageError, UiRecord, UiRecordStore, UserState};

/// All three stores over guarded hash maps.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: RwLock<HashMap<(String, String), JsonMap>>,
    state: RwLock<HashMap<String, UserState>>,
    ui_records: RwLock<HashMap<String, UiRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn get(&self, user_id: &str, session_id: &str) -> Result<JsonMap, StorageError> {
        let sessions = self.sessions.read();
        Ok(sessions
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn set(
        &self,
        user_id: &str,
        session_id: &str,
        data: JsonMap,
    ) -> Result<(), StorageError> {
        self.sessions
            .write()
            .insert((user_id.to_string(), session_id.to_string()), data);
        Ok(())
    }

    async fn clear(&self, user_id: &str, session_id: &str) -> Result<(), StorageError> {
        self.sessions
            .write()
            .remove(&(user_id.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn clear_all(&self, user_id: &str) -> Result<(), StorageError> {
        self.sessions.write().retain(|(uid, _), _| uid != user_id);
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStorage {
    async fn load(&self, user_id: &str) -> Result<Option<UserState>, StorageError> {
        Ok(self.state.read().get(user_id).cloned())
    }

    async fn save(&self, state: &UserState) -> Result<(), StorageError> {
        self.state
            .write()
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }
}

#[async_trait]
impl UiRecordStore for MemoryStorage {
    async fn put(&self, record: UiRecord) -> Result<(), StorageError> {
        self.ui_records
            .write()
            .insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<UiRecord>, StorageError> {
        Ok(self.ui_records.read().get(message_id).cloned())
    }

    async fn delete(&self, message_id: &str) -> Result<(), StorageError> {
        self.ui_records.write().remove(message_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<UiRecord>, StorageError> {
        Ok(self.ui_records.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_round_trip() {
        let storage = MemoryStorage::new();
        assert!(StateStore::load(&storage, "u1").await.unwrap().is_none());

        let mut state = UserState::new("u1");
        state.label = Some("signup:email".into());
        storage.save(&state).await.unwrap();

        let loaded = StateStore::load(&storage, "u1").await.unwrap().unwrap();
        assert_eq!(loaded.label.as_deref(), Some("signup:email"));
        assert!(loaded.scratch.is_empty());
    }

    #[tokio::test]
    async fn test_ui_record_put_is_upsert() {
        let storage = MemoryStorage::new();
        let record = UiRecord {
            message_id: "m1".into(),
            payload: json!({"url": "https://old.example.com/x"}),
            rendered_text: "pick one".into(),
            callback_url: "https://old.example.com/x".into(),
        };
        storage.put(record.clone()).await.unwrap();

        let updated = UiRecord {
            callback_url: "https://new.example.com/x".into(),
            ..record
        };
        storage.put(updated).await.unwrap();

        let fetched = UiRecordStore::get(&storage, "m1").await.unwrap().unwrap();
        assert_eq!(fetched.callback_url, "https://new.example.com/x");
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }
}
