//! Conversation state machine
//!
//! Tracks, per user, the current step of a multi-turn interaction (an
//! opaque label like `"signup:email"`) and a scratch bag of values
//! accumulated while the flow is in progress. The durable [`StateStore`]
//! is the source of truth; a write-through in-memory mirror serves repeat
//! reads within a process. Operations for one user are serialized by a
//! per-user lock so a user is never observed in two states at once;
//! different users never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::storage::{JsonMap, StateStore, StorageError, UserState};

/// Guard label matching.
///
/// An empty guard label matches only the idle state. A non-empty label `g`
/// matches state `s` when `s == g` or `s` starts with `g` immediately
/// followed by `:` — so a guard for `"signup"` admits `"signup:email"` but
/// not `"signup2"` or `"checkout"`. Plain substring containment is
/// deliberately not used.
pub fn label_matches(guard: &str, current: Option<&str>) -> bool {
    match current {
        None => guard.is_empty(),
        Some(state) => {
            !guard.is_empty()
                && (state == guard
                    || (state.len() > guard.len()
                        && state.starts_with(guard)
                        && state.as_bytes()[guard.len()] == b':'))
        }
    }
}

/// Per-user conversation state over a durable store.
pub struct StateMachine {
    store: Arc<dyn StateStore>,
    /// Write-through cache; never the sole copy of a row.
    mirror: RwLock<HashMap<String, UserState>>,
    /// Per-user stripes serializing read-modify-write cycles.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            mirror: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Load a user's row from mirror or store.
    async fn load(&self, user_id: &str) -> Result<UserState, StorageError> {
        if let Some(state) = self.mirror.read().get(user_id) {
            return Ok(state.clone());
        }
        let state = self
            .store
            .load(user_id)
            .await?
            .unwrap_or_else(|| UserState::new(user_id));
        self.mirror
            .write()
            .insert(user_id.to_string(), state.clone());
        Ok(state)
    }

    /// Persist a row, store first, then mirror.
    async fn persist(&self, state: UserState) -> Result<(), StorageError> {
        self.store.save(&state).await?;
        self.mirror.write().insert(state.user_id.clone(), state);
        Ok(())
    }

    /// Replace the user's state label. The scratch bag is untouched.
    pub async fn set_state(
        &self,
        user_id: &str,
        label: Option<&str>,
    ) -> Result<(), StorageError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut state = self.load(user_id).await?;
        state.label = label.map(str::to_string);
        self.persist(state).await
    }

    /// Current state label, `None` when idle or unknown.
    pub async fn get_state(&self, user_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load(user_id).await?.label)
    }

    /// Mark the user's flow finished (idle).
    pub async fn finish(&self, user_id: &str) -> Result<(), StorageError> {
        self.set_state(user_id, None).await
    }

    /// Shallow-merge keys into the scratch bag, last writer wins per key.
    pub async fn merge_scratch(
        &self,
        user_id: &str,
        values: JsonMap,
    ) -> Result<(), StorageError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut state = self.load(user_id).await?;
        for (key, value) in values {
            state.scratch.insert(key, value);
        }
        self.persist(state).await
    }

    /// Set one scratch key.
    pub async fn set_value(
        &self,
        user_id: &str,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), StorageError> {
        let mut values = JsonMap::new();
        values.insert(key.into(), value);
        self.merge_scratch(user_id, values).await
    }

    /// The scratch bag; empty when none has been written.
    pub async fn get_scratch(&self, user_id: &str) -> Result<JsonMap, StorageError> {
        Ok(self.load(user_id).await?.scratch)
    }

    /// Drop the scratch bag. The state label is untouched; clearing an
    /// already-empty bag is a no-op.
    pub async fn clear_scratch(&self, user_id: &str) -> Result<(), StorageError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut state = self.load(user_id).await?;
        if state.scratch.is_empty() {
            return Ok(());
        }
        state.scratch = JsonMap::new();
        self.persist(state).await
    }
}
