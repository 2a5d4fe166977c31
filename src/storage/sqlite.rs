//! SQLite storage backend
//!
//! Durable implementation of the three stores over a single database file.
//! The connection is shared behind a mutex and every call runs on the
//! blocking pool, so store calls can be awaited from any handler without
//! stalling the runtime.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use super::{
    now_millis, JsonMap, SessionStore, StateStore, StorageError, UiRecord, UiRecordStore, UserState,
};

/// Durable storage over a single SQLite database.
pub struct SqliteStorage {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database. The data lives only as long as the
    /// handle; used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let storage = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
            }),
        };
        storage.inner.bootstrap()?;
        Ok(storage)
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StorageError::TaskJoin(e.to_string()))?
    }
}

impl Inner {
    fn bootstrap(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversation_state (
                user_id     TEXT PRIMARY KEY,
                state_label TEXT,
                scratch_json TEXT NOT NULL DEFAULT '{}',
                updated_at  INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                user_id     TEXT NOT NULL,
                session_id  TEXT NOT NULL,
                data_json   TEXT,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (user_id, session_id)
            );
            CREATE TABLE IF NOT EXISTS ui_records (
                message_id    TEXT PRIMARY KEY,
                payload_json  TEXT NOT NULL,
                rendered_text TEXT NOT NULL DEFAULT '',
                callback_url  TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn session_get(&self, user_id: &str, session_id: &str) -> Result<JsonMap, StorageError> {
        let conn = self.conn.lock();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT data_json FROM sessions WHERE user_id = ?1 AND session_id = ?2",
                params![user_id, session_id],
                |row| row.get(0),
            )
            .optional()?;

        let raw = match raw.flatten() {
            Some(raw) => raw,
            None => return Ok(JsonMap::new()),
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            // Unreadable row: drop it and report absence.
            _ => {
                warn!(target: "storage", user_id, session_id, "clearing corrupt session row");
                conn.execute(
                    "DELETE FROM sessions WHERE user_id = ?1 AND session_id = ?2",
                    params![user_id, session_id],
                )?;
                Ok(JsonMap::new())
            }
        }
    }

    fn session_set(
        &self,
        user_id: &str,
        session_id: &str,
        data: &JsonMap,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(data)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (user_id, session_id, data_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, session_id) DO UPDATE SET
                 data_json = excluded.data_json,
                 updated_at = excluded.updated_at",
            params![user_id, session_id, payload, now_millis()],
        )?;
        Ok(())
    }

    fn session_clear(&self, user_id: &str, session_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE user_id = ?1 AND session_id = ?2",
            params![user_id, session_id],
        )?;
        Ok(())
    }

    fn session_clear_all(&self, user_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    fn state_load(&self, user_id: &str) -> Result<Option<UserState>, StorageError> {
        let conn = self.conn.lock();
        let row: Option<(Option<String>, String)> = conn
            .query_row(
                "SELECT state_label, scratch_json FROM conversation_state WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (label, scratch_raw) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let scratch = match serde_json::from_str::<Value>(&scratch_raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(target: "storage", user_id, "clearing corrupt state row");
                conn.execute(
                    "DELETE FROM conversation_state WHERE user_id = ?1",
                    params![user_id],
                )?;
                return Ok(None);
            }
        };

        Ok(Some(UserState {
            user_id: user_id.to_string(),
            label,
            scratch,
        }))
    }

    fn state_save(&self, state: &UserState) -> Result<(), StorageError> {
        let scratch = serde_json::to_string(&state.scratch)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversation_state (user_id, state_label, scratch_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id) DO UPDATE SET
                 state_label = excluded.state_label,
                 scratch_json = excluded.scratch_json,
                 updated_at = excluded.updated_at",
            params![state.user_id, state.label, scratch, now_millis()],
        )?;
        Ok(())
    }

    fn record_put(&self, record: &UiRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&record.payload)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ui_records (message_id, payload_json, rendered_text, callback_url)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (message_id) DO UPDATE SET
                 payload_json = excluded.payload_json,
                 rendered_text = excluded.rendered_text,
                 callback_url = excluded.callback_url",
            params![
                record.message_id,
                payload,
                record.rendered_text,
                record.callback_url
            ],
        )?;
        Ok(())
    }

    fn record_get(&self, message_id: &str) -> Result<Option<UiRecord>, StorageError> {
        let conn = self.conn.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT payload_json, rendered_text, callback_url
                 FROM ui_records WHERE message_id = ?1",
                params![message_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (payload_raw, rendered_text, callback_url) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let payload = match serde_json::from_str(&payload_raw) {
            Ok(payload) => payload,
            Err(_) => {
                warn!(target: "storage", message_id, "clearing corrupt ui record");
                conn.execute(
                    "DELETE FROM ui_records WHERE message_id = ?1",
                    params![message_id],
                )?;
                return Ok(None);
            }
        };

        Ok(Some(UiRecord {
            message_id: message_id.to_string(),
            payload,
            rendered_text,
            callback_url,
        }))
    }

    fn record_delete(&self, message_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM ui_records WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    fn record_list(&self) -> Result<Vec<UiRecord>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, payload_json, rendered_text, callback_url FROM ui_records",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (message_id, payload_raw, rendered_text, callback_url) = row?;
            // Skip unreadable rows here; a later `get` will clear them.
            let payload = match serde_json::from_str(&payload_raw) {
                Ok(payload) => payload,
                Err(_) => {
                    warn!(target: "storage", message_id, "skipping corrupt ui record");
                    continue;
                }
            };
            records.push(UiRecord {
                message_id,
                payload,
                rendered_text,
                callback_url,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn get(&self, user_id: &str, session_id: &str) -> Result<JsonMap, StorageError> {
        let (user_id, session_id) = (user_id.to_string(), session_id.to_string());
        self.call(move |inner| inner.session_get(&user_id, &session_id))
            .await
    }

    async fn set(
        &self,
        user_id: &str,
        session_id: &str,
        data: JsonMap,
    ) -> Result<(), StorageError> {
        let (user_id, session_id) = (user_id.to_string(), session_id.to_string());
        self.call(move |inner| inner.session_set(&user_id, &session_id, &data))
            .await
    }

    async fn clear(&self, user_id: &str, session_id: &str) -> Result<(), StorageError> {
        let (user_id, session_id) = (user_id.to_string(), session_id.to_string());
        self.call(move |inner| inner.session_clear(&user_id, &session_id))
            .await
    }

    async fn clear_all(&self, user_id: &str) -> Result<(), StorageError> {
        let user_id = user_id.to_string();
        self.call(move |inner| inner.session_clear_all(&user_id))
            .await
    }
}

#[async_trait]
impl StateStore for SqliteStorage {
    async fn load(&self, user_id: &str) -> Result<Option<UserState>, StorageError> {
        let user_id = user_id.to_string();
        self.call(move |inner| inner.state_load(&user_id)).await
    }

    async fn save(&self, state: &UserState) -> Result<(), StorageError> {
        let state = state.clone();
        self.call(move |inner| inner.state_save(&state)).await
    }
}

#[async_trait]
impl UiRecordStore for SqliteStorage {
    async fn put(&self, record: UiRecord) -> Result<(), StorageError> {
        self.call(move |inner| inner.record_put(&record)).await
    }

    async fn get(&self, message_id: &str) -> Result<Option<UiRecord>, StorageError> {
        let message_id = message_id.to_string();
        self.call(move |inner| inner.record_get(&message_id)).await
    }

    async fn delete(&self, message_id: &str) -> Result<(), StorageError> {
        let message_id = message_id.to_string();
        self.call(move |inner| inner.record_delete(&message_id))
            .await
    }

    async fn list(&self) -> Result<Vec<UiRecord>, StorageError> {
        self.call(|inner| inner.record_list()).await
    }
}
