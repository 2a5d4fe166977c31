//! SQLite Backend Tests
//!
//! Durability across re-open, the logical schema contracts (absence,
//! upsert, idempotent clears), and the state machine running over the
//! durable backend — the cross-process path a redeploy exercises.

use std::sync::Arc;

use serde_json::json;

use carryover::state::StateMachine;
use carryover::storage::{
    JsonMap, SessionStore, SqliteStorage, StateStore, UiRecord, UiRecordStore,
};

fn data(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_sessions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carryover.db");

    {
        let storage = SqliteStorage::open(&path).unwrap();
        SessionStore::set(&storage, "u1", "s1", data(&[("step", json!(2))]))
            .await
            .unwrap();
    }

    // A fresh handle, as after a process restart.
    let storage = SqliteStorage::open(&path).unwrap();
    let stored = SessionStore::get(&storage, "u1", "s1").await.unwrap();
    assert_eq!(stored.get("step"), Some(&json!(2)));
}

#[tokio::test]
async fn test_state_machine_over_durable_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carryover.db");

    {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStorage::open(&path).unwrap());
        let machine = StateMachine::new(store);
        machine.set_state("u1", Some("signup:email")).await.unwrap();
        machine.set_value("u1", "email", json!("a@b.c")).await.unwrap();
    }

    // A new machine (new mirror) over the same file sees the same state.
    let store: Arc<dyn StateStore> = Arc::new(SqliteStorage::open(&path).unwrap());
    let machine = StateMachine::new(store);
    assert_eq!(
        machine.get_state("u1").await.unwrap().as_deref(),
        Some("signup:email")
    );
    assert_eq!(
        machine.get_scratch("u1").await.unwrap().get("email"),
        Some(&json!("a@b.c"))
    );
}

#[tokio::test]
async fn test_clear_all_only_touches_one_user() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    SessionStore::set(&storage, "u1", "s1", data(&[("k", json!(1))]))
        .await
        .unwrap();
    SessionStore::set(&storage, "u1", "s2", data(&[("k", json!(2))]))
        .await
        .unwrap();
    SessionStore::set(&storage, "u2", "s1", data(&[("k", json!(3))]))
        .await
        .unwrap();

    storage.clear_all("u1").await.unwrap();

    assert!(SessionStore::get(&storage, "u1", "s1").await.unwrap().is_empty());
    assert!(SessionStore::get(&storage, "u1", "s2").await.unwrap().is_empty());
    assert_eq!(
        SessionStore::get(&storage, "u2", "s1")
            .await
            .unwrap()
            .get("k"),
        Some(&json!(3))
    );
}

#[tokio::test]
async fn test_ui_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("carryover.db");

    let record = UiRecord {
        message_id: "m1".into(),
        payload: json!({"integration": {"url": "https://h/p/x/id/act"}}),
        rendered_text: "review".into(),
        callback_url: "https://h/p/x/id/act".into(),
    };

    {
        let storage = SqliteStorage::open(&path).unwrap();
        storage.put(record.clone()).await.unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let listed = storage.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].message_id, "m1");
    assert_eq!(listed[0].payload, record.payload);
}

#[tokio::test]
async fn test_concurrent_writers_distinct_users() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            let user = format!("u{i}");
            for step in 0..5 {
                SessionStore::set(
                    &*storage,
                    &user,
                    "s1",
                    data(&[("step", json!(step))]),
                )
                .await
                .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..8 {
        let stored = SessionStore::get(&*storage, &format!("u{i}"), "s1")
            .await
            .unwrap();
        assert_eq!(stored.get("step"), Some(&json!(4)));
    }
}
