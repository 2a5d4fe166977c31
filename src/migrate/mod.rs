//! Endpoint migration
//!
//! Interactive UI that has already been delivered keeps pointing at the
//! callback endpoint it was built with. When the bot's public address
//! changes (redeploy, ingress move), every such message would go dead.
//! This module walks the durable index of sent payloads, rewrites the
//! embedded callback URLs onto the new base, and re-submits each message
//! to the platform.
//!
//! Records are processed independently: one failed re-submission is
//! reported and the batch moves on.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use crate::platform::{PlatformClient, PlatformError};
use crate::storage::{StorageError, UiRecord, UiRecordStore};

/// Reserved payload key holding a callback URL.
const URL_KEY: &str = "url";

/// Callback URLs are `<scheme>://<host>/<three route segments>/<action...>`.
/// Splitting on `/` puts the action tail at index 6; everything before it
/// is the endpoint prefix that migration replaces.
const PREFIX_SPLIT_SEGMENTS: usize = 6;

/// Errors from migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Find the first embedded callback URL in a payload, depth-first.
pub fn find_url(node: &Value) -> Option<&str> {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if key == URL_KEY {
                    if let Some(url) = value.as_str() {
                        return Some(url);
                    }
                }
                if let Some(url) = find_url(value) {
                    return Some(url);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_url),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => None,
    }
}

/// Rewrite every embedded callback URL in place, replacing the endpoint
/// prefix with `new_base_url` and preserving the trailing action segments.
pub fn rewrite_urls(node: &mut Value, new_base_url: &str) {
    match node {
        Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if key == URL_KEY {
                    if let Value::String(url) = value {
                        *url = rebase_url(url, new_base_url);
                        continue;
                    }
                }
                rewrite_urls(value, new_base_url);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_urls(item, new_base_url);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

/// Swap a URL's endpoint prefix for `new_base_url`.
fn rebase_url(url: &str, new_base_url: &str) -> String {
    let tail: Vec<&str> = url.split('/').skip(PREFIX_SPLIT_SEGMENTS).collect();
    let base = new_base_url.trim_end_matches('/');
    if tail.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, tail.join("/"))
    }
}

/// Outcome of one record in a migration batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Payload rewritten and re-submitted.
    Migrated,
    /// Stored callback URL already points at the new base.
    SkippedCurrent,
    /// The message no longer exists on the platform; record dropped.
    SkippedGone,
    /// Re-submission failed; the record is left as it was.
    Failed(String),
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migrated => write!(f, "migrated"),
            Self::SkippedCurrent => write!(f, "skipped (already current)"),
            Self::SkippedGone => write!(f, "skipped (message gone)"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Per-record migration result.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub message_id: String,
    pub status: MigrationStatus,
}

/// Result of a full migration batch.
#[derive(Debug, Clone, Default)]
pub struct MigrationSummary {
    pub outcomes: Vec<RecordOutcome>,
}

impl MigrationSummary {
    pub fn migrated(&self) -> usize {
        self.count(|s| matches!(s, MigrationStatus::Migrated))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| {
            matches!(
                s,
                MigrationStatus::SkippedCurrent | MigrationStatus::SkippedGone
            )
        })
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, MigrationStatus::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&MigrationStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Rewrites persisted UI payloads onto a new callback base URL.
pub struct Migrator {
    records: Arc<dyn UiRecordStore>,
    platform: Arc<dyn PlatformClient>,
}

impl Migrator {
    pub fn new(records: Arc<dyn UiRecordStore>, platform: Arc<dyn PlatformClient>) -> Self {
        Self { records, platform }
    }

    /// Migrate every stored record onto `new_base_url`.
    ///
    /// Always attempts all records; per-record failures land in the
    /// summary instead of aborting the batch.
    pub async fn migrate(&self, new_base_url: &str) -> Result<MigrationSummary, MigrateError> {
        let records = self.records.list().await?;
        info!(target: "migrate", count = records.len(), new_base_url, "starting migration");

        let outcomes = join_all(
            records
                .into_iter()
                .map(|record| self.migrate_record(record, new_base_url)),
        )
        .await;

        let summary = MigrationSummary { outcomes };
        info!(
            target: "migrate",
            migrated = summary.migrated(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "migration finished"
        );
        Ok(summary)
    }

    async fn migrate_record(&self, record: UiRecord, new_base_url: &str) -> RecordOutcome {
        let message_id = record.message_id.clone();
        let status = self.try_migrate_record(record, new_base_url).await;
        if let MigrationStatus::Failed(reason) = &status {
            warn!(target: "migrate", message_id = %message_id, reason = %reason, "record migration failed");
        }
        RecordOutcome { message_id, status }
    }

    async fn try_migrate_record(&self, record: UiRecord, new_base_url: &str) -> MigrationStatus {
        if record.callback_url.contains(new_base_url) {
            return MigrationStatus::SkippedCurrent;
        }

        let mut payload = record.payload.clone();
        rewrite_urls(&mut payload, new_base_url);

        match self.platform.message_exists(&record.message_id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.records.delete(&record.message_id).await {
                    return MigrationStatus::Failed(err.to_string());
                }
                return MigrationStatus::SkippedGone;
            }
            Err(err) => return MigrationStatus::Failed(err.to_string()),
        }

        if let Err(err) = self
            .platform
            .update_message(&record.message_id, &record.rendered_text, &payload)
            .await
        {
            return MigrationStatus::Failed(err.to_string());
        }

        let callback_url = find_url(&payload)
            .map(str::to_string)
            .unwrap_or_else(|| new_base_url.to_string());
        let updated = UiRecord {
            payload,
            callback_url,
            ..record
        };
        match self.records.put(updated).await {
            Ok(()) => MigrationStatus::Migrated,
            Err(err) => MigrationStatus::Failed(err.to_string()),
        }
    }

    /// Drop records whose platform message no longer exists. Returns the
    /// number of records removed.
    pub async fn prune_dead_records(&self) -> Result<usize, MigrateError> {
        let records = self.records.list().await?;
        let mut removed = 0;

        for record in records {
            match self.platform.message_exists(&record.message_id).await {
                Ok(false) => {
                    self.records.delete(&record.message_id).await?;
                    removed += 1;
                }
                Ok(true) => {}
                Err(err) => {
                    // Unreachable platform says nothing about the message;
                    // keep the record.
                    warn!(
                        target: "migrate",
                        message_id = %record.message_id,
                        error = %err,
                        "alive check failed, keeping record"
                    );
                }
            }
        }
        Ok(removed)
    }

    /// Create a platform message and, when its payload embeds a callback
    /// URL, persist a record so future migrations can revisit it.
    /// Returns the platform message id.
    pub async fn post_with_record(
        &self,
        channel_id: &str,
        text: &str,
        payload: Value,
    ) -> Result<String, MigrateError> {
        let message_id = self
            .platform
            .create_message(channel_id, text, &payload)
            .await?;

        if let Some(callback_url) = find_url(&payload).map(str::to_string) {
            self.records
                .put(UiRecord {
                    message_id: message_id.clone(),
                    payload,
                    rendered_text: text.to_string(),
                    callback_url,
                })
                .await?;
        }

        Ok(message_id)
    }
}
