//! Event de-duplication guard
//!
//! Webhook platforms re-deliver: a double-clicked button or a retried
//! callback arrives as several identical events within moments. The guard
//! keys each delivery by the owning handler plus a fixed set of values
//! extracted from the event body and suppresses repeats inside a cooldown
//! window. Suppression is silent; duplicates are expected platform
//! behavior, not failures.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

/// Stand-in for a value whose extractor path is absent from the body.
const MISSING: &str = "-";

/// Default extractor: the interactive element's `context.value`.
const DEFAULT_PATH: [&str; 2] = ["context", "value"];

/// Cooldown suppression keyed by handler scope + extracted event values.
pub struct DedupGuard {
    scope: String,
    cooldown: Duration,
    extractors: Vec<Vec<String>>,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl DedupGuard {
    /// Create a guard for the handler named `scope` with the default
    /// `context.value` extractor.
    pub fn new(scope: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            scope: scope.into(),
            cooldown,
            extractors: vec![DEFAULT_PATH.iter().map(|s| s.to_string()).collect()],
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the extractors with the given ordered paths into the body.
    pub fn with_paths<P, S>(mut self, paths: impl IntoIterator<Item = P>) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extractors = paths
            .into_iter()
            .map(|path| path.into_iter().map(Into::into).collect())
            .collect();
        self
    }

    /// Composite cooldown key for an event body.
    fn key_for(&self, body: &Value) -> String {
        let mut key = self.scope.clone();
        for path in &self.extractors {
            let mut node = Some(body);
            for segment in path {
                node = node.and_then(|v| v.get(segment));
            }
            key.push('\u{1f}');
            match node {
                Some(Value::String(s)) => key.push_str(s),
                Some(Value::Null) | None => key.push_str(MISSING),
                Some(other) => key.push_str(&other.to_string()),
            }
        }
        key
    }

    /// Check the cooldown for this event and, if it passes, record the
    /// firing. Returns `false` when the event is a suppressed duplicate.
    pub fn admit(&self, body: &Value) -> bool {
        self.admit_at(body, Instant::now())
    }

    /// Check-and-set at an explicit instant. The lookup and the timestamp
    /// update happen under one lock so two racing duplicates cannot both
    /// pass.
    pub fn admit_at(&self, body: &Value, now: Instant) -> bool {
        let key = self.key_for(body);
        let mut last_fired = self.last_fired.lock();
        if let Some(last) = last_fired.get(&key) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        last_fired.insert(key, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cooldown_window() {
        let guard = DedupGuard::new("on_click", Duration::from_secs(5));
        let body = json!({"context": {"value": "approve"}});
        let t0 = Instant::now();

        assert!(guard.admit_at(&body, t0));
        assert!(!guard.admit_at(&body, t0 + Duration::from_secs(3)));
        assert!(guard.admit_at(&body, t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_distinct_values_are_independent() {
        let guard = DedupGuard::new("on_click", Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(guard.admit_at(&json!({"context": {"value": "a"}}), t0));
        assert!(guard.admit_at(&json!({"context": {"value": "b"}}), t0));
        assert!(!guard.admit_at(&json!({"context": {"value": "a"}}), t0));
    }

    #[test]
    fn test_missing_path_uses_sentinel() {
        let guard = DedupGuard::new("on_click", Duration::from_secs(5));
        let t0 = Instant::now();

        // Two bodies both lacking the path collapse onto one key.
        assert!(guard.admit_at(&json!({}), t0));
        assert!(!guard.admit_at(&json!({"unrelated": 1}), t0));
    }

    #[test]
    fn test_custom_paths_compose_key_in_order() {
        let guard = DedupGuard::new("on_submit", Duration::from_secs(5))
            .with_paths([vec!["context", "user_id"], vec!["post_id"]]);
        let t0 = Instant::now();

        let first = json!({"context": {"user_id": "u1"}, "post_id": "p1"});
        let same = json!({"context": {"user_id": "u1"}, "post_id": "p1"});
        let other_post = json!({"context": {"user_id": "u1"}, "post_id": "p2"});

        assert!(guard.admit_at(&first, t0));
        assert!(!guard.admit_at(&same, t0));
        assert!(guard.admit_at(&other_post, t0));
    }

    #[test]
    fn test_scope_separates_handlers() {
        let a = DedupGuard::new("handler_a", Duration::from_secs(5));
        let b = DedupGuard::new("handler_b", Duration::from_secs(5));
        let body = json!({"context": {"value": "x"}});
        let t0 = Instant::now();

        assert!(a.admit_at(&body, t0));
        assert!(b.admit_at(&body, t0));
    }

    #[test]
    fn test_non_string_values_keyed_by_serialization() {
        let guard = DedupGuard::new("on_click", Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(guard.admit_at(&json!({"context": {"value": 7}}), t0));
        assert!(!guard.admit_at(&json!({"context": {"value": 7}}), t0));
        assert!(guard.admit_at(&json!({"context": {"value": 8}}), t0));
    }
}
