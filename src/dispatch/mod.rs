//! Dispatch chain
//!
//! Inbound webhook events are handled by a [`Handler`] wrapped in an
//! ordered chain of [`Interceptor`] stages. Each stage can short-circuit
//! before the handler body runs — gate on conversation state, drop a
//! duplicate delivery, or bind a durable session into the context. Several
//! dispatchers can be registered against the same event trigger and
//! differentiate purely by state: a mismatch is a silent skip, not an
//! error.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::context::read_embedded_state;
use crate::dedup::DedupGuard;
use crate::state::{label_matches, StateMachine};
use crate::storage::{generate_session_id, JsonMap, SessionStore, StorageError};

/// An inbound webhook callback: who triggered it, and the raw body.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub user_id: String,
    pub body: Value,
}

impl InboundEvent {
    pub fn new(user_id: impl Into<String>, body: Value) -> Self {
        Self {
            user_id: user_id.into(),
            body,
        }
    }

    /// Walk a key path into the body.
    pub fn path(&self, path: &[&str]) -> Option<&Value> {
        let mut node = &self.body;
        for segment in path {
            node = node.get(segment)?;
        }
        Some(node)
    }

    /// The transported `state` field, as delivered by dialog callbacks.
    pub fn state_field(&self) -> Option<&str> {
        self.body.get("state").and_then(Value::as_str)
    }

    /// The `context.session_id` field, as delivered by button/select
    /// callbacks.
    pub fn context_session_id(&self) -> Option<&str> {
        self.path(&["context", "session_id"]).and_then(Value::as_str)
    }

    /// Parse the transported state field, inflating any embedded context
    /// payload. Empty when the field is absent or not valid JSON.
    pub fn embedded_state(&self) -> Map<String, Value> {
        self.state_field().map(read_embedded_state).unwrap_or_default()
    }
}

/// Why a chain stage skipped the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The user's conversation state did not match the guard.
    StateMismatch,
    /// A duplicate delivery inside the cooldown window.
    Duplicate,
}

/// A stage's verdict on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Skip(SkipReason),
}

/// What a dispatch did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Skipped(SkipReason),
}

/// Errors surfaced out of a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("handler failed: {0}")]
    Handler(String),
}

/// A durable session bound to one conversation instance.
///
/// Thin handle over the session store with the `(user, session)` key
/// applied; handlers read and write through it without carrying ids.
#[derive(Clone)]
pub struct SessionHandle {
    store: Arc<dyn SessionStore>,
    user_id: String,
    session_id: String,
}

impl SessionHandle {
    pub fn new(
        store: Arc<dyn SessionStore>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The session id, e.g. for embedding into outgoing UI context.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn get(&self) -> Result<JsonMap, StorageError> {
        self.store.get(&self.user_id, &self.session_id).await
    }

    pub async fn set(&self, data: JsonMap) -> Result<(), StorageError> {
        self.store.set(&self.user_id, &self.session_id, data).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.clear(&self.user_id, &self.session_id).await
    }

    pub async fn clear_all(&self) -> Result<(), StorageError> {
        self.store.clear_all(&self.user_id).await
    }
}

/// Mutable context threaded through the chain into the handler.
#[derive(Default)]
pub struct HandlerContext {
    /// Bound by [`SessionBinding`]; absent otherwise.
    pub session: Option<SessionHandle>,
}

/// The handler body at the end of a chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        event: &InboundEvent,
        ctx: &mut HandlerContext,
    ) -> Result<(), DispatchError>;
}

/// A chain stage: may enrich the context or short-circuit the dispatch.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn apply(
        &self,
        event: &InboundEvent,
        ctx: &mut HandlerContext,
    ) -> Result<Decision, DispatchError>;
}

/// A handler plus its ordered interceptor stages.
pub struct Dispatcher {
    name: String,
    stages: Vec<Arc<dyn Interceptor>>,
    handler: Arc<dyn Handler>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            handler,
        }
    }

    /// Append a stage. Stages run in registration order.
    pub fn with_stage(mut self, stage: Arc<dyn Interceptor>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run the chain, then the handler.
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<DispatchOutcome, DispatchError> {
        let mut ctx = HandlerContext::default();
        for stage in &self.stages {
            if let Decision::Skip(reason) = stage.apply(event, &mut ctx).await? {
                debug!(
                    target: "dispatch",
                    handler = %self.name,
                    user_id = %event.user_id,
                    ?reason,
                    "skipping handler"
                );
                return Ok(DispatchOutcome::Skipped(reason));
            }
        }
        self.handler.handle(event, &mut ctx).await?;
        Ok(DispatchOutcome::Handled)
    }
}

/// Gates the handler on the caller's conversation state.
///
/// Matching follows [`label_matches`]: an empty guard label admits only
/// idle users; a non-empty label admits its own `:`-delimited hierarchy.
pub struct StateGuard {
    machine: Arc<StateMachine>,
    labels: Vec<String>,
}

impl StateGuard {
    pub fn new<I, S>(machine: Arc<StateMachine>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            machine,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Interceptor for StateGuard {
    async fn apply(
        &self,
        event: &InboundEvent,
        _ctx: &mut HandlerContext,
    ) -> Result<Decision, DispatchError> {
        let current = self.machine.get_state(&event.user_id).await?;
        let matched = self
            .labels
            .iter()
            .any(|guard| label_matches(guard, current.as_deref()));
        if matched {
            Ok(Decision::Proceed)
        } else {
            Ok(Decision::Skip(SkipReason::StateMismatch))
        }
    }
}

/// Drops duplicate deliveries via a [`DedupGuard`].
pub struct Cooldown {
    guard: DedupGuard,
}

impl Cooldown {
    pub fn new(guard: DedupGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Interceptor for Cooldown {
    async fn apply(
        &self,
        event: &InboundEvent,
        _ctx: &mut HandlerContext,
    ) -> Result<Decision, DispatchError> {
        if self.guard.admit(&event.body) {
            Ok(Decision::Proceed)
        } else {
            Ok(Decision::Skip(SkipReason::Duplicate))
        }
    }
}

/// Where a callback carries its session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// Dialog submissions: the transported `state` field.
    StateField,
    /// Button/select actions: `context.session_id`.
    ActionContext,
}

/// Binds a [`SessionHandle`] into the context.
///
/// When the event carries no session id a fresh one is generated, starting
/// a new conversation instance.
pub struct SessionBinding {
    store: Arc<dyn SessionStore>,
    source: SessionSource,
}

impl SessionBinding {
    pub fn new(store: Arc<dyn SessionStore>, source: SessionSource) -> Self {
        Self { store, source }
    }
}

#[async_trait]
impl Interceptor for SessionBinding {
    async fn apply(
        &self,
        event: &InboundEvent,
        ctx: &mut HandlerContext,
    ) -> Result<Decision, DispatchError> {
        let carried = match self.source {
            SessionSource::StateField => event.state_field(),
            SessionSource::ActionContext => event.context_session_id(),
        };
        let session_id = carried
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_session_id);

        ctx.session = Some(SessionHandle::new(
            self.store.clone(),
            event.user_id.clone(),
            session_id,
        ));
        Ok(Decision::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that counts invocations.
    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(
            &self,
            _event: &InboundEvent,
            _ctx: &mut HandlerContext,
        ) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(user_id: &str) -> InboundEvent {
        InboundEvent::new(user_id, json!({"context": {"value": "x"}}))
    }

    #[tokio::test]
    async fn test_guard_admits_matching_hierarchy() {
        let storage = Storage::in_memory();
        let machine = Arc::new(StateMachine::new(storage.state.clone()));
        machine.set_state("u1", Some("signup:email")).await.unwrap();

        let handler = CountingHandler::new();
        let dispatcher = Dispatcher::new("on_signup", handler.clone())
            .with_stage(Arc::new(StateGuard::new(machine, ["signup"])));

        let outcome = dispatcher.dispatch(&event("u1")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_guard_skips_other_state_and_idle() {
        let storage = Storage::in_memory();
        let machine = Arc::new(StateMachine::new(storage.state.clone()));
        machine.set_state("u1", Some("checkout")).await.unwrap();

        let handler = CountingHandler::new();
        let dispatcher = Dispatcher::new("on_signup", handler.clone())
            .with_stage(Arc::new(StateGuard::new(machine, ["signup"])));

        // Wrong state.
        let outcome = dispatcher.dispatch(&event("u1")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::StateMismatch));
        // Idle user.
        let outcome = dispatcher.dispatch(&event("u2")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::StateMismatch));
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_guard_label_admits_only_idle() {
        let storage = Storage::in_memory();
        let machine = Arc::new(StateMachine::new(storage.state.clone()));
        machine.set_state("busy", Some("signup")).await.unwrap();

        let handler = CountingHandler::new();
        let dispatcher = Dispatcher::new("on_idle", handler.clone())
            .with_stage(Arc::new(StateGuard::new(machine, [""])));

        assert_eq!(
            dispatcher.dispatch(&event("idle-user")).await.unwrap(),
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch(&event("busy")).await.unwrap(),
            DispatchOutcome::Skipped(SkipReason::StateMismatch)
        );
    }

    #[tokio::test]
    async fn test_cooldown_stage_drops_duplicates() {
        let handler = CountingHandler::new();
        let dispatcher = Dispatcher::new("on_click", handler.clone()).with_stage(Arc::new(
            Cooldown::new(DedupGuard::new("on_click", std::time::Duration::from_secs(60))),
        ));

        assert_eq!(
            dispatcher.dispatch(&event("u1")).await.unwrap(),
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch(&event("u1")).await.unwrap(),
            DispatchOutcome::Skipped(SkipReason::Duplicate)
        );
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_stages_short_circuit_in_order() {
        // A state mismatch must report StateMismatch even with a cooldown
        // stage behind it, and must not consume the cooldown.
        let storage = Storage::in_memory();
        let machine = Arc::new(StateMachine::new(storage.state.clone()));

        let handler = CountingHandler::new();
        let dispatcher = Dispatcher::new("on_submit", handler.clone())
            .with_stage(Arc::new(StateGuard::new(machine.clone(), ["review"])))
            .with_stage(Arc::new(Cooldown::new(DedupGuard::new(
                "on_submit",
                std::time::Duration::from_secs(60),
            ))));

        assert_eq!(
            dispatcher.dispatch(&event("u1")).await.unwrap(),
            DispatchOutcome::Skipped(SkipReason::StateMismatch)
        );

        // Now that the state matches, the first delivery must pass the
        // untouched cooldown.
        machine.set_state("u1", Some("review")).await.unwrap();
        assert_eq!(
            dispatcher.dispatch(&event("u1")).await.unwrap(),
            DispatchOutcome::Handled
        );
    }

    #[tokio::test]
    async fn test_session_binding_generates_fresh_id_when_absent() {
        let storage = Storage::in_memory();

        struct CaptureSession {
            seen: parking_lot::Mutex<Vec<String>>,
        }

        #[async_trait]
        impl Handler for CaptureSession {
            async fn handle(
                &self,
                _event: &InboundEvent,
                ctx: &mut HandlerContext,
            ) -> Result<(), DispatchError> {
                let session = ctx.session.as_ref().expect("session bound");
                self.seen.lock().push(session.session_id().to_string());
                Ok(())
            }
        }

        let handler = Arc::new(CaptureSession {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let dispatcher = Dispatcher::new("on_dialog", handler.clone()).with_stage(Arc::new(
            SessionBinding::new(storage.sessions.clone(), SessionSource::StateField),
        ));

        // Carried session id is used verbatim.
        let carried = InboundEvent::new("u1", json!({"state": "sess-1"}));
        dispatcher.dispatch(&carried).await.unwrap();
        // Missing id gets a fresh one.
        let missing = InboundEvent::new("u1", json!({}));
        dispatcher.dispatch(&missing).await.unwrap();

        let seen = handler.seen.lock();
        assert_eq!(seen[0], "sess-1");
        assert_ne!(seen[1], "sess-1");
        assert!(!seen[1].is_empty());
    }
}
