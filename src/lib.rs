//! carryover
//!
//! Support layer for a webhook-driven chat bot. The platform delivers
//! independent, stateless HTTP callbacks; this library reconstructs
//! multi-step conversational context across them, suppresses duplicate
//! deliveries, and keeps previously-sent interactive UI working when the
//! bot's public callback endpoint changes.
//!
//! The pieces compose but stand alone:
//! - [`state`] -- per-user conversation state machine
//! - [`storage`] -- pluggable durable session / state / UI-record stores
//! - [`context`] -- payload-into-string codec for stateless context recovery
//! - [`dedup`] -- cooldown suppression of duplicate deliveries
//! - [`dispatch`] -- interceptor chain gating handler invocation
//! - [`migrate`] -- callback endpoint migration over persisted UI
//! - [`platform`] -- outbound chat-platform boundary

pub mod cli;
pub mod config;
pub mod context;
pub mod dedup;
pub mod dispatch;
pub mod logging;
pub mod migrate;
pub mod platform;
pub mod state;
pub mod storage;
