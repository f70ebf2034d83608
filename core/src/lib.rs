//! Agent keepalive engine.
//!
//! Watches a chat-style agent UI through a snapshot of its element tree and
//! keeps the agent moving: it classifies actionable nodes into tasks, clicks
//! or replies to them one at a time, recognises conversational dead ends
//! through configurable scenarios, and nudges the agent when its output
//! stops changing.
//!
//! The UI itself is a collaborator (`infrastructure::UiBackend`); the engine
//! is driven by calling `monitor::DispatchLoop::tick` periodically, or through
//! `monitor::Supervisor::run`.

pub mod data;
pub mod errors;
pub mod infrastructure;
pub mod monitor;
pub mod scenario;
pub mod tasks;
pub mod types;

pub use errors::{ActionError, ConfigError, MatcherError};
pub use infrastructure::{ActionExecutor, SnapshotProvider, UiBackend};
pub use monitor::{DispatchLoop, Supervisor, TickOutcome, TickReport};
