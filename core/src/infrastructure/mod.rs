//! Collaborator seams between the engine and the UI it keeps alive.
//!
//! The engine never talks to a real element tree directly. It reads through
//! `SnapshotProvider` and acts through `ActionExecutor`; `mock::MockUi`
//! implements both for tests and `replay::ReplayUi` drives recorded frames.

pub mod mock;
pub mod replay;

use tracing::warn;

use crate::errors::{ActionError, MatcherError};
use crate::types::action::{Action, NodeRef};

/// Result of one multi-matcher lookup. `nodes` are visible nodes in document
/// order without duplicates; each malformed matcher contributes one error
/// and does not prevent the others from being evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub nodes: Vec<NodeRef>,
    pub errors: Vec<MatcherError>,
}

/// Read side of the UI.
pub trait SnapshotProvider {
    /// Return visible nodes matching any of `matchers`, optionally restricted
    /// to descendants of `scope`.
    fn snapshot(&self, matchers: &[String], scope: Option<NodeRef>) -> Snapshot;

    /// Aggregate text of a node and its descendants. `None` if the node is gone.
    fn text(&self, node: NodeRef) -> Option<String>;

    fn attribute(&self, node: NodeRef, key: &str) -> Option<String>;

    /// Only used to stamp identity markers onto observed nodes.
    fn set_attribute(&mut self, node: NodeRef, key: &str, value: &str) -> Result<(), ActionError>;

    /// Busy flag reported by the host application itself, when it has one.
    fn busy_hint(&self) -> Option<bool> {
        None
    }
}

/// Write side of the UI. Fire-and-forget: `Ok` only means the action was
/// issued, success is confirmed by later verification.
pub trait ActionExecutor {
    fn perform(&mut self, action: &Action) -> Result<(), ActionError>;
}

/// Anything that can both be observed and acted on.
pub trait UiBackend: SnapshotProvider + ActionExecutor {}

impl<T: SnapshotProvider + ActionExecutor> UiBackend for T {}

/// Run a lookup and log every malformed matcher.
pub fn select(
    provider: &dyn SnapshotProvider,
    matchers: &[String],
    scope: Option<NodeRef>,
) -> Vec<NodeRef> {
    let snap = provider.snapshot(matchers, scope);
    for err in &snap.errors {
        warn!(matcher = %err.matcher, reason = %err.reason, "matcher skipped");
    }
    snap.nodes
}

/// First match of a lookup, in document order.
pub fn select_first(
    provider: &dyn SnapshotProvider,
    matchers: &[String],
    scope: Option<NodeRef>,
) -> Option<NodeRef> {
    select(provider, matchers, scope).into_iter().next()
}

/// Last match of a lookup, in document order.
pub fn select_last(
    provider: &dyn SnapshotProvider,
    matchers: &[String],
    scope: Option<NodeRef>,
) -> Option<NodeRef> {
    select(provider, matchers, scope).into_iter().last()
}

#[cfg(test)]
mod tests {
    use super::mock::MockUi;
    use super::*;

    #[test]
    fn mock_implements_ui_backend() {
        let ui = MockUi::new();
        let _: &dyn UiBackend = &ui;
    }

    #[test]
    fn select_skips_bad_matchers() {
        let mut ui = MockUi::new();
        let a = ui.add(None, &["button"], "Run");
        let found = select(&ui, &["bad!".to_string(), "button".to_string()], None);
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn select_first_and_last() {
        let mut ui = MockUi::new();
        let a = ui.add(None, &["turn"], "one");
        let b = ui.add(None, &["turn"], "two");
        let m = vec!["turn".to_string()];
        assert_eq!(select_first(&ui, &m, None), Some(a));
        assert_eq!(select_last(&ui, &m, None), Some(b));
    }
}
