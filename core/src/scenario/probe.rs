//! Structural access for scenario detection.

use tracing::warn;

use crate::data::selectors::SelectorTable;
use crate::errors::MatcherError;
use crate::infrastructure::SnapshotProvider;
use crate::types::action::NodeRef;

/// What the detector may ask of the UI beyond plain text.
pub trait ScenarioProbe {
    /// Texts of nodes matching `matcher`, restricted to the latest assistant
    /// turn when `latest_only` is set.
    fn texts(&self, matcher: &str, latest_only: bool) -> Result<Vec<String>, MatcherError>;

    /// Whether `matcher` matches anything inside the latest assistant turn.
    fn exists(&self, matcher: &str) -> Result<bool, MatcherError>;
}

/// Probe for text-only detection (no element tree available).
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOnlyProbe;

impl ScenarioProbe for TextOnlyProbe {
    fn texts(&self, _matcher: &str, _latest_only: bool) -> Result<Vec<String>, MatcherError> {
        Ok(Vec::new())
    }

    fn exists(&self, _matcher: &str) -> Result<bool, MatcherError> {
        Ok(false)
    }
}

/// Probe over a live snapshot provider. Matcher fields may be selector
/// references (`@category/name`).
pub struct UiProbe<'a> {
    pub ui: &'a dyn SnapshotProvider,
    pub selectors: &'a SelectorTable,
    pub latest_turn: Option<NodeRef>,
}

impl UiProbe<'_> {
    fn lookup(&self, matcher: &str, scope: Option<NodeRef>) -> Result<Vec<NodeRef>, MatcherError> {
        let resolved = self.selectors.resolve(matcher)?;
        let snap = self.ui.snapshot(&resolved, scope);
        if snap.nodes.is_empty() {
            if let Some(first) = snap.errors.into_iter().next() {
                return Err(first);
            }
        } else {
            for err in &snap.errors {
                warn!(matcher = %err.matcher, reason = %err.reason, "matcher skipped");
            }
        }
        Ok(snap.nodes)
    }
}

impl ScenarioProbe for UiProbe<'_> {
    fn texts(&self, matcher: &str, latest_only: bool) -> Result<Vec<String>, MatcherError> {
        let scope = if latest_only {
            match self.latest_turn {
                Some(turn) => Some(turn),
                None => return Ok(Vec::new()),
            }
        } else {
            None
        };
        Ok(self
            .lookup(matcher, scope)?
            .into_iter()
            .filter_map(|n| self.ui.text(n))
            .collect())
    }

    fn exists(&self, matcher: &str) -> Result<bool, MatcherError> {
        match self.latest_turn {
            Some(turn) => Ok(!self.lookup(matcher, Some(turn))?.is_empty()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockUi;

    #[test]
    fn latest_only_scopes_to_turn() {
        let mut ui = MockUi::new();
        let old = ui.add(None, &["assistant-turn"], "");
        ui.add(Some(old), &["alert-msg"], "old alert");
        let turn = ui.add(None, &["assistant-turn"], "");
        ui.add(Some(turn), &["alert-msg"], "new alert");
        let selectors = SelectorTable::default();
        let probe = UiProbe {
            ui: &ui,
            selectors: &selectors,
            latest_turn: Some(turn),
        };
        assert_eq!(probe.texts("alert-msg", true).unwrap(), vec!["new alert".to_string()]);
        assert_eq!(probe.texts("@alert/candidates", false).unwrap().len(), 2);
        assert!(probe.exists("alert-msg").unwrap());
        assert!(!probe.exists("run-command-card").unwrap());
    }

    #[test]
    fn no_turn_means_nothing_scoped() {
        let mut ui = MockUi::new();
        ui.add(None, &["alert-msg"], "x");
        let selectors = SelectorTable::default();
        let probe = UiProbe {
            ui: &ui,
            selectors: &selectors,
            latest_turn: None,
        };
        assert!(probe.texts("alert-msg", true).unwrap().is_empty());
        assert!(!probe.exists("alert-msg").unwrap());
        assert_eq!(probe.texts("alert-msg", false).unwrap().len(), 1);
    }

    #[test]
    fn bad_matchers_surface_as_errors() {
        let ui = MockUi::new();
        let selectors = SelectorTable::default();
        let probe = UiProbe {
            ui: &ui,
            selectors: &selectors,
            latest_turn: None,
        };
        assert!(probe.texts("bad>matcher", false).is_err());
        assert!(probe.texts("@nope/x", false).is_err());
    }
}
