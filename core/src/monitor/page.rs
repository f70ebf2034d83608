//! Read-only helpers over the chat page shared by the monitor modules.

use crate::data::selectors::{keys, SelectorKey, SelectorTable};
use crate::infrastructure::{select, select_first, select_last, SnapshotProvider};
use crate::types::action::NodeRef;

/// Case-insensitive "contains any of".
pub fn contains_any(text: &str, phrases: &[String]) -> bool {
    let lower = text.to_lowercase();
    phrases
        .iter()
        .any(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
}

/// Borrowed view of the page through the selector table.
#[derive(Clone, Copy)]
pub struct Page<'a> {
    pub ui: &'a dyn SnapshotProvider,
    pub selectors: &'a SelectorTable,
}

impl<'a> Page<'a> {
    pub fn new(ui: &'a dyn SnapshotProvider, selectors: &'a SelectorTable) -> Self {
        Page { ui, selectors }
    }

    pub fn all(&self, key: SelectorKey) -> Vec<NodeRef> {
        select(self.ui, self.selectors.matchers(key), None)
    }

    pub fn first(&self, key: SelectorKey) -> Option<NodeRef> {
        select_first(self.ui, self.selectors.matchers(key), None)
    }

    pub fn exists(&self, key: SelectorKey) -> bool {
        self.first(key).is_some()
    }

    pub fn within(&self, key: SelectorKey, scope: NodeRef) -> Vec<NodeRef> {
        select(self.ui, self.selectors.matchers(key), Some(scope))
    }

    pub fn text(&self, node: NodeRef) -> String {
        self.ui.text(node).unwrap_or_default()
    }

    pub fn latest_assistant_turn(&self) -> Option<NodeRef> {
        select_last(self.ui, self.selectors.matchers(keys::CHAT_ASSISTANT_TURN), None)
    }

    pub fn latest_user_turn(&self) -> Option<NodeRef> {
        select_last(self.ui, self.selectors.matchers(keys::CHAT_USER_TURN), None)
    }

    pub fn task_count(&self) -> usize {
        self.all(keys::TASK_NODE).len()
    }

    /// Text of the last `turns` conversation turns, oldest first, truncated
    /// from the front to at most `char_limit` characters.
    pub fn chat_history(&self, turns: usize, char_limit: usize) -> String {
        let mut matchers = self.selectors.matchers(keys::CHAT_USER_TURN).to_vec();
        matchers.extend_from_slice(self.selectors.matchers(keys::CHAT_ASSISTANT_TURN));
        let nodes = select(self.ui, &matchers, None);
        let start = nodes.len().saturating_sub(turns);
        let joined = nodes[start..]
            .iter()
            .map(|n| self.text(*n))
            .collect::<Vec<_>>()
            .join("\n");
        let count = joined.chars().count();
        if count <= char_limit {
            joined
        } else {
            joined.chars().skip(count - char_limit).collect()
        }
    }
}
