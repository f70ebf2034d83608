//! Matcher lookup table keyed by `(Category, name)`.
//!
//! Every matcher the engine needs is named here, so a different host UI only
//! has to supply overrides in its settings file.

use std::collections::HashMap;

use crate::errors::{ConfigError, MatcherError};
use crate::types::config::SelectorOverrides;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Chat,
    Task,
    Terminal,
    Alert,
    Popover,
    Status,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Chat,
        Category::Task,
        Category::Terminal,
        Category::Alert,
        Category::Popover,
        Category::Status,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Chat => "chat",
            Category::Task => "task",
            Category::Terminal => "terminal",
            Category::Alert => "alert",
            Category::Popover => "popover",
            Category::Status => "status",
        }
    }

    pub fn parse(name: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Typed key into the selector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectorKey(pub Category, pub &'static str);

/// Keys used by the engine.
pub mod keys {
    use super::{Category, SelectorKey};

    pub const TASK_NODE: SelectorKey = SelectorKey(Category::Task, "node");
    pub const TASK_PRIMARY: SelectorKey = SelectorKey(Category::Task, "primary");
    pub const TASK_TERTIARY: SelectorKey = SelectorKey(Category::Task, "tertiary");
    pub const TASK_BUTTON: SelectorKey = SelectorKey(Category::Task, "button");

    pub const TERMINAL_RUN: SelectorKey = SelectorKey(Category::Terminal, "run");
    pub const TERMINAL_CARD: SelectorKey = SelectorKey(Category::Terminal, "card");
    pub const TERMINAL_CWD: SelectorKey = SelectorKey(Category::Terminal, "cwd");
    pub const TERMINAL_DELETE: SelectorKey = SelectorKey(Category::Terminal, "delete_card");
    pub const TERMINAL_DELETE_CONFIRM: SelectorKey =
        SelectorKey(Category::Terminal, "delete_confirm");
    pub const TERMINAL_DELETE_ACCEPT: SelectorKey =
        SelectorKey(Category::Terminal, "delete_accept");
    pub const TERMINAL_INPUT: SelectorKey = SelectorKey(Category::Terminal, "input");

    pub const ALERT_ACTION: SelectorKey = SelectorKey(Category::Alert, "action");
    pub const ALERT_BUTTON_ACTION: SelectorKey = SelectorKey(Category::Alert, "button_action");
    pub const ALERT_CANDIDATES: SelectorKey = SelectorKey(Category::Alert, "candidates");
    pub const ALERT_ERROR: SelectorKey = SelectorKey(Category::Alert, "error_message");

    pub const CHAT_ASSISTANT_TURN: SelectorKey = SelectorKey(Category::Chat, "assistant_turn");
    pub const CHAT_USER_TURN: SelectorKey = SelectorKey(Category::Chat, "user_turn");
    pub const CHAT_INPUT: SelectorKey = SelectorKey(Category::Chat, "input");
    pub const CHAT_INPUT_IDLE: SelectorKey = SelectorKey(Category::Chat, "input_idle");
    pub const CHAT_INPUT_DISABLED: SelectorKey = SelectorKey(Category::Chat, "input_disabled");
    pub const CHAT_SEND: SelectorKey = SelectorKey(Category::Chat, "send");
    pub const CHAT_SEND_DISABLED: SelectorKey = SelectorKey(Category::Chat, "send_disabled");
    pub const CHAT_STOP: SelectorKey = SelectorKey(Category::Chat, "stop");
    pub const CHAT_NEW: SelectorKey = SelectorKey(Category::Chat, "new_chat");
    pub const CHAT_KEEP_ALL: SelectorKey = SelectorKey(Category::Chat, "keep_all");

    pub const POPOVER_BODY: SelectorKey = SelectorKey(Category::Popover, "body");
    pub const POPOVER_CONFIRM: SelectorKey = SelectorKey(Category::Popover, "confirm");
    pub const POPOVER_PRIMARY: SelectorKey = SelectorKey(Category::Popover, "primary");

    pub const STATUS_LOADING: SelectorKey = SelectorKey(Category::Status, "loading");
    pub const STATUS_QUEUE: SelectorKey = SelectorKey(Category::Status, "queue_notice");
    pub const STATUS_BANNER: SelectorKey = SelectorKey(Category::Status, "banner");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorTable {
    entries: HashMap<Category, HashMap<String, Vec<String>>>,
}

impl Default for SelectorTable {
    fn default() -> Self {
        let mut table = SelectorTable {
            entries: HashMap::new(),
        };
        let defaults: &[(SelectorKey, &[&str])] = &[
            (keys::TASK_NODE, &["agent-task", "agent-error"]),
            (keys::TASK_PRIMARY, &["btn-primary"]),
            (keys::TASK_TERTIARY, &["btn-tertiary"]),
            (keys::TASK_BUTTON, &["button"]),
            (keys::TERMINAL_RUN, &["run-command-btn-run"]),
            (keys::TERMINAL_CARD, &["run-command-card"]),
            (keys::TERMINAL_CWD, &["run-command-card-cwd"]),
            (keys::TERMINAL_DELETE, &["delete-files-card"]),
            (keys::TERMINAL_DELETE_CONFIRM, &["delete-files-card.need-confirm"]),
            (keys::TERMINAL_DELETE_ACCEPT, &["delete-files-card btn-primary"]),
            (keys::TERMINAL_INPUT, &["terminal-input"]),
            (keys::ALERT_ACTION, &["alert-action"]),
            (keys::ALERT_BUTTON_ACTION, &["alert-button-action"]),
            (keys::ALERT_CANDIDATES, &["alert-msg", "alert-title", "alert-container"]),
            (keys::ALERT_ERROR, &["agent-error alert-msg"]),
            (keys::CHAT_ASSISTANT_TURN, &["assistant-turn"]),
            (keys::CHAT_USER_TURN, &["user-turn"]),
            (keys::CHAT_INPUT, &["chat-input"]),
            (keys::CHAT_INPUT_IDLE, &["chat-input.empty", "chat-input-placeholder"]),
            (keys::CHAT_INPUT_DISABLED, &["chat-input.disabled"]),
            (keys::CHAT_SEND, &["send-button"]),
            (keys::CHAT_SEND_DISABLED, &["send-button.disabled"]),
            (keys::CHAT_STOP, &["stop-button"]),
            (keys::CHAT_NEW, &["new-chat"]),
            (keys::CHAT_KEEP_ALL, &["keep-all-button"]),
            (keys::POPOVER_BODY, &["confirm-popover"]),
            (
                keys::POPOVER_CONFIRM,
                &["confirm-popover confirm-button", "confirm-popover button"],
            ),
            (keys::POPOVER_PRIMARY, &["popup-button.primary"]),
            (keys::STATUS_LOADING, &["loading", "spinner", "thinking", "generating"]),
            (
                keys::STATUS_QUEUE,
                &["alert-title", "alert-msg", "assistant-bar", "agent-error"],
            ),
            (keys::STATUS_BANNER, &["status-banner", "assistant-bar status-text"]),
        ];
        for (key, matchers) in defaults {
            table.set(*key, matchers.iter().map(|m| m.to_string()).collect());
        }
        table
    }
}

impl SelectorTable {
    pub fn lookup(&self, category: Category, name: &str) -> Option<&[String]> {
        self.entries
            .get(&category)
            .and_then(|names| names.get(name))
            .map(Vec::as_slice)
    }

    /// Matchers for an engine key; empty when the key has been cleared.
    pub fn matchers(&self, key: SelectorKey) -> &[String] {
        self.lookup(key.0, key.1).unwrap_or(&[])
    }

    pub fn set(&mut self, key: SelectorKey, matchers: Vec<String>) {
        self.insert(key.0, key.1, matchers);
    }

    fn insert(&mut self, category: Category, name: &str, matchers: Vec<String>) {
        self.entries
            .entry(category)
            .or_default()
            .insert(name.to_string(), matchers);
    }

    /// Overlay entries from a settings file. Unknown categories are rejected;
    /// new names within a known category are accepted so scenario files can
    /// reference them.
    pub fn override_from(&mut self, overrides: &SelectorOverrides) -> Result<(), ConfigError> {
        for (category, names) in overrides {
            let cat = Category::parse(category).ok_or_else(|| ConfigError::UnknownSelector {
                category: category.clone(),
                name: names.keys().next().cloned().unwrap_or_default(),
            })?;
            for (name, matchers) in names {
                self.insert(cat, name, matchers.clone());
            }
        }
        Ok(())
    }

    /// Expand a matcher field from a scenario definition. `@category/name`
    /// refers to a table entry; anything else is a literal matcher.
    pub fn resolve(&self, expr: &str) -> Result<Vec<String>, MatcherError> {
        let Some(reference) = expr.strip_prefix('@') else {
            return Ok(vec![expr.to_string()]);
        };
        let (category, name) = reference
            .split_once('/')
            .ok_or_else(|| MatcherError::new(expr, "expected @category/name"))?;
        let cat = Category::parse(category)
            .ok_or_else(|| MatcherError::new(expr, format!("unknown category '{}'", category)))?;
        self.lookup(cat, name)
            .map(<[String]>::to_vec)
            .ok_or_else(|| MatcherError::new(expr, format!("unknown selector '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn default_table_covers_engine_keys() {
        let table = SelectorTable::default();
        assert_eq!(table.matchers(keys::TASK_PRIMARY), ["btn-primary".to_string()]);
        assert_eq!(table.matchers(keys::STATUS_LOADING).len(), 4);
        assert!(table.lookup(Category::Chat, "missing").is_none());
    }

    #[test]
    fn override_replaces_and_adds() {
        let mut table = SelectorTable::default();
        let mut chat = BTreeMap::new();
        chat.insert("stop".to_string(), vec!["cancel-btn".to_string()]);
        chat.insert("retry".to_string(), vec!["retry-btn".to_string()]);
        let mut overrides = BTreeMap::new();
        overrides.insert("chat".to_string(), chat);
        table.override_from(&overrides).unwrap();
        assert_eq!(table.matchers(keys::CHAT_STOP), ["cancel-btn".to_string()]);
        assert_eq!(table.resolve("@chat/retry").unwrap(), vec!["retry-btn".to_string()]);
    }

    #[test]
    fn override_rejects_unknown_category() {
        let mut table = SelectorTable::default();
        let mut overrides = BTreeMap::new();
        overrides.insert("widgets".to_string(), BTreeMap::new());
        let err = table.override_from(&overrides).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSelector { .. }));
    }

    #[test]
    fn resolve_literal_and_references() {
        let table = SelectorTable::default();
        assert_eq!(table.resolve("foo bar").unwrap(), vec!["foo bar".to_string()]);
        assert_eq!(
            table.resolve("@alert/action").unwrap(),
            vec!["alert-action".to_string()]
        );
        assert!(table.resolve("@alert").is_err());
        assert!(table.resolve("@nope/x").is_err());
        assert!(table.resolve("@alert/nope").is_err());
    }
}
