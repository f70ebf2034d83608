//! Task Classifier: an ordered chain of pure predicate rules.
//!
//! A rule sees the node only through `NodeInspect` plus the node's aggregate
//! text, never registry state, so classifying an unchanged node always yields
//! the same type. The first matching rule wins; no match means `Info`.

use crate::data::selectors::{keys, SelectorKey, SelectorTable};
use crate::infrastructure::{select, SnapshotProvider};
use crate::types::action::NodeRef;
use crate::types::config::Settings;
use crate::types::task::{CachedFlags, TaskType};

/// Button label families the rules can ask about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonLabel {
    Continue,
    Skip,
    Retry,
}

/// Read-only view of one node's subtree.
pub trait NodeInspect {
    /// A descendant matches the selector entry.
    fn has(&self, key: SelectorKey) -> bool;
    /// A descendant button carries a label of the given family.
    fn has_labelled_button(&self, label: ButtonLabel) -> bool;
}

pub type Predicate = fn(&dyn NodeInspect, &str) -> bool;

pub struct ClassifyRule {
    pub id: &'static str,
    pub result: TaskType,
    pub predicate: Predicate,
}

fn contains_ci(text: &str, needle: &str) -> bool {
    text.to_lowercase().contains(&needle.to_lowercase())
}

fn alert_action(n: &dyn NodeInspect, _: &str) -> bool {
    n.has(keys::ALERT_ACTION) || n.has(keys::ALERT_BUTTON_ACTION)
}

fn generic_continue(n: &dyn NodeInspect, text: &str) -> bool {
    text.contains("Continue") && n.has_labelled_button(ButtonLabel::Continue)
}

fn context_limit(_: &dyn NodeInspect, text: &str) -> bool {
    contains_ci(text, "context length")
}

fn thinking_limit(_: &dyn NodeInspect, text: &str) -> bool {
    contains_ci(text, "thinking limit reached") || contains_ci(text, "step limit reached")
}

fn run_command(n: &dyn NodeInspect, _: &str) -> bool {
    n.has(keys::TERMINAL_CARD) || n.has(keys::TERMINAL_CWD)
}

fn delete_file(n: &dyn NodeInspect, _: &str) -> bool {
    n.has(keys::TERMINAL_DELETE)
}

fn regenerate(n: &dyn NodeInspect, _: &str) -> bool {
    n.has_labelled_button(ButtonLabel::Retry)
}

pub static RULES: &[ClassifyRule] = &[
    ClassifyRule {
        id: "click_alert_action",
        result: TaskType::Click,
        predicate: alert_action,
    },
    ClassifyRule {
        id: "click_generic_continue",
        result: TaskType::Click,
        predicate: generic_continue,
    },
    ClassifyRule {
        id: "reply_context_limit",
        result: TaskType::ResetContinue,
        predicate: context_limit,
    },
    ClassifyRule {
        id: "reply_thinking_limit",
        result: TaskType::Reply,
        predicate: thinking_limit,
    },
    ClassifyRule {
        id: "terminal_run_command",
        result: TaskType::Terminal,
        predicate: run_command,
    },
    ClassifyRule {
        id: "terminal_delete_file",
        result: TaskType::Terminal,
        predicate: delete_file,
    },
    ClassifyRule {
        id: "restart_regenerate",
        result: TaskType::Restart,
        predicate: regenerate,
    },
];

/// Classify and report which rule fired.
pub fn classify_with_rule(node: &dyn NodeInspect, text: &str) -> (TaskType, Option<&'static str>) {
    RULES
        .iter()
        .find(|rule| (rule.predicate)(node, text))
        .map(|rule| (rule.result, Some(rule.id)))
        .unwrap_or((TaskType::Info, None))
}

pub fn classify(node: &dyn NodeInspect, text: &str) -> TaskType {
    classify_with_rule(node, text).0
}

/// Controls recorded alongside a task at (re)classification.
pub fn cached_flags(node: &dyn NodeInspect) -> CachedFlags {
    CachedFlags {
        primary: node.has(keys::TASK_PRIMARY),
        run: node.has(keys::TERMINAL_RUN),
        alert_action: node.has(keys::ALERT_ACTION),
        skip: has_skip_control(node),
    }
}

/// A visible skip control: tertiary button or a skip-labelled button.
pub fn has_skip_control(node: &dyn NodeInspect) -> bool {
    node.has(keys::TASK_TERTIARY) || node.has_labelled_button(ButtonLabel::Skip)
}

/// Any control a click or terminal task could act on.
pub fn has_actionable_control(node: &dyn NodeInspect) -> bool {
    cached_flags(node).any()
        || node.has(keys::ALERT_BUTTON_ACTION)
        || has_skip_control(node)
        || node.has_labelled_button(ButtonLabel::Continue)
}

// ---------------------------------------------------------------------------
// Inspector over a live snapshot provider
// ---------------------------------------------------------------------------

/// `NodeInspect` backed by the selector table, scoped to one node.
pub struct NodeInspector<'a> {
    pub ui: &'a dyn SnapshotProvider,
    pub selectors: &'a SelectorTable,
    pub settings: &'a Settings,
    pub node: NodeRef,
}

impl NodeInspector<'_> {
    fn labels(&self, label: ButtonLabel) -> Vec<&str> {
        match label {
            ButtonLabel::Continue => vec!["Continue"],
            ButtonLabel::Skip => self.settings.skip_labels.iter().map(String::as_str).collect(),
            ButtonLabel::Retry => self.settings.retry_labels.iter().map(String::as_str).collect(),
        }
    }

    /// First descendant button labelled with the family, in document order.
    pub fn labelled_button(&self, label: ButtonLabel) -> Option<NodeRef> {
        let labels = self.labels(label);
        select(self.ui, self.selectors.matchers(keys::TASK_BUTTON), Some(self.node))
            .into_iter()
            .find(|b| {
                self.ui
                    .text(*b)
                    .map(|t| {
                        let t = t.trim();
                        labels.iter().any(|l| t.eq_ignore_ascii_case(l))
                    })
                    .unwrap_or(false)
            })
    }

    pub fn first(&self, key: SelectorKey) -> Option<NodeRef> {
        select(self.ui, self.selectors.matchers(key), Some(self.node))
            .into_iter()
            .next()
    }
}

impl NodeInspect for NodeInspector<'_> {
    fn has(&self, key: SelectorKey) -> bool {
        self.first(key).is_some()
    }

    fn has_labelled_button(&self, label: ButtonLabel) -> bool {
        self.labelled_button(label).is_some()
    }
}
