//! In-memory element tree for tests and replay.
//!
//! Nodes carry a set of tags, their own text and string attributes. Matcher
//! expressions are a small subset of selector syntax:
//!
//! - `tag` matches a node carrying that tag
//! - `a.b` matches a node carrying both tags
//! - `a b` matches a `b` node nested anywhere below an `a` node
//!
//! All performed actions are recorded in `actions`, in order.

use std::collections::HashMap;

use crate::errors::{ActionError, MatcherError};
use crate::types::action::{Action, NodeRef};

use super::{ActionExecutor, Snapshot, SnapshotProvider};

#[derive(Debug, Clone, Default)]
struct MockNode {
    parent: Option<u64>,
    children: Vec<u64>,
    tags: Vec<String>,
    text: String,
    attrs: HashMap<String, String>,
}

/// A test double serving a configurable node tree.
#[derive(Debug, Clone, Default)]
pub struct MockUi {
    nodes: HashMap<u64, MockNode>,
    roots: Vec<u64>,
    next_id: u64,
    busy: Option<bool>,
    /// All actions performed against this UI, in order.
    pub actions: Vec<Action>,
    /// When set, every `perform` call is rejected (and not recorded).
    pub fail_actions: bool,
}

impl MockUi {
    pub fn new() -> Self {
        MockUi {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Append a node under `parent` (or as a new root). Returns its handle.
    pub fn add(&mut self, parent: Option<NodeRef>, tags: &[&str], text: &str) -> NodeRef {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        let parent_id = parent.map(|p| p.0).filter(|p| self.nodes.contains_key(p));
        self.nodes.insert(
            id,
            MockNode {
                parent: parent_id,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                text: text.to_string(),
                ..Default::default()
            },
        );
        match parent_id {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(&p) {
                    node.children.push(id);
                }
            }
            None => self.roots.push(id),
        }
        NodeRef(id)
    }

    /// Remove a node and its whole subtree.
    pub fn remove(&mut self, node: NodeRef) {
        let Some(removed) = self.nodes.remove(&node.0) else {
            return;
        };
        match removed.parent {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(&p) {
                    parent.children.retain(|c| *c != node.0);
                }
            }
            None => self.roots.retain(|r| *r != node.0),
        }
        for child in removed.children {
            self.remove_subtree(child);
        }
    }

    fn remove_subtree(&mut self, id: u64) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }

    pub fn set_text(&mut self, node: NodeRef, text: &str) {
        if let Some(n) = self.nodes.get_mut(&node.0) {
            n.text = text.to_string();
        }
    }

    pub fn set_tags(&mut self, node: NodeRef, tags: &[&str]) {
        if let Some(n) = self.nodes.get_mut(&node.0) {
            n.tags = tags.iter().map(|t| t.to_string()).collect();
        }
    }

    pub fn set_busy(&mut self, busy: Option<bool>) {
        self.busy = busy;
    }

    pub fn exists(&self, node: NodeRef) -> bool {
        self.nodes.contains_key(&node.0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Clear all recorded actions.
    pub fn clear_actions(&mut self) {
        self.actions.clear();
    }

    /// Node ids in document (pre-order) order.
    fn document_order(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<u64> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn has_tags(&self, id: u64, tags: &[String]) -> bool {
        self.nodes
            .get(&id)
            .map(|n| tags.iter().all(|t| n.tags.contains(t)))
            .unwrap_or(false)
    }

    fn is_descendant(&self, id: u64, ancestor: u64) -> bool {
        let mut cur = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.nodes.get(&p).and_then(|n| n.parent);
        }
        false
    }

    fn matches(&self, id: u64, steps: &[Vec<String>]) -> bool {
        let Some((last, rest)) = steps.split_last() else {
            return false;
        };
        if !self.has_tags(id, last) {
            return false;
        }
        // Walk ancestors, consuming the remaining steps right to left.
        let mut pending = rest.iter().rev().peekable();
        let mut cur = self.nodes.get(&id).and_then(|n| n.parent);
        while let (Some(step), Some(p)) = (pending.peek(), cur) {
            if self.has_tags(p, step) {
                pending.next();
            }
            cur = self.nodes.get(&p).and_then(|n| n.parent);
        }
        pending.peek().is_none()
    }

    fn collect_text(&self, id: u64, out: &mut Vec<String>) {
        if let Some(node) = self.nodes.get(&id) {
            let own = node.text.trim();
            if !own.is_empty() {
                out.push(own.to_string());
            }
            for child in &node.children {
                self.collect_text(*child, out);
            }
        }
    }
}

/// Parse a matcher into descendant steps, each a set of required tags.
fn parse_matcher(matcher: &str) -> Result<Vec<Vec<String>>, MatcherError> {
    if matcher.trim().is_empty() {
        return Err(MatcherError::new(matcher, "empty matcher"));
    }
    let mut steps = Vec::new();
    for step in matcher.split_whitespace() {
        let mut tags = Vec::new();
        for tag in step.split('.') {
            if tag.is_empty() {
                return Err(MatcherError::new(matcher, "empty tag"));
            }
            if let Some(bad) = tag
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
            {
                return Err(MatcherError::new(
                    matcher,
                    format!("unexpected character '{}'", bad),
                ));
            }
            tags.push(tag.to_string());
        }
        steps.push(tags);
    }
    Ok(steps)
}

impl SnapshotProvider for MockUi {
    fn snapshot(&self, matchers: &[String], scope: Option<NodeRef>) -> Snapshot {
        let mut snap = Snapshot::default();
        let mut parsed = Vec::new();
        for m in matchers {
            match parse_matcher(m) {
                Ok(steps) => parsed.push(steps),
                Err(e) => snap.errors.push(e),
            }
        }
        if let Some(s) = scope {
            if !self.exists(s) {
                return snap;
            }
        }
        for id in self.document_order() {
            if let Some(s) = scope {
                if !self.is_descendant(id, s.0) {
                    continue;
                }
            }
            if parsed.iter().any(|steps| self.matches(id, steps)) {
                snap.nodes.push(NodeRef(id));
            }
        }
        snap
    }

    fn text(&self, node: NodeRef) -> Option<String> {
        if !self.exists(node) {
            return None;
        }
        let mut parts = Vec::new();
        self.collect_text(node.0, &mut parts);
        Some(parts.join(" "))
    }

    fn attribute(&self, node: NodeRef, key: &str) -> Option<String> {
        self.nodes.get(&node.0).and_then(|n| n.attrs.get(key).cloned())
    }

    fn set_attribute(&mut self, node: NodeRef, key: &str, value: &str) -> Result<(), ActionError> {
        let n = self
            .nodes
            .get_mut(&node.0)
            .ok_or(ActionError::StaleNode(node.0))?;
        n.attrs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn busy_hint(&self) -> Option<bool> {
        self.busy
    }
}

impl ActionExecutor for MockUi {
    fn perform(&mut self, action: &Action) -> Result<(), ActionError> {
        if self.fail_actions {
            return Err(ActionError::Rejected(action.describe()));
        }
        match action {
            Action::Click { node } | Action::Type { node, .. } if !self.exists(*node) => {
                return Err(ActionError::StaleNode(node.0));
            }
            _ => {}
        }
        self.actions.push(action.clone());
        Ok(())
    }
}
