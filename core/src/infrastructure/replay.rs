//! Replays recorded UI frames through the engine.
//!
//! Each frame is a full description of the visible tree. Nodes are keyed by
//! a recording-stable `key`, so attributes stamped onto a node survive into
//! later frames that still contain the same key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::ActionError;
use crate::types::action::{Action, NodeRef};

use super::mock::MockUi;
use super::{ActionExecutor, Snapshot, SnapshotProvider};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameNode {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy: Option<bool>,
    #[serde(default)]
    pub nodes: Vec<FrameNode>,
}

/// Decode a JSON array of frames.
pub fn decode_frames(json: &str) -> Result<Vec<ReplayFrame>, serde_json::Error> {
    serde_json::from_str(json)
}

#[derive(Debug, Default)]
pub struct ReplayUi {
    ui: MockUi,
    keys: HashMap<NodeRef, String>,
    stamped: HashMap<String, HashMap<String, String>>,
    /// Every action performed across all frames.
    pub actions: Vec<Action>,
}

impl ReplayUi {
    pub fn new() -> Self {
        ReplayUi {
            ui: MockUi::new(),
            ..Default::default()
        }
    }

    /// Replace the visible tree with `frame`. Parents must precede their
    /// children; a node whose parent key is unknown becomes a root.
    pub fn apply(&mut self, frame: &ReplayFrame) {
        let mut ui = MockUi::new();
        ui.set_busy(frame.busy);
        let mut by_key: HashMap<&str, NodeRef> = HashMap::new();
        self.keys.clear();
        for node in &frame.nodes {
            let parent = node.parent.as_deref().and_then(|p| by_key.get(p).copied());
            let tags: Vec<&str> = node.tags.iter().map(String::as_str).collect();
            let handle = ui.add(parent, &tags, &node.text);
            if let Some(attrs) = self.stamped.get(&node.key) {
                for (k, v) in attrs {
                    // The node was just added, so this cannot fail.
                    let _ = ui.set_attribute(handle, k, v);
                }
            }
            by_key.insert(node.key.as_str(), handle);
            self.keys.insert(handle, node.key.clone());
        }
        self.ui = ui;
    }
}

impl SnapshotProvider for ReplayUi {
    fn snapshot(&self, matchers: &[String], scope: Option<NodeRef>) -> Snapshot {
        self.ui.snapshot(matchers, scope)
    }

    fn text(&self, node: NodeRef) -> Option<String> {
        self.ui.text(node)
    }

    fn attribute(&self, node: NodeRef, key: &str) -> Option<String> {
        self.ui.attribute(node, key)
    }

    fn set_attribute(&mut self, node: NodeRef, key: &str, value: &str) -> Result<(), ActionError> {
        self.ui.set_attribute(node, key, value)?;
        if let Some(frame_key) = self.keys.get(&node) {
            self.stamped
                .entry(frame_key.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    fn busy_hint(&self) -> Option<bool> {
        self.ui.busy_hint()
    }
}

impl ActionExecutor for ReplayUi {
    fn perform(&mut self, action: &Action) -> Result<(), ActionError> {
        self.ui.perform(action)?;
        self.actions.push(action.clone());
        Ok(())
    }
}
