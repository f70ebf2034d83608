use serde::{Deserialize, Serialize};

/// Opaque handle to one node of the external element tree.
///
/// Handles are only meaningful for the snapshot they came from; the core
/// never stores them across ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(pub u64);

/// An abstract UI action. Performing one is fire-and-forget; success is
/// confirmed later by task verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click { node: NodeRef },
    Type { node: NodeRef, text: String },
    Submit,
}

impl Action {
    pub fn describe(&self) -> String {
        match self {
            Action::Click { node } => format!("click #{}", node.0),
            Action::Type { node, text } => {
                format!("type #{} {:?}", node.0, text)
            }
            Action::Submit => "submit".into(),
        }
    }
}
