use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity stamped onto an observed node the first time it is seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of corrective action a tracked node calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Plain content; nothing to do.
    Info,
    /// Reply to the agent with the continue message.
    Reply,
    /// Click a control inside the node (alerts, generic continue).
    Click,
    /// Terminal card: run, delete or skip.
    Terminal,
    /// Regenerate / retry the last turn.
    Restart,
    /// Start a new conversation, keep changes, then continue.
    ResetContinue,
}

/// How a dispatched task is confirmed by later ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyKind {
    /// Done once the agent reports busy again.
    AgentResumed,
    /// Done once the triggering control (or the node) disappears.
    ControlGone,
}

impl TaskType {
    pub fn is_operational(self) -> bool {
        !matches!(self, TaskType::Info)
    }

    /// Dispatch tier; higher runs first.
    pub fn tier(self) -> u32 {
        match self {
            TaskType::Terminal => 100,
            TaskType::Click => 90,
            TaskType::Restart | TaskType::ResetContinue => 80,
            TaskType::Reply => 50,
            TaskType::Info => 0,
        }
    }

    pub fn verify_kind(self) -> VerifyKind {
        match self {
            TaskType::Reply | TaskType::Restart | TaskType::ResetContinue => {
                VerifyKind::AgentResumed
            }
            TaskType::Click | TaskType::Terminal | TaskType::Info => VerifyKind::ControlGone,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskType::Info => "info",
            TaskType::Reply => "reply",
            TaskType::Click => "click",
            TaskType::Terminal => "terminal",
            TaskType::Restart => "restart",
            TaskType::ResetContinue => "reset_continue",
        }
    }
}

/// Lifecycle of a tracked task.
///
/// ```text
/// (new, operational) -> Pending -> Verifying -> Handled
///                          |           |
///                       Skipped      Failed (terminal kind whose skip control
///                                            appeared after dispatch goes back
///                                            to Pending, once)
/// (new, info)        -> Ignored -> Pending   (late-rendered content)
/// Handled (terminal) -> Pending              (actionable control reappeared)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Verifying,
    Handled,
    Failed,
    Skipped,
    Ignored,
}

impl TaskStatus {
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Handled => "handled",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Ignored => "ignored",
        }
    }
}

/// Which actionable controls were present when the node was last classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFlags {
    pub primary: bool,
    pub run: bool,
    pub alert_action: bool,
    /// Skip control visible; not counted by `any`.
    #[serde(default)]
    pub skip: bool,
}

impl CachedFlags {
    pub fn any(&self) -> bool {
        self.primary || self.run || self.alert_action
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    pub verify_deadline_ms: Option<u64>,
    pub cached_flags: CachedFlags,
    /// Already sent back to Pending once by the skip self-heal.
    #[serde(default)]
    pub self_healed: bool,
}
