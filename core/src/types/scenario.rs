use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Where a scenario definition came from. Custom files override built-ins
/// with the same id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioSource {
    #[default]
    Builtin,
    Custom,
}

/// One configuration-declared recovery scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Shared exclusion window for the group; settings supply the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_cooldown_ms: Option<u64>,
    /// Only eligible once the agent has been seen working in this session.
    #[serde(default)]
    pub requires_active_history: bool,
    #[serde(default)]
    pub detection: Detection,
    pub action: RecoveryRule,
    #[serde(default)]
    pub source: ScenarioSource,
}

/// Match criteria, evaluated cheapest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Detection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_check: Option<TextCheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationCheck>,
    /// When non-empty, a match is dropped unless one of these markers is
    /// present in the aggregate chat content.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub incomplete_markers: Vec<String>,
}

/// Structured check of one text region: the nodes found by `matcher` must
/// contain `text` or match `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextCheck {
    pub matcher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default = "default_true")]
    pub latest_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_idle_ms: Option<u64>,
    /// Also require one of the content checks to hit.
    #[serde(default)]
    pub require_match: bool,
}

/// Recovery performed when a scenario wins a tick.
///
/// Matcher fields accept either a raw matcher expression or a selector
/// reference of the form `@category/name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveryRule {
    Click {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_text: Option<String>,
    },
    /// Send a message; `None` sends the configured continue message.
    Type {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Wait { wait_ms: u64 },
    Log { message: String },
    Custom { handler: CustomHandler },
}

impl RecoveryRule {
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryRule::Click { .. } => "click",
            RecoveryRule::Type { .. } => "type",
            RecoveryRule::Wait { .. } => "wait",
            RecoveryRule::Log { .. } => "log",
            RecoveryRule::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomHandler {
    /// New conversation, keep changes, continue.
    ResetContext,
    /// Click the skip control of the latest terminal card.
    SkipAfterTimeout,
    /// Send the interactive keystroke to the latest terminal input.
    InteractiveInput,
}
