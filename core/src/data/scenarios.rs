//! Scenario library: built-in definitions, YAML loading, merge and
//! compilation into a `ScenarioSet` ready for the detector.

use std::collections::HashSet;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::errors::ConfigError;
use crate::types::scenario::{
    CustomHandler, Detection, DurationCheck, RecoveryRule, ScenarioConfig, ScenarioSource,
    TextCheck,
};

// ---------------------------------------------------------------------------
// Built-in library
// ---------------------------------------------------------------------------

fn base(id: &str, name: &str, priority: i32, action: RecoveryRule) -> ScenarioConfig {
    ScenarioConfig {
        id: id.into(),
        name: name.into(),
        description: String::new(),
        enabled: true,
        priority,
        cooldown_ms: None,
        group: None,
        group_cooldown_ms: None,
        requires_active_history: false,
        detection: Detection::default(),
        action,
        source: ScenarioSource::Builtin,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn text_check(matcher: &str, text: Option<&str>, pattern: Option<&str>) -> Option<TextCheck> {
    Some(TextCheck {
        matcher: matcher.into(),
        text: text.map(Into::into),
        pattern: pattern.map(Into::into),
        latest_only: true,
    })
}

fn click(target: &str) -> RecoveryRule {
    RecoveryRule::Click {
        target: target.into(),
        match_text: None,
    }
}

fn send(message: Option<&str>) -> RecoveryRule {
    RecoveryRule::Type {
        message: message.map(Into::into),
    }
}

fn custom(handler: CustomHandler) -> RecoveryRule {
    RecoveryRule::Custom { handler }
}

/// The built-in scenario library, highest priority first.
pub fn builtin() -> Vec<ScenarioConfig> {
    let mut out = Vec::new();

    let mut s = base(
        "delete_file_confirm",
        "Delete file confirmation",
        32,
        click("@terminal/delete_accept"),
    );
    s.description = "A delete-files card is waiting for confirmation".into();
    s.detection.matchers = strings(&["@terminal/delete_confirm"]);
    out.push(s);

    let mut s = base(
        "high_risk_confirm",
        "High-risk confirmation popover",
        31,
        click("@popover/confirm"),
    );
    s.detection.text_check = Some(TextCheck {
        matcher: "@popover/body".into(),
        text: None,
        pattern: None,
        latest_only: false,
    });
    out.push(s);

    let mut s = base("delete_file_card", "Delete file card", 30, click("@terminal/delete_accept"));
    s.detection.text_check = text_check("@terminal/delete_card", Some("Delete"), None);
    out.push(s);

    let mut s = base("system_error", "System error", 25, send(None));
    s.description = "Unknown system error banner in the latest reply".into();
    s.detection.text_check = text_check("@alert/error_message", Some("unknown system error"), None);
    s.cooldown_ms = Some(30000);
    s.group = Some("system-recovery".into());
    out.push(s);

    let mut s = base("output_limit", "Output too long", 21, click("@alert/action"));
    s.detection.text_check = text_check("@alert/candidates", None, Some(r"output (is )?too long"));
    out.push(s);

    let mut s = base(
        "context_limit_exceeded",
        "Context limit exceeded",
        20,
        custom(CustomHandler::ResetContext),
    );
    s.description = "Conversation hit the model context length; start fresh".into();
    s.detection.keywords = strings(&["context length exceeded", "maximum context length"]);
    s.group = Some("system-recovery".into());
    s.group_cooldown_ms = Some(60000);
    out.push(s);

    let mut s = base("send_button_disabled", "Send button disabled", 20, send(None));
    s.detection.text_check = Some(TextCheck {
        matcher: "@chat/send_disabled".into(),
        text: None,
        pattern: None,
        latest_only: false,
    });
    s.requires_active_history = true;
    out.push(s);

    let mut s = base(
        "interactive_command",
        "Interactive command",
        20,
        custom(CustomHandler::InteractiveInput),
    );
    s.detection.text_check = text_check(
        "@terminal/card",
        None,
        Some(r"\[y/n\]|\(y/n\)|\(yes/no\)|press (enter|any key)"),
    );
    out.push(s);

    let mut s = base(
        "sudo_password_skip",
        "Sudo password prompt",
        15,
        custom(CustomHandler::SkipAfterTimeout),
    );
    s.detection.keywords = strings(&["[sudo] password for", "password:"]);
    s.detection.duration = Some(DurationCheck {
        min_idle_ms: Some(5000),
        require_match: true,
    });
    out.push(s);

    let mut s = base(
        "terminal_long_wait_skip",
        "Terminal waiting too long",
        12,
        custom(CustomHandler::SkipAfterTimeout),
    );
    s.detection.matchers = strings(&["@terminal/card"]);
    s.detection.duration = Some(DurationCheck {
        min_idle_ms: Some(180000),
        require_match: true,
    });
    out.push(s);

    let mut s = base(
        "model_limit_reached",
        "Model step limit reached",
        11,
        RecoveryRule::Click {
            target: "@alert/action".into(),
            match_text: Some("Continue".into()),
        },
    );
    s.detection.keywords = strings(&["model step limit reached", "thinking limit reached"]);
    s.cooldown_ms = Some(30000);
    s.group = Some("system-recovery".into());
    out.push(s);

    let mut s = base("task_completed_check", "Task completed check", 10, send(None));
    s.detection.keywords = strings(&["task completed"]);
    s.cooldown_ms = Some(60000);
    out.push(s);

    let mut s = base("run_command_card", "Run command card", 10, click("@terminal/run"));
    s.detection.matchers = strings(&["@terminal/run"]);
    out.push(s);

    let mut s = base(
        "queue_up_alert",
        "Request queued",
        5,
        RecoveryRule::Log {
            message: "request queued upstream; waiting".into(),
        },
    );
    s.detection.keywords = strings(&["queued due to high demand", "position in queue"]);
    out.push(s);

    let mut s = base("agent_ready", "Agent idle after work", 5, send(None));
    s.requires_active_history = true;
    s.detection.duration = Some(DurationCheck::default());
    out.push(s);

    let mut s = base("long_thinking", "Long silence", 4, send(None));
    s.description = "No response for five minutes".into();
    s.detection.duration = Some(DurationCheck {
        min_idle_ms: Some(300000),
        require_match: false,
    });
    out.push(s);

    let mut s = base(
        "premature_completion",
        "Premature completion",
        3,
        send(Some("Some parts are still unfinished. Please continue with the remaining work.")),
    );
    s.detection.keywords = strings(&["completed", "done", "finished"]);
    s.detection.incomplete_markers = strings(&[
        "TODO",
        "FIXME",
        "WIP",
        "work in progress",
        "not implemented",
    ]);
    out.push(s);

    let mut s = base("rate_limit", "Rate limited", 1, RecoveryRule::Wait { wait_ms: 60000 });
    s.detection.keywords = strings(&["rate limit", "too many requests", "try again later"]);
    out.push(s);

    out
}

// ---------------------------------------------------------------------------
// Loading and merge
// ---------------------------------------------------------------------------

/// Parse a YAML document holding a list of scenarios. Every entry is marked
/// as a custom scenario.
pub fn parse(content: &str) -> Result<Vec<ScenarioConfig>, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut list: Vec<ScenarioConfig> = serde_yaml::from_str(content)?;
    let mut seen = HashSet::new();
    for s in &mut list {
        if !seen.insert(s.id.clone()) {
            return Err(ConfigError::DuplicateScenario(s.id.clone()));
        }
        s.source = ScenarioSource::Custom;
    }
    Ok(list)
}

pub fn load_file(path: &Path) -> Result<Vec<ScenarioConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    parse(&content)
}

/// Load every `*.yaml` / `*.yml` file in `dir`, in file-name order. An id
/// declared in two files is an error.
pub fn load_dir(dir: &Path) -> Result<Vec<ScenarioConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::io(dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ConfigError::io(dir, e))?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out: Vec<ScenarioConfig> = Vec::new();
    let mut seen = HashSet::new();
    for path in paths {
        let list = load_file(&path)?;
        debug!(file = %path.display(), count = list.len(), "loaded scenarios");
        for s in list {
            if !seen.insert(s.id.clone()) {
                return Err(ConfigError::DuplicateScenario(s.id));
            }
            out.push(s);
        }
    }
    Ok(out)
}

/// Overlay custom scenarios on the built-ins by id. A custom scenario with a
/// built-in id replaces it in place; new ids are appended.
pub fn merge(builtin: Vec<ScenarioConfig>, custom: Vec<ScenarioConfig>) -> Vec<ScenarioConfig> {
    let mut merged = builtin;
    for mut s in custom {
        s.source = ScenarioSource::Custom;
        match merged.iter_mut().find(|b| b.id == s.id) {
            Some(slot) => *slot = s,
            None => merged.push(s),
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Compiled set
// ---------------------------------------------------------------------------

/// A scenario with its regex fields compiled.
#[derive(Debug, Clone)]
pub struct CompiledScenario {
    pub config: ScenarioConfig,
    pub text_pattern: Option<Regex>,
    pub patterns: Vec<Regex>,
}

/// Validated, ordered scenario list. Order is the configuration order and
/// breaks priority ties in the detector.
#[derive(Debug, Clone, Default)]
pub struct ScenarioSet {
    scenarios: Vec<CompiledScenario>,
}

fn compile_pattern(scenario: &str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::InvalidRegex {
            scenario: scenario.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}

impl ScenarioSet {
    pub fn compile(configs: Vec<ScenarioConfig>) -> Result<ScenarioSet, ConfigError> {
        let mut seen = HashSet::new();
        let mut scenarios = Vec::with_capacity(configs.len());
        for config in configs {
            if !seen.insert(config.id.clone()) {
                return Err(ConfigError::DuplicateScenario(config.id));
            }
            let text_pattern = match config
                .detection
                .text_check
                .as_ref()
                .and_then(|tc| tc.pattern.as_deref())
            {
                Some(p) => Some(compile_pattern(&config.id, p)?),
                None => None,
            };
            let patterns = config
                .detection
                .patterns
                .iter()
                .map(|p| compile_pattern(&config.id, p))
                .collect::<Result<Vec<_>, _>>()?;
            scenarios.push(CompiledScenario {
                config,
                text_pattern,
                patterns,
            });
        }
        Ok(ScenarioSet { scenarios })
    }

    /// Built-ins merged with the custom files in `dir`, if given.
    pub fn load(dir: Option<&Path>) -> Result<ScenarioSet, ConfigError> {
        let custom = match dir {
            Some(d) => load_dir(d)?,
            None => Vec::new(),
        };
        ScenarioSet::compile(merge(builtin(), custom))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledScenario> {
        self.scenarios.iter()
    }

    pub fn get(&self, id: &str) -> Option<&CompiledScenario> {
        self.scenarios.iter().find(|s| s.config.id == id)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Configs sorted by descending priority, for listing.
    pub fn by_priority(&self) -> Vec<&ScenarioConfig> {
        let mut list: Vec<&ScenarioConfig> = self.scenarios.iter().map(|s| &s.config).collect();
        list.sort_by_key(|s| std::cmp::Reverse(s.priority));
        list
    }
}
