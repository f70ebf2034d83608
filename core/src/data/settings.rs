use std::path::Path;

use crate::data::selectors::SelectorTable;
use crate::errors::ConfigError;
use crate::types::config::Settings;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Returns sensible defaults for all settings fields.
pub fn default_settings() -> Settings {
    Settings {
        poll_interval_ms: 5000,
        stable_ticks: 3,
        max_tracked_tasks: 50,
        click_verify_timeout_ms: 10000,
        resume_verify_timeout_ms: 30000,
        action_spacing_ms: 60000,
        stall_window_ms: 360000,
        stall_nudge_delay_ms: 1000,
        submit_delay_ms: 300,
        reset_keep_delay_ms: 1000,
        reset_resume_delay_ms: 10000,
        default_group_cooldown_ms: 30000,
        default_duration_threshold_ms: 30000,
        history_limit: 10,
        chat_history_turns: 6,
        chat_history_char_limit: 4000,
        continue_message: "Continue".into(),
        stall_message: "No progress for a while. Continue the task; if you are stuck, \
                        explain the blocker and try a different approach."
            .into(),
        interactive_keystroke: "y".into(),
        blocking_phrases: strings(&[
            "thinking limit reached",
            "step limit reached",
            "output too long",
        ]),
        system_error_phrases: strings(&["unknown system error"]),
        idle_phrases: strings(&[
            "waiting for your operation",
            "command running",
            "terminal has not returned output",
        ]),
        queue_phrases: strings(&["queued due to high demand", "position in queue"]),
        interactive_phrases: strings(&[
            "[y/n]",
            "(y/n)",
            "(yes/no)",
            "press enter to continue",
            "press any key",
        ]),
        task_complete_text: "Task completed".into(),
        skip_labels: strings(&["Skip"]),
        retry_labels: strings(&["Retry", "Regenerate"]),
        selectors: None,
    }
}

/// Load `Settings` from a YAML file. Missing keys take their defaults.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    parse(&content)
}

/// Save `Settings` to a YAML file.
pub fn save(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let content = serde_yaml::to_string(settings)?;
    std::fs::write(path, content).map_err(|e| ConfigError::io(path, e))
}

/// Parse settings from a YAML string. An empty document yields defaults.
pub fn parse(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(default_settings());
    }
    Ok(serde_yaml::from_str(content)?)
}

/// Build the selector table for these settings, applying any overrides.
pub fn selector_table(settings: &Settings) -> Result<SelectorTable, ConfigError> {
    let mut table = SelectorTable::default();
    if let Some(overrides) = &settings.selectors {
        table.override_from(overrides)?;
    }
    Ok(table)
}
