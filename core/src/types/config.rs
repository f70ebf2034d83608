use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Selector overrides as written in a settings file:
/// `category -> name -> [matcher, ...]`.
pub type SelectorOverrides = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// All engine tunables. Durations are milliseconds.
///
/// Every field falls back to `data::settings::default_settings()` when absent
/// from the file, so a settings file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub poll_interval_ms: u64,
    /// Consecutive idle ticks before an idle episode is acted on.
    pub stable_ticks: u32,
    pub max_tracked_tasks: usize,
    pub click_verify_timeout_ms: u64,
    pub resume_verify_timeout_ms: u64,
    /// Minimum spacing between recovery actions.
    pub action_spacing_ms: u64,
    pub stall_window_ms: u64,
    pub stall_nudge_delay_ms: u64,
    pub submit_delay_ms: u64,
    pub reset_keep_delay_ms: u64,
    pub reset_resume_delay_ms: u64,
    pub default_group_cooldown_ms: u64,
    pub default_duration_threshold_ms: u64,
    pub history_limit: usize,
    pub chat_history_turns: usize,
    pub chat_history_char_limit: usize,

    pub continue_message: String,
    pub stall_message: String,
    pub interactive_keystroke: String,

    /// Alert text that means the agent cannot progress on its own.
    pub blocking_phrases: Vec<String>,
    /// Error-banner text in the latest turn that blocks progress.
    pub system_error_phrases: Vec<String>,
    /// Loading-indicator text that actually means "waiting on you".
    pub idle_phrases: Vec<String>,
    /// Notice text meaning the request is queued server side.
    pub queue_phrases: Vec<String>,
    /// Terminal output that waits for a keystroke.
    pub interactive_phrases: Vec<String>,
    pub task_complete_text: String,
    pub skip_labels: Vec<String>,
    pub retry_labels: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub selectors: Option<SelectorOverrides>,
}

impl Default for Settings {
    fn default() -> Self {
        crate::data::settings::default_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_json_round_trip() {
        let mut settings = Settings::default();
        settings.stable_ticks = 5;
        settings.skip_labels.push("Dismiss".into());
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let back: Settings = serde_json::from_str(r#"{"poll_interval_ms": 1000}"#).unwrap();
        assert_eq!(back.poll_interval_ms, 1000);
        assert_eq!(back.max_tracked_tasks, 50);
        assert_eq!(back.action_spacing_ms, 60000);
        assert!(back.selectors.is_none());
    }
}
