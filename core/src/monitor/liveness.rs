//! Liveness Monitor: "is the agent working?" and "is it blocked?".
//!
//! Page signals are gathered into `LivenessInputs` first, then `evaluate`
//! applies a fixed precedence, top-down:
//!
//! 1. a blocking error forces not-busy
//! 2. the host's own busy flag, unless the loading text or the input says
//!    it is actually waiting on the user
//! 3. fallback heuristics: queue notice, idle input marker, stop control
//!    (overridden by a visible confirmation popover), loading indicator,
//!    disabled input

use crate::data::selectors::keys;
use crate::monitor::page::{contains_any, Page};
use crate::types::config::Settings;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessInputs {
    pub blocking_error: bool,
    pub busy_hint: Option<bool>,
    /// Text of the first visible loading indicator.
    pub loading_text: Option<String>,
    pub input_idle: bool,
    pub queue_notice: bool,
    pub stop_present: bool,
    pub popover_visible: bool,
    pub input_disabled: bool,
}

/// True when the latest turn or its alerts show a condition the agent cannot
/// get past on its own.
pub fn is_blocking_error(page: &Page<'_>, settings: &Settings) -> bool {
    let Some(turn) = page.latest_assistant_turn() else {
        return false;
    };
    let system_error = page
        .within(keys::ALERT_ERROR, turn)
        .into_iter()
        .any(|n| contains_any(&page.text(n), &settings.system_error_phrases));
    if system_error {
        return true;
    }
    page.within(keys::ALERT_CANDIDATES, turn)
        .into_iter()
        .any(|n| contains_any(&page.text(n), &settings.blocking_phrases))
}

pub fn gather(page: &Page<'_>, settings: &Settings) -> LivenessInputs {
    LivenessInputs {
        blocking_error: is_blocking_error(page, settings),
        busy_hint: page.ui.busy_hint(),
        loading_text: page.first(keys::STATUS_LOADING).map(|n| page.text(n)),
        input_idle: page.exists(keys::CHAT_INPUT_IDLE),
        queue_notice: page
            .all(keys::STATUS_QUEUE)
            .into_iter()
            .any(|n| contains_any(&page.text(n), &settings.queue_phrases)),
        stop_present: page.exists(keys::CHAT_STOP),
        popover_visible: page.exists(keys::POPOVER_BODY),
        input_disabled: page.exists(keys::CHAT_INPUT_DISABLED),
    }
}

pub fn evaluate(inputs: &LivenessInputs, settings: &Settings) -> bool {
    if inputs.blocking_error {
        return false;
    }
    let waiting_text = inputs
        .loading_text
        .as_deref()
        .map(|t| contains_any(t, &settings.idle_phrases))
        .unwrap_or(false);
    if inputs.busy_hint == Some(true) {
        return !(waiting_text || inputs.input_idle);
    }
    if inputs.queue_notice {
        return true;
    }
    if inputs.input_idle {
        return false;
    }
    if inputs.stop_present {
        return !inputs.popover_visible;
    }
    if let Some(text) = inputs.loading_text.as_deref() {
        if contains_any(text, &settings.queue_phrases) {
            return true;
        }
        return !waiting_text;
    }
    inputs.input_disabled
}

pub fn is_busy(page: &Page<'_>, settings: &Settings) -> bool {
    evaluate(&gather(page, settings), settings)
}
