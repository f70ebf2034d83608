//! Stall Watchdog.
//!
//! Tracks a progress signature of the latest output. When it stays unchanged
//! for longer than the window while output exists, the watchdog reports a
//! stall; the caller escalates and re-arms. A sharp drop in the observed task
//! count is reported as a new session.

use tracing::debug;

use crate::data::selectors::keys;
use crate::monitor::page::Page;
use crate::tasks::{TaskRegistry, TASK_ID_ATTR};
use crate::types::task::TaskId;

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// The signature moved; `session_reset` flags a brand-new conversation.
    Changed { session_reset: bool },
    /// Unchanged, still inside the window.
    Quiet { idle_ms: u64 },
    /// Unchanged past the window while an assistant turn is on screen.
    Stalled { idle_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct StallWatchdog {
    window_ms: u64,
    last_signature: Option<String>,
    last_count: usize,
    last_change_ms: Option<u64>,
}

impl StallWatchdog {
    pub fn new(window_ms: u64) -> Self {
        StallWatchdog {
            window_ms,
            last_signature: None,
            last_count: 0,
            last_change_ms: None,
        }
    }

    pub fn observe(&mut self, signature: Option<&str>, count: usize, now_ms: u64) -> StallCheck {
        let changed = self.last_change_ms.is_none()
            || self.last_signature.as_deref() != signature
            || self.last_count != count;
        if changed {
            let last = self.last_count;
            let session_reset = (last > 1 && count <= 1) || (count == 0 && last > 0);
            if session_reset {
                debug!(from = last, to = count, "task count dropped; new session");
            }
            self.last_signature = signature.map(str::to_string);
            self.last_count = count;
            self.last_change_ms = Some(now_ms);
            return StallCheck::Changed { session_reset };
        }

        let idle_ms = now_ms.saturating_sub(self.last_change_ms.unwrap_or(now_ms));
        if self.last_signature.is_some() && idle_ms > self.window_ms {
            StallCheck::Stalled { idle_ms }
        } else {
            StallCheck::Quiet { idle_ms }
        }
    }

    /// Restart the window after an escalation.
    pub fn rearm(&mut self, now_ms: u64) {
        self.last_change_ms = Some(now_ms);
    }

    pub fn reset(&mut self) {
        *self = StallWatchdog::new(self.window_ms);
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        self.last_change_ms
            .map(|t| now_ms.saturating_sub(t))
            .unwrap_or(0)
    }
}

/// Progress signature of the latest assistant turn: task identity and status
/// when the turn holds a tracked task, otherwise its text length and prefix.
/// `None` when there is no assistant turn at all.
pub fn progress_signature(
    page: &Page<'_>,
    registry: &TaskRegistry,
    count: usize,
) -> Option<String> {
    let turn = page.latest_assistant_turn()?;
    let tracked = page
        .within(keys::TASK_NODE, turn)
        .into_iter()
        .filter_map(|n| page.ui.attribute(n, TASK_ID_ATTR))
        .last()
        .and_then(|id| registry.get(&TaskId(id)));
    if let Some(task) = tracked {
        return Some(format!("{}:{}:{}", count, task.id, task.status.label()));
    }
    let text = page.text(turn);
    let text = text.trim();
    let prefix: String = text
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .take(20)
        .collect();
    Some(format!("{}:{}:{}", count, text.chars().count(), prefix))
}
