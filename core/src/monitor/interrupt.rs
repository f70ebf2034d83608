//! Global Interrupt: conditions that block all other interaction and must be
//! resolved before any per-task dispatch in the same tick.

use serde::Serialize;
use tracing::debug;

use crate::data::selectors::keys;
use crate::monitor::page::{contains_any, Page};
use crate::types::action::NodeRef;
use crate::types::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    ConfirmPopover,
    InteractiveTerminal,
    TaskComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Modal confirmation overlay; click its confirm control.
    ConfirmPopover { confirm: NodeRef },
    /// Latest terminal waits for a keystroke.
    InteractiveTerminal { input: NodeRef },
    /// The "task complete" banner is showing.
    TaskComplete,
}

impl Interrupt {
    pub fn kind(&self) -> InterruptKind {
        match self {
            Interrupt::ConfirmPopover { .. } => InterruptKind::ConfirmPopover,
            Interrupt::InteractiveTerminal { .. } => InterruptKind::InteractiveTerminal,
            Interrupt::TaskComplete => InterruptKind::TaskComplete,
        }
    }
}

pub fn popover_visible(page: &Page<'_>) -> bool {
    page.exists(keys::POPOVER_BODY)
}

/// A delete-files card in the latest turn is waiting for confirmation.
pub fn delete_confirmation_pending(page: &Page<'_>) -> bool {
    page.latest_assistant_turn()
        .map(|turn| !page.within(keys::TERMINAL_DELETE_CONFIRM, turn).is_empty())
        .unwrap_or(false)
}

/// The last status banner reads as task complete.
pub fn task_complete_banner(page: &Page<'_>, settings: &Settings) -> bool {
    page.all(keys::STATUS_BANNER)
        .last()
        .map(|n| page.text(*n).trim().eq_ignore_ascii_case(settings.task_complete_text.trim()))
        .unwrap_or(false)
}

/// Input of the latest terminal card when its output asks for a keystroke.
pub fn interactive_terminal_input(page: &Page<'_>, settings: &Settings) -> Option<NodeRef> {
    let card = page.all(keys::TERMINAL_CARD).into_iter().last()?;
    if !contains_any(&page.text(card), &settings.interactive_phrases) {
        return None;
    }
    page.within(keys::TERMINAL_INPUT, card).into_iter().next()
}

/// Highest-precedence interrupt on the page, if any.
pub fn detect(page: &Page<'_>, settings: &Settings) -> Option<Interrupt> {
    if popover_visible(page) {
        let confirm = page
            .first(keys::POPOVER_CONFIRM)
            .or_else(|| page.first(keys::POPOVER_PRIMARY));
        match confirm {
            Some(confirm) => return Some(Interrupt::ConfirmPopover { confirm }),
            None => debug!("popover without a confirm control"),
        }
    }
    if let Some(input) = interactive_terminal_input(page, settings) {
        return Some(Interrupt::InteractiveTerminal { input });
    }
    if task_complete_banner(page, settings) {
        return Some(Interrupt::TaskComplete);
    }
    None
}
