//! UI effects issued by the dispatch loop: the send guard, dispatch target
//! resolution, the reset-and-continue flow and deferred step execution.
//!
//! Each helper issues at most one action and reports it, so the caller can
//! keep to one action per tick.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::data::selectors::{keys, SelectorTable};
use crate::errors::{ActionError, MatcherError};
use crate::infrastructure::UiBackend;
use crate::monitor::deferred::{DeferredEffect, DeferredQueue, DeferredStep};
use crate::monitor::page::Page;
use crate::tasks::classify::{ButtonLabel, NodeInspector};
use crate::types::action::{Action, NodeRef};
use crate::types::config::Settings;
use crate::types::task::TaskId;

// ---------------------------------------------------------------------------
// Send guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    /// A stop control is showing; the agent is still working.
    AgentWorking,
    /// The latest user turn already says exactly this.
    Duplicate,
    NoInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Action),
    Guarded(GuardReason),
}

fn send_guard(page: &Page<'_>, text: &str) -> Option<GuardReason> {
    if page.exists(keys::CHAT_STOP) {
        return Some(GuardReason::AgentWorking);
    }
    let duplicate = page
        .latest_user_turn()
        .map(|turn| page.text(turn).trim() == text.trim())
        .unwrap_or(false);
    if duplicate {
        return Some(GuardReason::Duplicate);
    }
    None
}

/// Type `text` into the chat input and queue the submit. Guarded sends are
/// reported, not errors.
pub fn send_message<U: UiBackend>(
    ui: &mut U,
    selectors: &SelectorTable,
    settings: &Settings,
    deferred: &mut DeferredQueue,
    text: &str,
    owner: Option<TaskId>,
    now_ms: u64,
) -> Result<SendOutcome, ActionError> {
    let input = {
        let page = Page::new(&*ui, selectors);
        if let Some(reason) = send_guard(&page, text) {
            debug!(?reason, "send suppressed");
            return Ok(SendOutcome::Guarded(reason));
        }
        page.first(keys::CHAT_INPUT)
    };
    let Some(node) = input else {
        warn!("no chat input to type into");
        return Ok(SendOutcome::Guarded(GuardReason::NoInput));
    };
    let action = Action::Type {
        node,
        text: text.to_string(),
    };
    ui.perform(&action)?;
    deferred.schedule(now_ms + settings.submit_delay_ms, owner, DeferredStep::Submit);
    info!(message = %text, "message typed");
    Ok(SendOutcome::Sent(action))
}

// ---------------------------------------------------------------------------
// Target resolution
// ---------------------------------------------------------------------------

/// Control to click for a Terminal / Click / Restart task.
pub fn resolve_target(node: &NodeInspector<'_>) -> Option<NodeRef> {
    node.first(keys::TASK_PRIMARY)
        .or_else(|| node.first(keys::TERMINAL_RUN))
        .or_else(|| node.first(keys::ALERT_ACTION))
        .or_else(|| node.first(keys::ALERT_BUTTON_ACTION))
        .or_else(|| node.first(keys::TASK_TERTIARY))
        .or_else(|| node.labelled_button(ButtonLabel::Skip))
        .or_else(|| node.labelled_button(ButtonLabel::Retry))
        .or_else(|| node.first(keys::TASK_BUTTON))
}

/// Skip control of a terminal task that already timed out once.
pub fn resolve_skip_target(node: &NodeInspector<'_>) -> Option<NodeRef> {
    node.first(keys::TASK_TERTIARY)
        .or_else(|| node.labelled_button(ButtonLabel::Skip))
}

/// Last node matching `expr`, preferring the latest assistant turn, whose
/// text contains `match_text` when given.
pub fn find_click_target(
    page: &Page<'_>,
    expr: &str,
    match_text: Option<&str>,
) -> Result<Option<NodeRef>, MatcherError> {
    let matchers = page.selectors.resolve(expr)?;
    let wanted = match_text.map(str::to_lowercase);
    let accept = |node: &NodeRef| match &wanted {
        Some(w) => page.text(*node).to_lowercase().contains(w.as_str()),
        None => true,
    };
    let mut scopes = Vec::with_capacity(2);
    if let Some(turn) = page.latest_assistant_turn() {
        scopes.push(Some(turn));
    }
    scopes.push(None);
    for scope in scopes {
        let snap = page.ui.snapshot(&matchers, scope);
        if snap.nodes.is_empty() {
            if let Some(err) = snap.errors.into_iter().next() {
                return Err(err);
            }
            continue;
        }
        if let Some(node) = snap.nodes.iter().rev().find(|n| accept(*n)) {
            return Ok(Some(*node));
        }
    }
    Ok(None)
}

/// Skip control of the latest terminal card.
pub fn latest_terminal_skip(page: &Page<'_>, settings: &Settings) -> Option<NodeRef> {
    let card = page.all(keys::TERMINAL_CARD).into_iter().last()?;
    let inspector = NodeInspector {
        ui: page.ui,
        selectors: page.selectors,
        settings,
        node: card,
    };
    inspector
        .first(keys::TASK_TERTIARY)
        .or_else(|| inspector.labelled_button(ButtonLabel::Skip))
}

/// Input of the latest terminal card.
pub fn latest_terminal_input(page: &Page<'_>) -> Option<NodeRef> {
    let card = page.all(keys::TERMINAL_CARD).into_iter().last()?;
    page.within(keys::TERMINAL_INPUT, card).into_iter().next()
}

// ---------------------------------------------------------------------------
// Reset-and-continue flow
// ---------------------------------------------------------------------------

/// Click the new-conversation control and queue the keep-all confirmation
/// and the continue message. `Ok(None)` when there is no new-conversation
/// control.
pub fn start_reset_flow<U: UiBackend>(
    ui: &mut U,
    selectors: &SelectorTable,
    settings: &Settings,
    deferred: &mut DeferredQueue,
    owner: Option<TaskId>,
    now_ms: u64,
) -> Result<Option<Action>, ActionError> {
    let new_chat = Page::new(&*ui, selectors).first(keys::CHAT_NEW);
    let Some(node) = new_chat else {
        return Ok(None);
    };
    let action = Action::Click { node };
    ui.perform(&action)?;

    let keep_at = now_ms + settings.reset_keep_delay_ms;
    deferred.schedule(keep_at, owner.clone(), DeferredStep::ClickKeepAll);
    deferred.schedule(
        keep_at + settings.reset_resume_delay_ms,
        owner,
        DeferredStep::SendMessage(settings.continue_message.clone()),
    );
    info!("new conversation started; continue queued");
    Ok(Some(action))
}

// ---------------------------------------------------------------------------
// Deferred steps
// ---------------------------------------------------------------------------

/// Execute one due deferred step. Steps whose control is gone are dropped.
pub fn run_deferred<U: UiBackend>(
    ui: &mut U,
    selectors: &SelectorTable,
    settings: &Settings,
    deferred: &mut DeferredQueue,
    effect: DeferredEffect,
    now_ms: u64,
) -> Result<Option<Action>, ActionError> {
    match effect.step {
        DeferredStep::Submit => {
            let action = Action::Submit;
            ui.perform(&action)?;
            Ok(Some(action))
        }
        DeferredStep::ClickKeepAll => {
            let keep = Page::new(&*ui, selectors).first(keys::CHAT_KEEP_ALL);
            match keep {
                Some(node) => {
                    let action = Action::Click { node };
                    ui.perform(&action)?;
                    Ok(Some(action))
                }
                None => {
                    debug!("no keep-all confirmation shown");
                    Ok(None)
                }
            }
        }
        DeferredStep::SendMessage(text) => {
            match send_message(ui, selectors, settings, deferred, &text, effect.owner, now_ms)? {
                SendOutcome::Sent(action) => Ok(Some(action)),
                SendOutcome::Guarded(_) => Ok(None),
            }
        }
    }
}
