//! Dispatch loop: the integration glue that ties together liveness, the task
//! registry, the global interrupt, scenario recovery and the stall watchdog.
//!
//! `DispatchLoop::tick` runs one pass over the page:
//! 1. Evaluate liveness (busy / blocking error) and observe the stall watchdog.
//!    A new session clears all state and ends the tick.
//! 2. Update the task registry (register, re-examine, verify, evict).
//! 3. Resolve a global interrupt if one is showing.
//! 4. Otherwise dispatch the single highest-priority pending task.
//! 5. Otherwise gate the idle episode and run scenario recovery.
//! 6. Only when nothing was dispatched: stall escalation, else the backup check.
//!
//! At most one action is performed per tick. Follow-up steps are queued on the
//! deferred queue and executed by `pump_deferred`, outside the tick.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::data::scenarios::ScenarioSet;
use crate::data::selectors::{keys, SelectorTable};
use crate::errors::ConfigError;
use crate::infrastructure::UiBackend;
use crate::monitor::actions::{self, GuardReason, SendOutcome};
use crate::monitor::deferred::{DeferredQueue, DeferredStep};
use crate::monitor::interrupt::{self, Interrupt, InterruptKind};
use crate::monitor::liveness;
use crate::monitor::page::Page;
use crate::monitor::stall::{progress_signature, StallCheck, StallWatchdog};
use crate::scenario::{DetectContext, ScenarioDetector, UiProbe};
use crate::tasks::classify::NodeInspector;
use crate::tasks::{PendingOp, TaskRegistry, TaskSnapshot};
use crate::types::action::Action;
use crate::types::config::Settings;
use crate::types::scenario::{CustomHandler, RecoveryRule};
use crate::types::task::{TaskId, TaskStatus, TaskType};

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

/// Scalars carried between ticks. `reset` replaces the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopState {
    /// Consecutive idle ticks in the current episode.
    pub stable_count: u32,
    /// Start of the current idle episode.
    pub idle_since_ms: Option<u64>,
    pub last_action_ms: Option<u64>,
    pub last_busy_ms: Option<u64>,
    /// The agent has been seen working at least once this session.
    pub ever_busy: bool,
    /// Recovery already ran in the current episode.
    pub episode_handled: bool,
    pub last_observed_count: usize,
    /// Task count at which the last episode was handled.
    pub last_handled_count: Option<usize>,
    /// A scenario wait holds recovery and backups until this time.
    pub recovery_hold_until_ms: Option<u64>,
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = LoopState::default();
    }

    pub fn mark_working(&mut self, count: usize, now_ms: u64) {
        self.stable_count = 0;
        self.idle_since_ms = None;
        self.ever_busy = true;
        self.episode_handled = false;
        self.last_busy_ms = Some(now_ms);
        self.last_observed_count = count;
    }

    /// Count one idle tick. Returns true once the episode has been idle for
    /// `required` ticks and still needs recovery.
    ///
    /// A change in task count starts a new episode. An episode already
    /// handled at this count stays closed unless `forced` or `blocking`
    /// re-opens it; a blocking error saturates the count at once.
    pub fn process_stopped_state(
        &mut self,
        count: usize,
        blocking: bool,
        forced: bool,
        required: u32,
        now_ms: u64,
    ) -> bool {
        if count != self.last_observed_count {
            self.last_observed_count = count;
            self.stable_count = 0;
            self.idle_since_ms = None;
            self.episode_handled = false;
        }
        if self.last_handled_count == Some(count) {
            if !(forced || blocking) {
                return false;
            }
            self.last_handled_count = None;
            self.episode_handled = false;
        }
        if self.idle_since_ms.is_none() {
            self.idle_since_ms = Some(now_ms);
        }
        if self.episode_handled {
            return false;
        }
        self.stable_count = if blocking {
            self.stable_count.max(required)
        } else {
            self.stable_count.saturating_add(1)
        };
        self.stable_count >= required
    }

    pub fn mark_episode_handled(&mut self, count: usize) {
        self.episode_handled = true;
        self.last_handled_count = Some(count);
    }

    pub fn mark_action(&mut self, now_ms: u64) {
        self.last_action_ms = Some(now_ms);
        self.stable_count = 0;
    }

    pub fn spacing_ok(&self, spacing_ms: u64, now_ms: u64) -> bool {
        match self.last_action_ms {
            Some(last) => now_ms.saturating_sub(last) >= spacing_ms,
            None => true,
        }
    }

    pub fn held(&self, now_ms: u64) -> bool {
        self.recovery_hold_until_ms.map(|h| now_ms < h).unwrap_or(false)
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        self.idle_since_ms
            .map(|since| now_ms.saturating_sub(since))
            .unwrap_or(0)
    }
}

/// Conditions that re-open an idle episode already handled at this count.
pub fn requires_forced_recheck(page: &Page<'_>, settings: &Settings, blocking: bool) -> bool {
    blocking
        || interrupt::delete_confirmation_pending(page)
        || interrupt::popover_visible(page)
        || interrupt::task_complete_banner(page, settings)
}

/// Conditions that skip the action-spacing guard.
fn spacing_bypass(page: &Page<'_>) -> bool {
    interrupt::popover_visible(page) || interrupt::delete_confirmation_pending(page)
}

// ---------------------------------------------------------------------------
// Tick report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing to do.
    Idle,
    /// The agent is working; idle counters cleared.
    Working,
    SessionReset,
    Interrupt { kind: InterruptKind },
    Dispatched { task_id: TaskId, task_type: TaskType },
    TaskSkipped { task_id: TaskId },
    TaskIgnored { task_id: TaskId },
    Recovery { scenario_id: String, executed: bool },
    /// A scenario matched but the spacing guard held it back.
    Throttled { scenario_id: String },
    StallEscalation,
    Backup,
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub at_ms: u64,
    pub busy: bool,
    pub blocking_error: bool,
    /// Task nodes on the page.
    pub observed_tasks: usize,
    pub outcome: TickOutcome,
    /// The one action performed this tick, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

// ---------------------------------------------------------------------------
// DispatchLoop
// ---------------------------------------------------------------------------

/// Owns every piece of engine state for one chat session.
#[derive(Debug)]
pub struct DispatchLoop {
    settings: Settings,
    selectors: SelectorTable,
    registry: TaskRegistry,
    detector: ScenarioDetector,
    watchdog: StallWatchdog,
    deferred: DeferredQueue,
    state: LoopState,
}

impl DispatchLoop {
    /// Build a loop whose selector table comes from `settings.selectors`.
    pub fn new(settings: Settings, scenarios: ScenarioSet) -> Result<Self, ConfigError> {
        let selectors = crate::data::settings::selector_table(&settings)?;
        Ok(Self::with_selectors(settings, selectors, scenarios))
    }

    pub fn with_selectors(
        settings: Settings,
        selectors: SelectorTable,
        scenarios: ScenarioSet,
    ) -> Self {
        DispatchLoop {
            registry: TaskRegistry::new(&settings),
            detector: ScenarioDetector::new(scenarios, &settings),
            watchdog: StallWatchdog::new(settings.stall_window_ms),
            deferred: DeferredQueue::new(),
            state: LoopState::new(),
            selectors,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn selectors(&self) -> &SelectorTable {
        &self.selectors
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &ScenarioDetector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut ScenarioDetector {
        &mut self.detector
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    /// Debug dump of every tracked task.
    pub fn dump(&self) -> Vec<TaskSnapshot> {
        self.registry.dump()
    }

    /// Clear all lifecycle, detector, watchdog, deferred and loop state.
    pub fn reset(&mut self) {
        self.registry.reset();
        self.detector.reset();
        self.watchdog.reset();
        self.deferred.clear();
        self.state.reset();
        info!("dispatch loop reset");
    }

    fn reset_session(&mut self) {
        self.registry.reset();
        self.detector.reset();
        self.state.reset();
        info!("new session detected; loop state cleared");
    }

    /// Run one tick. Never fails; every problem becomes a task status or a
    /// log line.
    pub fn tick<U: UiBackend>(&mut self, ui: &mut U, now_ms: u64) -> TickReport {
        // Liveness + stall observation
        let (busy, blocking, count, stall) = {
            let page = Page::new(&*ui, &self.selectors);
            let inputs = liveness::gather(&page, &self.settings);
            let busy = liveness::evaluate(&inputs, &self.settings);
            let count = page.task_count();
            let signature = progress_signature(&page, &self.registry, count);
            let stall = self.watchdog.observe(signature.as_deref(), count, now_ms);
            (busy, inputs.blocking_error, count, stall)
        };
        debug!(busy, blocking, count, "tick");

        let mut report = TickReport {
            at_ms: now_ms,
            busy,
            blocking_error: blocking,
            observed_tasks: count,
            outcome: TickOutcome::Idle,
            action: None,
        };

        if let StallCheck::Changed { session_reset: true } = stall {
            self.reset_session();
            report.outcome = TickOutcome::SessionReset;
            return report;
        }

        // Registry
        let update = self
            .registry
            .update(&mut *ui, &self.selectors, &self.settings, busy, now_ms);
        for id in &update.evicted {
            let dropped = self.deferred.cancel_owned(id);
            if dropped > 0 {
                debug!(task_id = %id, dropped, "deferred steps cancelled");
            }
        }

        // Global interrupt
        if let Some((kind, action)) = self.handle_interrupt(ui, now_ms) {
            self.state.mark_action(now_ms);
            report.outcome = TickOutcome::Interrupt { kind };
            report.action = Some(action);
            return report;
        }

        // One pending task
        if let Some(op) = self.registry.next_pending_op() {
            let (outcome, action) = self.dispatch(ui, op, now_ms);
            if action.is_some() {
                self.state.mark_action(now_ms);
            }
            report.outcome = outcome;
            report.action = action;
            return report;
        }

        // Idle episode + scenario recovery
        let mut ready = false;
        if busy {
            self.state.mark_working(count, now_ms);
            report.outcome = TickOutcome::Working;
        } else {
            let forced = {
                let page = Page::new(&*ui, &self.selectors);
                requires_forced_recheck(&page, &self.settings, blocking)
            };
            ready = self.state.process_stopped_state(
                count,
                blocking,
                forced,
                self.settings.stable_ticks,
                now_ms,
            );
            if ready && !self.state.held(now_ms) {
                if let Some((outcome, action)) = self.attempt_recovery(ui, count, now_ms) {
                    report.outcome = outcome;
                    report.action = action;
                    return report;
                }
            }
        }

        // Stall escalation, else backups
        if let StallCheck::Stalled { idle_ms } = stall {
            report.action = self.escalate_stall(ui, idle_ms, now_ms);
            report.outcome = TickOutcome::StallEscalation;
            return report;
        }
        if ready
            && !self.state.held(now_ms)
            && self.state.spacing_ok(self.settings.action_spacing_ms, now_ms)
        {
            if let Some(action) = self.backup_check(ui, now_ms) {
                self.state.mark_action(now_ms);
                report.outcome = TickOutcome::Backup;
                report.action = Some(action);
            }
        }
        report
    }

    /// Execute every deferred step that is due. Returns the actions performed.
    pub fn pump_deferred<U: UiBackend>(&mut self, ui: &mut U, now_ms: u64) -> Vec<Action> {
        let mut performed = Vec::new();
        for effect in self.deferred.take_due(now_ms) {
            let step = format!("{:?}", effect.step);
            match actions::run_deferred(
                ui,
                &self.selectors,
                &self.settings,
                &mut self.deferred,
                effect,
                now_ms,
            ) {
                Ok(Some(action)) => {
                    debug!(step = %step, action = %action.describe(), "deferred step done");
                    performed.push(action);
                }
                Ok(None) => {}
                Err(e) => warn!(step = %step, error = %e, "deferred step failed"),
            }
        }
        performed
    }

    // ----- interrupt -----

    fn handle_interrupt<U: UiBackend>(
        &mut self,
        ui: &mut U,
        now_ms: u64,
    ) -> Option<(InterruptKind, Action)> {
        let found = {
            let page = Page::new(&*ui, &self.selectors);
            interrupt::detect(&page, &self.settings)
        }?;
        let kind = found.kind();
        let result = match found {
            Interrupt::ConfirmPopover { confirm } => {
                let action = Action::Click { node: confirm };
                ui.perform(&action).map(|_| Some(action))
            }
            Interrupt::InteractiveTerminal { input } => {
                let action = Action::Type {
                    node: input,
                    text: format!("{}\n", self.settings.interactive_keystroke),
                };
                ui.perform(&action).map(|_| Some(action))
            }
            Interrupt::TaskComplete => actions::send_message(
                ui,
                &self.selectors,
                &self.settings,
                &mut self.deferred,
                &self.settings.continue_message,
                None,
                now_ms,
            )
            .map(|out| match out {
                SendOutcome::Sent(action) => Some(action),
                SendOutcome::Guarded(_) => None,
            }),
        };
        match result {
            Ok(Some(action)) => {
                info!(?kind, action = %action.describe(), "global interrupt resolved");
                Some((kind, action))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(?kind, error = %e, "global interrupt action failed");
                None
            }
        }
    }

    // ----- task dispatch -----

    fn dispatch<U: UiBackend>(
        &mut self,
        ui: &mut U,
        op: PendingOp,
        now_ms: u64,
    ) -> (TickOutcome, Option<Action>) {
        let PendingOp {
            id, task_type, node, ..
        } = op;
        let dispatched = |id: &TaskId| TickOutcome::Dispatched {
            task_id: id.clone(),
            task_type,
        };

        match task_type {
            TaskType::Reply => match actions::send_message(
                ui,
                &self.selectors,
                &self.settings,
                &mut self.deferred,
                &self.settings.continue_message,
                Some(id.clone()),
                now_ms,
            ) {
                Ok(SendOutcome::Sent(action)) => {
                    self.registry.mark_verifying(&id, now_ms);
                    (dispatched(&id), Some(action))
                }
                Ok(SendOutcome::Guarded(GuardReason::NoInput)) => {
                    self.registry.set_status(&id, TaskStatus::Skipped);
                    (TickOutcome::TaskSkipped { task_id: id }, None)
                }
                Ok(SendOutcome::Guarded(_)) => {
                    // Already said, or the agent is already at it.
                    self.registry.mark_verifying(&id, now_ms);
                    (dispatched(&id), None)
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "reply failed");
                    self.registry.set_status(&id, TaskStatus::Skipped);
                    (TickOutcome::TaskSkipped { task_id: id }, None)
                }
            },
            TaskType::ResetContinue => match actions::start_reset_flow(
                ui,
                &self.selectors,
                &self.settings,
                &mut self.deferred,
                Some(id.clone()),
                now_ms,
            ) {
                Ok(Some(action)) => {
                    self.registry.mark_verifying(&id, now_ms);
                    (dispatched(&id), Some(action))
                }
                Ok(None) => {
                    info!(task_id = %id, "no new-conversation control; task ignored");
                    self.registry.set_status(&id, TaskStatus::Ignored);
                    (TickOutcome::TaskIgnored { task_id: id }, None)
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "reset flow failed");
                    self.deferred.cancel_owned(&id);
                    self.registry.set_status(&id, TaskStatus::Skipped);
                    (TickOutcome::TaskSkipped { task_id: id }, None)
                }
            },
            TaskType::Click | TaskType::Terminal | TaskType::Restart => {
                let healed = self.registry.get(&id).map(|t| t.self_healed).unwrap_or(false);
                let target = {
                    let inspector = NodeInspector {
                        ui: &*ui,
                        selectors: &self.selectors,
                        settings: &self.settings,
                        node,
                    };
                    if healed {
                        actions::resolve_skip_target(&inspector)
                            .or_else(|| actions::resolve_target(&inspector))
                    } else {
                        actions::resolve_target(&inspector)
                    }
                };
                let Some(target) = target else {
                    warn!(task_id = %id, kind = task_type.label(),
                          "no control to click; skipped");
                    self.registry.set_status(&id, TaskStatus::Skipped);
                    return (TickOutcome::TaskSkipped { task_id: id }, None);
                };
                let action = Action::Click { node: target };
                match ui.perform(&action) {
                    Ok(()) => {
                        info!(task_id = %id, kind = task_type.label(),
                              action = %action.describe(), "task dispatched");
                        self.registry.mark_verifying(&id, now_ms);
                        (dispatched(&id), Some(action))
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "click failed; skipped");
                        self.registry.set_status(&id, TaskStatus::Skipped);
                        (TickOutcome::TaskSkipped { task_id: id }, None)
                    }
                }
            }
            TaskType::Info => (TickOutcome::Idle, None),
        }
    }

    // ----- scenario recovery -----

    /// `None` when no scenario matched.
    fn attempt_recovery<U: UiBackend>(
        &mut self,
        ui: &mut U,
        count: usize,
        now_ms: u64,
    ) -> Option<(TickOutcome, Option<Action>)> {
        let (last_message, chat_content, latest_turn, bypass) = {
            let page = Page::new(&*ui, &self.selectors);
            let turn = page.latest_assistant_turn();
            (
                turn.map(|t| page.text(t)).unwrap_or_default(),
                page.chat_history(
                    self.settings.chat_history_turns,
                    self.settings.chat_history_char_limit,
                ),
                turn,
                spacing_bypass(&page),
            )
        };
        let ctx = DetectContext {
            last_message: &last_message,
            chat_content: &chat_content,
            idle_ms: self.state.idle_ms(now_ms),
            ever_busy: self.state.ever_busy,
        };
        let found = {
            let probe = UiProbe {
                ui: &*ui,
                selectors: &self.selectors,
                latest_turn,
            };
            self.detector.detect(&ctx, &probe, now_ms)
        }?;
        let scenario_id = found.scenario_id.clone();

        if !bypass && !self.state.spacing_ok(self.settings.action_spacing_ms, now_ms) {
            debug!(scenario = %scenario_id, "recovery held by action spacing");
            return Some((TickOutcome::Throttled { scenario_id }, None));
        }
        let rule = self
            .detector
            .scenarios()
            .get(&scenario_id)
            .map(|s| s.config.action.clone())?;
        info!(scenario = %scenario_id, priority = found.priority, via = %found.match_info,
              kind = rule.kind(), "scenario matched");

        let (executed, action) = self.execute_recovery(ui, &scenario_id, &rule, now_ms);
        if executed {
            self.detector.mark_triggered(&scenario_id, now_ms);
            self.state.mark_episode_handled(count);
            if action.is_some() {
                self.state.mark_action(now_ms);
            }
        }
        Some((
            TickOutcome::Recovery {
                scenario_id,
                executed,
            },
            action,
        ))
    }

    fn execute_recovery<U: UiBackend>(
        &mut self,
        ui: &mut U,
        scenario_id: &str,
        rule: &RecoveryRule,
        now_ms: u64,
    ) -> (bool, Option<Action>) {
        match rule {
            RecoveryRule::Click { target, match_text } => {
                let found = {
                    let page = Page::new(&*ui, &self.selectors);
                    actions::find_click_target(&page, target, match_text.as_deref())
                };
                match found {
                    Ok(Some(node)) => self.perform(ui, Action::Click { node }),
                    Ok(None) => {
                        warn!(scenario = %scenario_id, selector = %target,
                              "recovery target not found");
                        (false, None)
                    }
                    Err(e) => {
                        warn!(scenario = %scenario_id, matcher = %e.matcher, reason = %e.reason,
                              "bad recovery target");
                        (false, None)
                    }
                }
            }
            RecoveryRule::Type { message } => {
                let text = message
                    .clone()
                    .unwrap_or_else(|| self.settings.continue_message.clone());
                self.send(ui, &text, now_ms)
            }
            RecoveryRule::Wait { wait_ms } => {
                let until = now_ms + wait_ms;
                self.state.recovery_hold_until_ms = Some(until);
                self.deferred.schedule(
                    until,
                    None,
                    DeferredStep::SendMessage(self.settings.continue_message.clone()),
                );
                info!(scenario = %scenario_id, wait_ms, "waiting before continuing");
                (true, None)
            }
            RecoveryRule::Log { message } => {
                info!(scenario = %scenario_id, "{}", message);
                (true, None)
            }
            RecoveryRule::Custom { handler } => self.run_custom(ui, scenario_id, *handler, now_ms),
        }
    }

    fn run_custom<U: UiBackend>(
        &mut self,
        ui: &mut U,
        scenario_id: &str,
        handler: CustomHandler,
        now_ms: u64,
    ) -> (bool, Option<Action>) {
        match handler {
            CustomHandler::ResetContext => match actions::start_reset_flow(
                ui,
                &self.selectors,
                &self.settings,
                &mut self.deferred,
                None,
                now_ms,
            ) {
                Ok(Some(action)) => (true, Some(action)),
                Ok(None) => {
                    warn!(scenario = %scenario_id, "no new-conversation control");
                    (false, None)
                }
                Err(e) => {
                    warn!(scenario = %scenario_id, error = %e, "reset flow failed");
                    (false, None)
                }
            },
            CustomHandler::SkipAfterTimeout => {
                let skip = {
                    let page = Page::new(&*ui, &self.selectors);
                    actions::latest_terminal_skip(&page, &self.settings)
                };
                match skip {
                    Some(node) => self.perform(ui, Action::Click { node }),
                    None => {
                        debug!(scenario = %scenario_id, "no skip control on the latest terminal");
                        (false, None)
                    }
                }
            }
            CustomHandler::InteractiveInput => {
                let input = {
                    let page = Page::new(&*ui, &self.selectors);
                    actions::latest_terminal_input(&page)
                };
                match input {
                    Some(node) => self.perform(
                        ui,
                        Action::Type {
                            node,
                            text: format!("{}\n", self.settings.interactive_keystroke),
                        },
                    ),
                    None => {
                        debug!(scenario = %scenario_id, "no terminal input");
                        (false, None)
                    }
                }
            }
        }
    }

    // ----- stall + backups -----

    /// Stop the agent if it is mid-action, queue the nudge and re-arm.
    fn escalate_stall<U: UiBackend>(
        &mut self,
        ui: &mut U,
        idle_ms: u64,
        now_ms: u64,
    ) -> Option<Action> {
        let stop = Page::new(&*ui, &self.selectors).first(keys::CHAT_STOP);
        let action = stop.and_then(|node| self.perform(ui, Action::Click { node }).1);
        self.deferred.schedule(
            now_ms + self.settings.stall_nudge_delay_ms,
            None,
            DeferredStep::SendMessage(self.settings.stall_message.clone()),
        );
        self.watchdog.rearm(now_ms);
        if action.is_some() {
            self.state.mark_action(now_ms);
        }
        info!(idle_ms, stopped = action.is_some(), "stall escalation; nudge queued");
        action
    }

    fn backup_check<U: UiBackend>(&mut self, ui: &mut U, now_ms: u64) -> Option<Action> {
        let send_disabled = Page::new(&*ui, &self.selectors).exists(keys::CHAT_SEND_DISABLED);
        if !send_disabled {
            return None;
        }
        let continue_message = self.settings.continue_message.clone();
        let (_, action) = self.send(ui, &continue_message, now_ms);
        if action.is_some() {
            info!("send control disabled while idle; continue sent");
        }
        action
    }

    // ----- helpers -----

    fn perform<U: UiBackend>(&mut self, ui: &mut U, action: Action) -> (bool, Option<Action>) {
        match ui.perform(&action) {
            Ok(()) => (true, Some(action)),
            Err(e) => {
                warn!(action = %action.describe(), error = %e, "action failed");
                (false, None)
            }
        }
    }

    fn send<U: UiBackend>(
        &mut self,
        ui: &mut U,
        text: &str,
        now_ms: u64,
    ) -> (bool, Option<Action>) {
        match actions::send_message(
            ui,
            &self.selectors,
            &self.settings,
            &mut self.deferred,
            text,
            None,
            now_ms,
        ) {
            Ok(SendOutcome::Sent(action)) => (true, Some(action)),
            Ok(SendOutcome::Guarded(reason)) => {
                debug!(?reason, "send guarded");
                (false, None)
            }
            Err(e) => {
                warn!(error = %e, "send failed");
                (false, None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::scenarios::{builtin, ScenarioSet};
    use crate::data::settings::default_settings;
    use crate::infrastructure::mock::MockUi;
    use crate::types::action::NodeRef;

    fn engine() -> DispatchLoop {
        let scenarios = ScenarioSet::compile(builtin()).unwrap();
        DispatchLoop::new(default_settings(), scenarios).unwrap()
    }

    fn terminal(ui: &mut MockUi) -> (NodeRef, NodeRef) {
        let task = ui.add(None, &["agent-task"], "");
        ui.add(Some(task), &["run-command-card"], "cargo test");
        let run = ui.add(Some(task), &["run-command-btn-run"], "Run");
        (task, run)
    }

    #[test]
    fn at_most_one_action_per_tick() {
        let mut ui = MockUi::new();
        terminal(&mut ui);
        terminal(&mut ui);
        let alert = ui.add(None, &["agent-task"], "");
        ui.add(Some(alert), &["alert-action"], "Continue");

        let mut lp = engine();
        let report = lp.tick(&mut ui, 0);
        assert_eq!(ui.actions.len(), 1);
        assert!(matches!(
            report.outcome,
            TickOutcome::Dispatched {
                task_type: TaskType::Terminal,
                ..
            }
        ));
    }

    #[test]
    fn dispatch_follows_priority_across_ticks() {
        let mut ui = MockUi::new();
        let input = ui.add(None, &["chat-input"], "");
        ui.add(None, &["agent-task"], "thinking limit reached");
        let click_task = ui.add(None, &["agent-task"], "");
        let alert = ui.add(Some(click_task), &["alert-action"], "Continue");
        let (_, run) = terminal(&mut ui);
        let restart_task = ui.add(None, &["agent-task"], "");
        let retry = ui.add(Some(restart_task), &["button"], "Retry");

        let mut lp = engine();
        lp.tick(&mut ui, 0);
        ui.remove(run);
        lp.tick(&mut ui, 5000);
        ui.remove(alert);
        lp.tick(&mut ui, 10000);
        ui.set_busy(Some(true));
        let last = lp.tick(&mut ui, 15000);

        assert_eq!(
            ui.actions,
            vec![
                Action::Click { node: run },
                Action::Click { node: alert },
                Action::Click { node: retry },
                Action::Type {
                    node: input,
                    text: "Continue".into()
                },
            ]
        );
        assert!(matches!(
            last.outcome,
            TickOutcome::Dispatched {
                task_type: TaskType::Reply,
                ..
            }
        ));
        let statuses: Vec<_> = lp.dump().into_iter().map(|t| (t.task_type, t.status)).collect();
        assert!(statuses.contains(&(TaskType::Terminal, TaskStatus::Handled)));
        assert!(statuses.contains(&(TaskType::Click, TaskStatus::Handled)));
        assert!(statuses.contains(&(TaskType::Restart, TaskStatus::Handled)));
        assert!(statuses.contains(&(TaskType::Reply, TaskStatus::Verifying)));
    }

    #[test]
    fn popover_preempts_pending_tasks() {
        let mut ui = MockUi::new();
        terminal(&mut ui);
        let pop = ui.add(None, &["confirm-popover"], "Run this command?");
        let ok = ui.add(Some(pop), &["confirm-button"], "Confirm");

        let mut lp = engine();
        let report = lp.tick(&mut ui, 0);
        assert_eq!(
            report.outcome,
            TickOutcome::Interrupt {
                kind: InterruptKind::ConfirmPopover
            }
        );
        assert_eq!(ui.actions, vec![Action::Click { node: ok }]);
    }

    #[test]
    fn task_count_drop_resets_session_state() {
        let mut ui = MockUi::new();
        let notes: Vec<NodeRef> = (0..12)
            .map(|i| ui.add(None, &["agent-task"], &format!("note {}", i)))
            .collect();
        let mut lp = engine();
        lp.tick(&mut ui, 0);
        lp.tick(&mut ui, 5000);
        lp.detector_mut().mark_triggered("rate_limit", 5000);
        assert_ne!(*lp.state(), LoopState::default());
        assert!(!lp.detector().is_pristine());
        assert_eq!(lp.registry().len(), 12);

        for n in notes {
            ui.remove(n);
        }
        let report = lp.tick(&mut ui, 10000);
        assert_eq!(report.outcome, TickOutcome::SessionReset);
        assert_eq!(*lp.state(), LoopState::default());
        assert!(lp.detector().is_pristine());
        assert!(lp.registry().is_empty());
    }

    fn step_limit_page() -> (MockUi, NodeRef) {
        let mut ui = MockUi::new();
        ui.add(None, &["user-turn"], "Refactor the parser");
        let turn = ui.add(None, &["assistant-turn"], "");
        ui.add(Some(turn), &["alert-msg"], "model step limit reached");
        let cont = ui.add(Some(turn), &["alert-action"], "Continue");
        ui.add(None, &["chat-input"], "");
        (ui, cont)
    }

    #[test]
    fn step_limit_scenario_clicks_once() {
        let (mut ui, cont) = step_limit_page();
        let mut lp = engine();
        let report = lp.tick(&mut ui, 0);
        assert!(report.blocking_error);
        assert_eq!(
            report.outcome,
            TickOutcome::Recovery {
                scenario_id: "model_limit_reached".into(),
                executed: true
            }
        );
        assert_eq!(ui.actions, vec![Action::Click { node: cont }]);
        assert_eq!(lp.detector().last_triggered("model_limit_reached"), Some(0));

        // Still on screen next tick: cooldown and spacing hold it.
        lp.tick(&mut ui, 5000);
        lp.tick(&mut ui, 10000);
        assert_eq!(ui.actions.len(), 1);
    }

    #[test]
    fn idle_episode_needs_stable_ticks() {
        let mut ui = MockUi::new();
        ui.add(None, &["user-turn"], "go");
        ui.add(None, &["assistant-turn"], "Stopped. rate limit hit, try again later");
        ui.add(None, &["chat-input"], "");

        let mut lp = engine();
        assert_eq!(lp.tick(&mut ui, 0).outcome, TickOutcome::Idle);
        assert_eq!(lp.tick(&mut ui, 5000).outcome, TickOutcome::Idle);
        let third = lp.tick(&mut ui, 10000);
        assert_eq!(
            third.outcome,
            TickOutcome::Recovery {
                scenario_id: "rate_limit".into(),
                executed: true
            }
        );
        assert_eq!(lp.state().recovery_hold_until_ms, Some(70000));
        assert!(lp.state().episode_handled);
        assert!(ui.actions.is_empty());

        // Held; the continue goes out when the wait is over.
        assert_eq!(lp.tick(&mut ui, 15000).outcome, TickOutcome::Idle);
        let sent = lp.pump_deferred(&mut ui, 70000);
        assert!(matches!(sent.as_slice(), [Action::Type { .. }]));
    }

    #[test]
    fn stall_stops_agent_and_queues_nudge() {
        let mut ui = MockUi::new();
        ui.add(None, &["agent-task"], "note");
        ui.add(None, &["assistant-turn"], "Working on it");
        ui.add(None, &["chat-input"], "");
        let stop = ui.add(None, &["stop-button"], "Stop");

        let mut lp = engine();
        assert_eq!(lp.tick(&mut ui, 0).outcome, TickOutcome::Working);
        let report = lp.tick(&mut ui, 400000);
        assert_eq!(report.outcome, TickOutcome::StallEscalation);
        assert_eq!(report.action, Some(Action::Click { node: stop }));

        ui.remove(stop);
        assert!(lp.pump_deferred(&mut ui, 400500).is_empty());
        let nudge = lp.pump_deferred(&mut ui, 401000);
        assert!(matches!(
            nudge.as_slice(),
            [Action::Type { text, .. }] if *text == default_settings().stall_message
        ));
        // Re-armed.
        assert_ne!(lp.tick(&mut ui, 405000).outcome, TickOutcome::StallEscalation);
    }

    #[test]
    fn failed_click_marks_task_skipped() {
        let mut ui = MockUi::new();
        terminal(&mut ui);
        ui.fail_actions = true;
        let mut lp = engine();
        let report = lp.tick(&mut ui, 0);
        assert!(matches!(report.outcome, TickOutcome::TaskSkipped { .. }));
        assert_eq!(lp.dump()[0].status, TaskStatus::Skipped);
        ui.fail_actions = false;
        ui.clear_actions();
        lp.tick(&mut ui, 5000);
        assert!(ui.actions.is_empty());
    }

    #[test]
    fn reset_task_without_new_chat_control_is_ignored() {
        let mut ui = MockUi::new();
        ui.add(None, &["agent-task"], "context length exceeded");
        let mut lp = engine();
        let report = lp.tick(&mut ui, 0);
        assert!(matches!(report.outcome, TickOutcome::TaskIgnored { .. }));
        assert_eq!(lp.dump()[0].status, TaskStatus::Ignored);
        let next = lp.tick(&mut ui, 5000);
        assert!(!matches!(next.outcome, TickOutcome::TaskIgnored { .. }));
    }

    #[test]
    fn stuck_run_control_with_skip_is_clicked_once() {
        let mut ui = MockUi::new();
        let (task, run) = terminal(&mut ui);
        ui.add(Some(task), &["button", "btn-tertiary"], "Skip");
        let mut lp = engine();
        for i in 0..40 {
            lp.tick(&mut ui, i * 5000);
        }
        let run_clicks = ui
            .actions
            .iter()
            .filter(|a| **a == Action::Click { node: run })
            .count();
        assert_eq!(run_clicks, 1);
        assert_eq!(lp.dump()[0].status, TaskStatus::Failed);
    }

    #[test]
    fn late_skip_control_is_clicked_after_timeout() {
        let mut ui = MockUi::new();
        let (task, run) = terminal(&mut ui);
        let mut lp = engine();
        lp.tick(&mut ui, 0);
        let skip = ui.add(Some(task), &["button", "btn-tertiary"], "Skip");
        lp.tick(&mut ui, 5000);
        lp.tick(&mut ui, 10000);
        let report = lp.tick(&mut ui, 15000);
        assert!(matches!(
            report.outcome,
            TickOutcome::Dispatched {
                task_type: TaskType::Terminal,
                ..
            }
        ));
        assert_eq!(
            ui.actions,
            vec![Action::Click { node: run }, Action::Click { node: skip }]
        );
    }

    #[test]
    fn plain_text_turn_gets_stall_nudge() {
        let mut ui = MockUi::new();
        ui.add(None, &["user-turn"], "Refactor the parser");
        ui.add(None, &["assistant-turn"], "Thinking about the refactor...");
        ui.add(None, &["chat-input"], "");
        ui.add(None, &["stop-button"], "Stop");

        let mut lp = engine();
        let escalated = (0..=96)
            .map(|i| lp.tick(&mut ui, i * 5000).outcome)
            .any(|outcome| outcome == TickOutcome::StallEscalation);
        assert!(escalated);
        assert!(!lp.deferred().is_empty());
    }

    fn delete_card_page(need_confirm: bool) -> (MockUi, NodeRef, NodeRef) {
        let mut ui = MockUi::new();
        let (_, run) = terminal(&mut ui);
        ui.add(None, &["user-turn"], "Clean up the build folder");
        let turn = ui.add(None, &["assistant-turn"], "");
        let tags: &[&str] = if need_confirm {
            &["delete-files-card", "need-confirm"]
        } else {
            &["delete-files-card"]
        };
        let card = ui.add(Some(turn), tags, "Delete build/");
        let accept = ui.add(Some(card), &["btn-primary"], "Accept");
        ui.add(None, &["chat-input"], "");
        (ui, run, accept)
    }

    #[test]
    fn pending_delete_confirmation_bypasses_action_spacing() {
        let (mut ui, run, accept) = delete_card_page(true);
        let mut lp = engine();
        lp.tick(&mut ui, 0);
        ui.remove(run);
        lp.tick(&mut ui, 5000);
        lp.tick(&mut ui, 10000);
        let report = lp.tick(&mut ui, 15000);
        assert_eq!(
            report.outcome,
            TickOutcome::Recovery {
                scenario_id: "delete_file_confirm".into(),
                executed: true
            }
        );
        assert_eq!(report.action, Some(Action::Click { node: accept }));
    }

    #[test]
    fn recovery_inside_spacing_window_is_throttled() {
        let (mut ui, run, _) = delete_card_page(false);
        let mut lp = engine();
        lp.tick(&mut ui, 0);
        ui.remove(run);
        lp.tick(&mut ui, 5000);
        lp.tick(&mut ui, 10000);
        let report = lp.tick(&mut ui, 15000);
        assert_eq!(
            report.outcome,
            TickOutcome::Throttled {
                scenario_id: "delete_file_card".into()
            }
        );
        assert_eq!(ui.actions, vec![Action::Click { node: run }]);
    }

    #[test]
    fn evicting_a_task_drops_its_queued_reset_flow() {
        let mut settings = default_settings();
        settings.max_tracked_tasks = 2;
        let scenarios = ScenarioSet::compile(builtin()).unwrap();
        let mut lp = DispatchLoop::new(settings, scenarios).unwrap();

        let mut ui = MockUi::new();
        ui.add(None, &["new-chat"], "New chat");
        ui.add(None, &["agent-task"], "context length exceeded");
        let report = lp.tick(&mut ui, 0);
        assert!(matches!(
            report.outcome,
            TickOutcome::Dispatched {
                task_type: TaskType::ResetContinue,
                ..
            }
        ));
        assert_eq!(lp.deferred().len(), 2);

        ui.add(None, &["agent-task"], "note one");
        ui.add(None, &["agent-task"], "note two");
        lp.tick(&mut ui, 500);
        assert_eq!(lp.registry().len(), 2);
        assert!(lp.deferred().is_empty());
        assert!(lp.pump_deferred(&mut ui, 20000).is_empty());
    }

    #[test]
    fn skipped_dispatch_does_not_arm_spacing() {
        let mut ui = MockUi::new();
        terminal(&mut ui);
        ui.fail_actions = true;
        let mut lp = engine();
        lp.tick(&mut ui, 0);
        assert_eq!(lp.state().last_action_ms, None);
        assert!(lp.state().spacing_ok(60000, 1000));
    }

    #[test]
    fn loop_state_episode_gating() {
        let mut st = LoopState::new();
        assert!(!st.process_stopped_state(2, false, false, 3, 0));
        assert!(!st.process_stopped_state(2, false, false, 3, 5));
        assert!(st.process_stopped_state(2, false, false, 3, 10));
        st.mark_episode_handled(2);
        st.mark_action(10);
        assert!(!st.process_stopped_state(2, false, false, 3, 15));
        // Forced recheck re-opens it.
        assert!(!st.process_stopped_state(2, false, true, 3, 20));
        // A blocking error saturates immediately.
        st.mark_episode_handled(2);
        assert!(st.process_stopped_state(2, true, false, 3, 25));
        // New content starts a new episode.
        st.mark_episode_handled(2);
        assert!(!st.process_stopped_state(3, false, false, 3, 30));
        assert_eq!(st.idle_ms(40), 10);
    }

    #[test]
    fn spacing_guard() {
        let mut st = LoopState::new();
        assert!(st.spacing_ok(60000, 0));
        st.mark_action(1000);
        assert!(!st.spacing_ok(60000, 30000));
        assert!(st.spacing_ok(60000, 61000));
    }

    #[test]
    fn reset_clears_everything() {
        let (mut ui, _) = step_limit_page();
        let mut lp = engine();
        lp.tick(&mut ui, 0);
        lp.reset();
        assert_eq!(*lp.state(), LoopState::default());
        assert!(lp.detector().is_pristine());
        assert!(lp.deferred().is_empty());
        assert!(lp.registry().is_empty());
    }
}
