//! Task Registry: identity stamping, lifecycle, verification and capacity.
//!
//! Each observed task node is stamped once with `TASK_ID_ATTR`. The stamp
//! carries the registry generation, so after `reset()` nodes left over from
//! the previous conversation are treated as unseen and stamped again, while
//! nodes evicted in the current generation stay forgotten.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::data::selectors::{keys, SelectorTable};
use crate::infrastructure::{select, SnapshotProvider};
use crate::tasks::classify::{
    cached_flags, classify_with_rule, has_actionable_control, has_skip_control, NodeInspector,
};
use crate::tasks::priority::{self, PendingOp};
use crate::types::action::NodeRef;
use crate::types::config::Settings;
use crate::types::task::{TaskId, TaskStatus, TaskType, TrackedTask, VerifyKind};

/// Attribute used to stamp task identity onto observed nodes.
pub const TASK_ID_ATTR: &str = "data-keepalive-task-id";

fn stamp(generation: u64, seq: u64) -> String {
    format!("g{}-t{}", generation, seq)
}

fn stamp_generation(value: &str) -> Option<u64> {
    value
        .strip_prefix('g')
        .and_then(|rest| rest.split_once("-t"))
        .and_then(|(generation, _)| generation.parse().ok())
}

/// What changed during one `update` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Task nodes visible this tick, tracked or not.
    pub observed: usize,
    pub registered: Vec<TaskId>,
    pub handled: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub evicted: Vec<TaskId>,
}

/// One row of the debug dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    pub verify_deadline_ms: Option<u64>,
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TrackedTask>,
    /// Insertion order; the front is evicted first.
    order: VecDeque<TaskId>,
    /// Tracked tasks visible in the latest snapshot: document position and node.
    present: HashMap<TaskId, (usize, NodeRef)>,
    generation: u64,
    next_seq: u64,
    capacity: usize,
    click_timeout_ms: u64,
    resume_timeout_ms: u64,
    reset_flow_ms: u64,
}

impl TaskRegistry {
    pub fn new(settings: &Settings) -> Self {
        TaskRegistry {
            tasks: HashMap::new(),
            order: VecDeque::new(),
            present: HashMap::new(),
            generation: 1,
            next_seq: 1,
            capacity: settings.max_tracked_tasks.max(1),
            click_timeout_ms: settings.click_verify_timeout_ms,
            resume_timeout_ms: settings.resume_verify_timeout_ms,
            reset_flow_ms: settings.reset_keep_delay_ms
                + settings.reset_resume_delay_ms
                + settings.submit_delay_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &TaskId) -> Option<&TrackedTask> {
        self.tasks.get(id)
    }

    /// Node of a tracked task in the latest snapshot.
    pub fn node_of(&self, id: &TaskId) -> Option<NodeRef> {
        self.present.get(id).map(|(_, node)| *node)
    }

    /// Tracked tasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Forget everything and start a new stamp generation.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.tasks.clear();
        self.order.clear();
        self.present.clear();
        info!(generation = self.generation, "task registry reset");
    }

    /// Scan the snapshot, register new nodes, re-examine known ones, resolve
    /// verifications and enforce capacity.
    pub fn update(
        &mut self,
        ui: &mut dyn SnapshotProvider,
        selectors: &SelectorTable,
        settings: &Settings,
        busy: bool,
        now_ms: u64,
    ) -> UpdateReport {
        let mut report = UpdateReport::default();
        self.present.clear();

        let nodes = select(&*ui, selectors.matchers(keys::TASK_NODE), None);
        report.observed = nodes.len();

        for (position, node) in nodes.into_iter().enumerate() {
            let existing = ui
                .attribute(node, TASK_ID_ATTR)
                .filter(|v| stamp_generation(v) == Some(self.generation));
            match existing {
                Some(value) => {
                    let id = TaskId(value);
                    if self.tasks.contains_key(&id) {
                        self.present.insert(id.clone(), (position, node));
                        self.reexamine(&*ui, selectors, settings, &id, node, now_ms);
                    }
                    // Otherwise evicted earlier in this generation; stays forgotten.
                }
                None => {
                    let id = TaskId(stamp(self.generation, self.next_seq));
                    self.next_seq += 1;
                    if let Err(e) = ui.set_attribute(node, TASK_ID_ATTR, id.as_str()) {
                        warn!(error = %e, "could not stamp task node");
                        continue;
                    }
                    let inspector = NodeInspector {
                        ui: &*ui,
                        selectors,
                        settings,
                        node,
                    };
                    self.register(&inspector, id.clone(), now_ms);
                    self.present.insert(id.clone(), (position, node));
                    report.registered.push(id);
                }
            }
        }

        self.verify(&*ui, selectors, settings, busy, now_ms, &mut report);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.tasks.remove(&oldest);
                self.present.remove(&oldest);
                debug!(task_id = %oldest, "evicted");
                report.evicted.push(oldest);
            }
        }
        report
    }

    fn register(&mut self, inspector: &NodeInspector<'_>, id: TaskId, now_ms: u64) {
        let text = inspector.ui.text(inspector.node).unwrap_or_default();
        let (task_type, rule) = classify_with_rule(inspector, &text);
        let status = if !task_type.is_operational() {
            TaskStatus::Ignored
        } else if matches!(task_type, TaskType::Click | TaskType::Terminal)
            && !has_actionable_control(inspector)
        {
            // Its control resolved before we ever saw it.
            TaskStatus::Handled
        } else {
            TaskStatus::Pending
        };
        if task_type.is_operational() {
            info!(task_id = %id, kind = task_type.label(), rule = rule.unwrap_or("-"),
                  status = status.label(), "task registered");
        } else {
            debug!(task_id = %id, "info node registered");
        }
        self.tasks.insert(
            id.clone(),
            TrackedTask {
                id: id.clone(),
                task_type,
                status,
                created_at_ms: now_ms,
                verify_deadline_ms: None,
                cached_flags: cached_flags(inspector),
                self_healed: false,
            },
        );
        self.order.push_back(id);
    }

    /// Promote late-rendered content, revive terminal tasks whose controls
    /// came back and keep the flags of pending tasks current. Never
    /// downgrades.
    fn reexamine(
        &mut self,
        ui: &dyn SnapshotProvider,
        selectors: &SelectorTable,
        settings: &Settings,
        id: &TaskId,
        node: NodeRef,
        now_ms: u64,
    ) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let inspector = NodeInspector {
            ui,
            selectors,
            settings,
            node,
        };

        if task.status == TaskStatus::Ignored {
            let text = ui.text(node).unwrap_or_default();
            let (task_type, rule) = classify_with_rule(&inspector, &text);
            let needs_control = matches!(task_type, TaskType::Click | TaskType::Terminal);
            let changed = task_type != task.task_type;
            if changed
                && task_type.is_operational()
                && (!needs_control || has_actionable_control(&inspector))
            {
                info!(task_id = %id, from = task.task_type.label(), to = task_type.label(),
                      rule = rule.unwrap_or("-"), "task promoted");
                task.task_type = task_type;
                task.status = TaskStatus::Pending;
                task.created_at_ms = now_ms;
                task.cached_flags = cached_flags(&inspector);
            }
            return;
        }

        if task.status == TaskStatus::Pending {
            // What dispatch will see; verification compares against it.
            task.cached_flags = cached_flags(&inspector);
            return;
        }

        if task.status == TaskStatus::Handled
            && task.task_type == TaskType::Terminal
            && !task.self_healed
        {
            let flags = cached_flags(&inspector);
            if flags.primary || flags.run || has_skip_control(&inspector) {
                info!(task_id = %id, "terminal control reappeared; back to pending");
                task.status = TaskStatus::Pending;
                task.created_at_ms = now_ms;
                task.cached_flags = flags;
            }
        }
    }

    fn verify(
        &mut self,
        ui: &dyn SnapshotProvider,
        selectors: &SelectorTable,
        settings: &Settings,
        busy: bool,
        now_ms: u64,
        report: &mut UpdateReport,
    ) {
        for id in &self.order {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.status != TaskStatus::Verifying {
                continue;
            }
            let node = self.present.get(id).map(|(_, n)| *n);
            let inspector = node.map(|node| NodeInspector {
                ui,
                selectors,
                settings,
                node,
            });

            let done = match task.task_type.verify_kind() {
                VerifyKind::AgentResumed => busy,
                VerifyKind::ControlGone => match &inspector {
                    None => true,
                    Some(insp) => {
                        let flags = cached_flags(insp);
                        !flags.any() || (task.self_healed && !flags.skip)
                    }
                },
            };
            if done {
                info!(task_id = %id, "task handled");
                task.status = TaskStatus::Handled;
                task.verify_deadline_ms = None;
                report.handled.push(id.clone());
                continue;
            }

            let expired = task.verify_deadline_ms.map(|d| now_ms > d).unwrap_or(true);
            if !expired {
                continue;
            }
            let skip_appeared = task.task_type == TaskType::Terminal
                && !task.self_healed
                && !task.cached_flags.skip
                && inspector.as_ref().map(|i| has_skip_control(i)).unwrap_or(false);
            if skip_appeared {
                info!(task_id = %id, "skip control appeared before the deadline; back to pending");
                task.status = TaskStatus::Pending;
                task.created_at_ms = now_ms;
                task.verify_deadline_ms = None;
                task.self_healed = true;
            } else {
                warn!(task_id = %id, kind = task.task_type.label(), "verification timed out");
                task.status = TaskStatus::Failed;
                report.failed.push(id.clone());
            }
        }
    }

    /// The single task to dispatch this tick, if any.
    pub fn next_pending_op(&self) -> Option<PendingOp> {
        priority::pick(self.present.iter().filter_map(|(id, (position, node))| {
            self.tasks.get(id).map(|task| (task, *position, *node))
        }))
    }

    /// Move a dispatched task to `Verifying` with a deadline for its kind.
    pub fn mark_verifying(&mut self, id: &TaskId, now_ms: u64) {
        let (click, resume, reset) = (
            self.click_timeout_ms,
            self.resume_timeout_ms,
            self.reset_flow_ms,
        );
        if let Some(task) = self.tasks.get_mut(id) {
            let timeout = match task.task_type {
                TaskType::ResetContinue => resume + reset,
                t if t.verify_kind() == VerifyKind::AgentResumed => resume,
                _ => click,
            };
            task.status = TaskStatus::Verifying;
            task.verify_deadline_ms = Some(now_ms + timeout);
            debug!(task_id = %id, deadline = now_ms + timeout, "verifying");
        }
    }

    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(id) {
            info!(task_id = %id, from = task.status.label(), to = status.label(), "task status");
            task.status = status;
        }
    }

    // -----------------------------------------------------------------------
    // Debug dump
    // -----------------------------------------------------------------------

    pub fn dump(&self) -> Vec<TaskSnapshot> {
        self.iter()
            .map(|t| TaskSnapshot {
                id: t.id.clone(),
                task_type: t.task_type,
                status: t.status,
                created_at_ms: t.created_at_ms,
                verify_deadline_ms: t.verify_deadline_ms,
                present: self.present.contains_key(&t.id),
            })
            .collect()
    }

    pub fn render_table(&self) -> String {
        let mut out = format!(
            "{:<14} {:<15} {:<10} {:>12} {:>12} {}\n",
            "ID", "TYPE", "STATUS", "CREATED", "DEADLINE", "VISIBLE"
        );
        for row in self.dump() {
            out.push_str(&format!(
                "{:<14} {:<15} {:<10} {:>12} {:>12} {}\n",
                row.id.as_str(),
                row.task_type.label(),
                row.status.label(),
                row.created_at_ms,
                row.verify_deadline_ms
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into()),
                if row.present { "yes" } else { "no" },
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::settings::default_settings;
    use crate::infrastructure::mock::MockUi;

    struct Fixture {
        ui: MockUi,
        selectors: SelectorTable,
        settings: Settings,
        registry: TaskRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let settings = default_settings();
            Fixture {
                ui: MockUi::new(),
                selectors: SelectorTable::default(),
                registry: TaskRegistry::new(&settings),
                settings,
            }
        }

        fn update(&mut self, busy: bool, now_ms: u64) -> UpdateReport {
            self.registry
                .update(&mut self.ui, &self.selectors, &self.settings, busy, now_ms)
        }

        fn terminal(&mut self) -> (NodeRef, NodeRef) {
            let task = self.ui.add(None, &["agent-task"], "");
            let card = self.ui.add(Some(task), &["run-command-card"], "cargo test");
            let run = self.ui.add(Some(card), &["run-command-btn-run"], "Run");
            (task, run)
        }

        fn only_id(&self) -> TaskId {
            self.registry.iter().next().map(|t| t.id.clone()).unwrap()
        }
    }

    #[test]
    fn stamp_parsing() {
        assert_eq!(stamp_generation(&stamp(3, 17)), Some(3));
        assert_eq!(stamp_generation("t1"), None);
        assert_eq!(stamp_generation("gx-t1"), None);
    }

    #[test]
    fn new_nodes_are_stamped_and_classified() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        let info = f.ui.add(None, &["agent-task"], "All tests passed.");
        let report = f.update(false, 0);
        assert_eq!(report.registered.len(), 2);
        assert!(f.ui.attribute(task, TASK_ID_ATTR).is_some());
        let statuses: Vec<_> = f.registry.iter().map(|t| (t.task_type, t.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (TaskType::Terminal, TaskStatus::Pending),
                (TaskType::Info, TaskStatus::Ignored)
            ]
        );
        // Stable across ticks.
        let again = f.update(false, 5000);
        assert!(again.registered.is_empty());
        assert_eq!(f.registry.len(), 2);
        assert!(f.ui.attribute(info, TASK_ID_ATTR).is_some());
    }

    #[test]
    fn terminal_without_controls_registers_handled() {
        let mut f = Fixture::new();
        let task = f.ui.add(None, &["agent-task"], "");
        f.ui.add(Some(task), &["run-command-card"], "ls");
        f.update(false, 0);
        let t = f.registry.iter().next().unwrap();
        assert_eq!(t.task_type, TaskType::Terminal);
        assert_eq!(t.status, TaskStatus::Handled);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut f = Fixture::new();
        let nodes: Vec<NodeRef> = (0..55)
            .map(|i| f.ui.add(None, &["agent-task"], &format!("note {}", i)))
            .collect();
        let report = f.update(false, 0);
        assert_eq!(f.registry.len(), 50);
        assert_eq!(report.evicted.len(), 5);
        let first_five: Vec<String> = nodes[..5]
            .iter()
            .map(|n| f.ui.attribute(*n, TASK_ID_ATTR).unwrap())
            .collect();
        let evicted: Vec<String> = report.evicted.iter().map(|id| id.0.clone()).collect();
        assert_eq!(evicted, first_five);

        // Evicted nodes are not re-registered on later ticks.
        let report = f.update(false, 5000);
        assert!(report.registered.is_empty());
        assert_eq!(f.registry.len(), 50);
    }

    #[test]
    fn terminal_verification_handled_when_control_disappears() {
        let mut f = Fixture::new();
        let (_, run) = f.terminal();
        f.update(false, 0);
        let id = f.only_id();
        let op = f.registry.next_pending_op().unwrap();
        assert_eq!(op.id, id);
        f.registry.mark_verifying(&id, 0);
        assert_eq!(f.registry.get(&id).unwrap().verify_deadline_ms, Some(10000));

        f.update(false, 5000);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Verifying);

        f.ui.remove(run);
        let report = f.update(false, 8000);
        assert_eq!(report.handled, vec![id.clone()]);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Handled);
    }

    #[test]
    fn terminal_verification_fails_past_deadline() {
        let mut f = Fixture::new();
        f.terminal();
        f.update(false, 0);
        let id = f.only_id();
        f.registry.mark_verifying(&id, 0);
        let report = f.update(false, 10001);
        assert_eq!(report.failed, vec![id.clone()]);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn terminal_timeout_with_new_skip_control_returns_to_pending() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        f.update(false, 0);
        let id = f.only_id();
        f.registry.mark_verifying(&id, 0);
        f.ui.add(Some(task), &["button", "btn-tertiary"], "Skip");
        let report = f.update(false, 10001);
        assert!(report.failed.is_empty());
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn terminal_timeout_with_skip_present_at_dispatch_fails() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        f.ui.add(Some(task), &["button", "btn-tertiary"], "Skip");
        f.update(false, 0);
        let id = f.only_id();
        assert!(f.registry.get(&id).unwrap().cached_flags.skip);
        f.registry.mark_verifying(&id, 0);
        let report = f.update(false, 10001);
        assert_eq!(report.failed, vec![id.clone()]);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn skip_self_heal_happens_once() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        f.update(false, 0);
        let id = f.only_id();
        f.registry.mark_verifying(&id, 0);
        f.ui.add(Some(task), &["button", "btn-tertiary"], "Skip");
        f.update(false, 10001);
        let t = f.registry.get(&id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.self_healed);

        // Second timeout with the skip control still there fails for good.
        f.update(false, 15000);
        f.registry.mark_verifying(&id, 15000);
        let report = f.update(false, 25001);
        assert_eq!(report.failed, vec![id.clone()]);
    }

    #[test]
    fn healed_task_handled_once_skip_is_gone() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        f.update(false, 0);
        let id = f.only_id();
        f.registry.mark_verifying(&id, 0);
        let skip = f.ui.add(Some(task), &["button", "btn-tertiary"], "Skip");
        f.update(false, 10001);
        f.registry.mark_verifying(&id, 15000);
        f.ui.remove(skip);
        let report = f.update(false, 16000);
        assert_eq!(report.handled, vec![id.clone()]);

        // The run control is still there but the task is not revived.
        f.update(false, 21000);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Handled);
    }

    #[test]
    fn reply_verified_by_busy_signal() {
        let mut f = Fixture::new();
        f.ui.add(None, &["agent-error"], "Model thinking limit reached");
        f.update(false, 0);
        let id = f.only_id();
        assert_eq!(f.registry.get(&id).unwrap().task_type, TaskType::Reply);
        f.registry.mark_verifying(&id, 0);
        assert_eq!(f.registry.get(&id).unwrap().verify_deadline_ms, Some(30000));
        f.update(false, 10000);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Verifying);
        f.update(true, 15000);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Handled);
    }

    #[test]
    fn reset_continue_deadline_covers_flow() {
        let mut f = Fixture::new();
        f.ui.add(None, &["agent-error"], "Context length exceeded");
        f.update(false, 0);
        let id = f.only_id();
        f.registry.mark_verifying(&id, 0);
        assert_eq!(
            f.registry.get(&id).unwrap().verify_deadline_ms,
            Some(30000 + 1000 + 10000 + 300)
        );
    }

    #[test]
    fn ignored_node_promoted_when_content_arrives() {
        let mut f = Fixture::new();
        let task = f.ui.add(None, &["agent-task"], "");
        f.update(false, 0);
        let id = f.only_id();
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Ignored);

        let card = f.ui.add(Some(task), &["run-command-card"], "make");
        f.ui.add(Some(card), &["run-command-btn-run"], "Run");
        f.update(false, 5000);
        let t = f.registry.get(&id).unwrap();
        assert_eq!(t.task_type, TaskType::Terminal);
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.cached_flags.run);
        assert_eq!(t.created_at_ms, 5000);
    }

    #[test]
    fn verifying_task_is_never_downgraded() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        f.update(false, 0);
        let id = f.only_id();
        f.registry.mark_verifying(&id, 0);
        // Content changes so that it would now classify as info.
        f.ui.set_text(task, "");
        f.update(false, 1000);
        let t = f.registry.get(&id).unwrap();
        assert_eq!(t.task_type, TaskType::Terminal);
        assert_eq!(t.status, TaskStatus::Verifying);
    }

    #[test]
    fn handled_terminal_demoted_when_control_reappears() {
        let mut f = Fixture::new();
        let task = f.ui.add(None, &["agent-task"], "");
        let card = f.ui.add(Some(task), &["run-command-card"], "ls");
        f.update(false, 0);
        let id = f.only_id();
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Handled);
        f.ui.add(Some(card), &["run-command-btn-run"], "Run");
        f.update(false, 5000);
        assert_eq!(f.registry.get(&id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn reset_restamps_old_generation_nodes() {
        let mut f = Fixture::new();
        let (task, _) = f.terminal();
        f.update(false, 0);
        let old = f.ui.attribute(task, TASK_ID_ATTR).unwrap();
        f.registry.reset();
        assert!(f.registry.is_empty());
        let report = f.update(false, 5000);
        assert_eq!(report.registered.len(), 1);
        let new = f.ui.attribute(task, TASK_ID_ATTR).unwrap();
        assert_ne!(old, new);
        assert_eq!(stamp_generation(&new), Some(2));
    }

    #[test]
    fn dump_and_table() {
        let mut f = Fixture::new();
        f.terminal();
        f.update(false, 0);
        let dump = f.registry.dump();
        assert_eq!(dump.len(), 1);
        assert!(dump[0].present);
        let table = f.registry.render_table();
        assert!(table.starts_with("ID"));
        assert!(table.contains("terminal"));
        assert!(table.contains("pending"));
    }
}
