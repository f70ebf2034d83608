//! Priority arbitration between pending operational tasks.

use crate::types::action::NodeRef;
use crate::types::task::{TaskId, TaskStatus, TaskType, TrackedTask};

/// A pending task visible in the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub id: TaskId,
    pub task_type: TaskType,
    pub node: NodeRef,
    /// Document position in this tick's snapshot.
    pub position: usize,
}

/// Pick the single task to dispatch: highest tier first, ties broken by
/// document order. Only `Pending` operational tasks qualify.
pub fn pick<'a, I>(candidates: I) -> Option<PendingOp>
where
    I: IntoIterator<Item = (&'a TrackedTask, usize, NodeRef)>,
{
    candidates
        .into_iter()
        .filter(|(task, _, _)| {
            task.status == TaskStatus::Pending && task.task_type.is_operational()
        })
        .max_by(|(a, pa, _), (b, pb, _)| {
            a.task_type
                .tier()
                .cmp(&b.task_type.tier())
                .then_with(|| pb.cmp(pa))
        })
        .map(|(task, position, node)| PendingOp {
            id: task.id.clone(),
            task_type: task.task_type,
            node,
            position,
        })
}
