//! Deferred fire-once effects.
//!
//! Follow-up steps with inherent latency (submit after typing, the stages of
//! the reset flow, the stall nudge) are queued here and pumped outside the
//! tick. An effect owned by a task is cancelled when that task is evicted.

use crate::types::task::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredStep {
    /// Submit whatever is in the chat input.
    Submit,
    /// Confirm "keep all changes" after starting a new conversation, if shown.
    ClickKeepAll,
    /// Type a message (send guard applies) and queue its submit.
    SendMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredEffect {
    pub due_ms: u64,
    pub owner: Option<TaskId>,
    pub step: DeferredStep,
}

#[derive(Debug, Clone, Default)]
pub struct DeferredQueue {
    effects: Vec<DeferredEffect>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due_ms: u64, owner: Option<TaskId>, step: DeferredStep) {
        self.effects.push(DeferredEffect {
            due_ms,
            owner,
            step,
        });
    }

    /// Drop every effect owned by `owner`. Returns how many were dropped.
    pub fn cancel_owned(&mut self, owner: &TaskId) -> usize {
        let before = self.effects.len();
        self.effects.retain(|e| e.owner.as_ref() != Some(owner));
        before - self.effects.len()
    }

    /// Remove and return all effects due at `now_ms`, earliest first. Effects
    /// due at the same time keep their scheduling order.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<DeferredEffect> {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.effects.drain(..).partition(|e| e.due_ms <= now_ms);
        self.effects = pending;
        due.sort_by_key(|e| e.due_ms);
        due
    }

    pub fn next_due(&self) -> Option<u64> {
        self.effects.iter().map(|e| e.due_ms).min()
    }

    pub fn clear(&mut self) {
        self.effects.clear();
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_due_in_time_order() {
        let mut q = DeferredQueue::new();
        q.schedule(300, None, DeferredStep::Submit);
        q.schedule(100, None, DeferredStep::ClickKeepAll);
        q.schedule(5000, None, DeferredStep::SendMessage("go".into()));
        let due = q.take_due(300);
        let steps: Vec<_> = due.into_iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![DeferredStep::ClickKeepAll, DeferredStep::Submit]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_due(), Some(5000));
        assert!(q.take_due(4999).is_empty());
    }

    #[test]
    fn cancel_owned_only_hits_owner() {
        let mut q = DeferredQueue::new();
        let a = TaskId("g1-t1".into());
        let b = TaskId("g1-t2".into());
        q.schedule(10, Some(a.clone()), DeferredStep::ClickKeepAll);
        q.schedule(20, Some(a.clone()), DeferredStep::Submit);
        q.schedule(30, Some(b), DeferredStep::Submit);
        q.schedule(40, None, DeferredStep::Submit);
        assert_eq!(q.cancel_owned(&a), 2);
        assert_eq!(q.len(), 2);
        q.clear();
        assert!(q.is_empty());
    }
}
