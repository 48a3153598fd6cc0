//! Scheduling: the interface between "an EDT is runnable" and "a worker
//! runs it".
//!
//! Grounded on `xe-workpile.c` (original_source/ocr), generalized per
//! SPEC_FULL.md into a `Scheduler` trait so a deployment can swap the
//! reference work-stealing policy for something else without touching the
//! worker loop.

use std::collections::VecDeque;

use spin::Mutex;

use crate::guid::Guid;

/// Anything that can hand runnable EDTs to workers and take pushed ones
/// back. `take` is called by an idle worker; `give` is called once an EDT's
/// frontier fully resolves.
pub trait Scheduler: Send + Sync {
    fn give(&self, edt: Guid, worker_hint: usize);
    fn take(&self, worker_id: usize) -> Option<Guid>;
}

/// Per-worker deque plus round-robin stealing from the others, the same
/// shape as the original's work-pile-per-worker layout.
pub struct WorkStealingScheduler {
    queues: Vec<Mutex<VecDeque<Guid>>>,
}

impl WorkStealingScheduler {
    pub fn new(worker_count: usize) -> Self {
        let mut queues = Vec::with_capacity(worker_count.max(1));
        queues.resize_with(worker_count.max(1), || Mutex::new(VecDeque::new()));
        Self { queues }
    }
}

impl Scheduler for WorkStealingScheduler {
    fn give(&self, edt: Guid, worker_hint: usize) {
        let idx = worker_hint % self.queues.len();
        self.queues[idx].lock().push_back(edt);
    }

    fn take(&self, worker_id: usize) -> Option<Guid> {
        let idx = worker_id % self.queues.len();
        if let Some(edt) = self.queues[idx].lock().pop_front() {
            return Some(edt);
        }
        for offset in 1..self.queues.len() {
            let victim = (idx + offset) % self.queues.len();
            if let Some(edt) = self.queues[victim].lock().pop_back() {
                return Some(edt);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{GuidKind, GuidProvider, LocationId};

    #[test]
    fn idle_worker_steals_from_a_busy_peer() {
        let sched = WorkStealingScheduler::new(2);
        let p = GuidProvider::new(LocationId(0));
        let e = p.mint(GuidKind::Edt);
        sched.give(e, 0);
        assert_eq!(sched.take(1), Some(e));
    }
}
