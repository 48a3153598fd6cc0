//! The worker loop: pull a runnable EDT, run it, repeat.
//!
//! Grounded on `xe-worker.c` (original_source/ocr)'s `workerLoop`: spin on
//! `isRunning`, pull work, execute, yield to message processing when there
//! isn't any. Run-level bring-up/teardown is a barrier every worker passes
//! through before it's allowed to pull user EDTs at all (spec §9).

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::pd::PolicyDomain;
use crate::runlevel::RunLevel;

/// One OS thread pulling work for a single policy domain. Its lifetime is
/// governed entirely by `pd.is_shutting_down()` / `pd.begin_shutdown()`
/// rather than a private flag, since every worker must observe the same
/// shutdown decision to cross the teardown barrier together.
pub struct Worker {
    id: usize,
    pd: Arc<PolicyDomain>,
}

impl Worker {
    pub fn new(id: usize, pd: Arc<PolicyDomain>) -> Self {
        Self { id, pd }
    }

    /// Spawns the worker's OS thread. Joins once `pd.begin_shutdown()` has
    /// been called and every worker has drained its in-flight work.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            // Bring-up: advance through Config..UserOk in lockstep with
            // every other worker before touching the scheduler. Each level
            // calls `arrive()` exactly once, then spins on `current()`
            // (read-only) until the barrier actually advances — calling
            // `arrive()` again while waiting would count as a second
            // arrival from this same worker and could trip the barrier
            // before the other workers have shown up at all.
            cross_barrier_to(&self.pd.run_level, RunLevel::UserOk);
            loop {
                if let Some(edt) = self.pd.scheduler.take(self.id) {
                    if let Err(e) = self.pd.run_edt(edt) {
                        log::warn!("worker {}: EDT {:?} failed: {}", self.id, edt, e);
                    }
                    continue;
                }
                let processed = self.pd.process_messages();
                if processed == 0 {
                    if self.pd.is_shutting_down() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
            cross_barrier_to(&self.pd.run_level, RunLevel::Config);
        })
    }
}

/// Drives this worker's side of the run-level barrier one phase at a time
/// until it reaches `target`: `arrive()` once, then wait (read-only) for
/// `phases_crossed()` to advance before arriving again. Some levels (spec
/// §4.7's `ComputeOk`/`UserOk`) span more than one phase, so a single
/// `arrive()` doesn't always move `current()` — waiting on `current()`
/// changing directly would spin forever on the first phase of such a level
/// instead of calling `arrive()` a second time for the remaining phase.
fn cross_barrier_to(barrier: &crate::runlevel::RunLevelBarrier, target: RunLevel) {
    while barrier.current() != target {
        let before = barrier.phases_crossed();
        barrier.arrive();
        while barrier.phases_crossed() == before {
            std::thread::yield_now();
        }
    }
}

/// Starts `config.worker_count` workers against one policy domain and
/// returns their join handles alongside stop handles.
pub fn spawn_workers(pd: Arc<PolicyDomain>) -> Vec<JoinHandle<()>> {
    let count = pd.config.worker_count.max(1);
    (0..count)
        .map(|id| Worker::new(id, pd.clone()).spawn())
        .collect()
}
