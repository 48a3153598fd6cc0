//! Open Community Runtime: a task-based parallel runtime built on
//! Event-Driven Tasks (EDTs), Events, and Datablocks over a dataflow
//! dependence graph.
//!
//! This crate is the engine (policy domain, strand table, event/datablock
//! state machines, scheduler, worker loop); [`pd::PolicyDomain`] is the
//! entry point a caller constructs once and drives through [`Runtime`].

pub mod alloc_adapter;
pub mod bitmap;
pub mod config;
pub mod datablock;
pub mod edt;
pub mod error;
pub mod event;
pub mod guid;
pub mod hints;
pub mod message;
pub mod pd;
pub mod runlevel;
pub mod scheduler;
pub mod strand;
pub mod worker;

use std::sync::Arc;

pub use config::RuntimeConfig;
pub use datablock::AccessMode;
pub use edt::{EdtDep, EdtFn};
pub use error::{OcrError, OcrResult};
pub use event::EventKind;
pub use guid::Guid;

use event::RegNode;

/// A running instance: owns the policy domain and its worker threads.
///
/// This is the crate's equivalent of spec §6's external-interface surface —
/// `ocrEdtTemplateCreate`/`ocrEdtCreate`/`ocrEventCreate`/
/// `ocrEventSatisfy(Slot)`/`ocrAddDependence`/`ocrDbCreate`/`ocrDbRelease`/
/// `ocrDbDestroy`/`ocrShutdown`/`ocrSetHint`/`ocrGetHint` — renamed to
/// idiomatic snake_case methods rather than the original's `ocr`-prefixed C
/// names.
pub struct Runtime {
    pd: Arc<pd::PolicyDomain>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Runtime {
    /// Starts a runtime with the given configuration, spawning its worker
    /// threads and driving them through run-level bring-up.
    pub fn start(config: RuntimeConfig) -> Self {
        let pd = pd::PolicyDomain::new(config);
        let workers = worker::spawn_workers(pd.clone());
        Self { pd, workers }
    }

    pub fn edt_template_create(
        &self,
        name: impl Into<String>,
        paramc: Option<u32>,
        depc: Option<u32>,
        func: EdtFn,
    ) -> Guid {
        self.pd.create_edt_template(name, paramc, depc, func)
    }

    /// Creates an EDT instance bound to `template`. `dep_modes[i]` is the
    /// access mode slot `i` will be acquired under once satisfied.
    /// `want_output_event` requests a GUID satisfied with the EDT's return
    /// value; `is_finish` opens a new finish scope whose completion also
    /// satisfies the returned output event; `parent_finish` checks this EDT
    /// into an already-open enclosing scope (pass the third element
    /// returned here by the enclosing finish EDT's own `edt_create` call).
    ///
    /// Returns `(edt, output_event, finish_scope)`; `finish_scope` is
    /// `Some` only when `is_finish` is true, and is what every EDT created
    /// within this one's scope should pass as its own `parent_finish`.
    pub fn edt_create(
        &self,
        template: Guid,
        paramv: Vec<u64>,
        dep_modes: Vec<AccessMode>,
        want_output_event: bool,
        is_finish: bool,
        parent_finish: Option<Guid>,
    ) -> OcrResult<(Guid, Option<Guid>, Option<Guid>)> {
        self.pd.create_edt(template, paramv, dep_modes, want_output_event, is_finish, parent_finish)
    }

    pub fn event_create(
        &self,
        kind: EventKind,
        latch_initial: i64,
        counted_nb_deps: u32,
        channel_capacity: usize,
    ) -> Guid {
        self.pd.create_event(kind, latch_initial, counted_nb_deps, channel_capacity)
    }

    pub fn event_satisfy(&self, event: Guid, payload: Guid) -> OcrResult<()> {
        self.pd.satisfy_event(event, payload, 0)
    }

    pub fn event_satisfy_slot(&self, event: Guid, payload: Guid, slot: u32) -> OcrResult<()> {
        self.pd.satisfy_event(event, payload, slot)
    }

    /// Dispatches to the event-register or EDT-register path depending on
    /// what `dst` resolves to, per spec §6.
    pub fn add_dependence(&self, src: Guid, dst: Guid, slot: u32) -> OcrResult<()> {
        self.pd.add_dependence(src, RegNode { guid: dst, slot })
    }

    pub fn db_create(&self, size: usize, lockable: bool) -> OcrResult<Guid> {
        self.pd.create_datablock(size, lockable)
    }

    pub fn db_destroy(&self, db: Guid) -> OcrResult<()> {
        self.pd.destroy_datablock(db)
    }

    pub fn set_hint(&self, guid: Guid, key: &str, value: u64) -> OcrResult<()> {
        self.pd.set_hint(guid, key, value)
    }

    pub fn get_hint(&self, guid: Guid, key: &str) -> OcrResult<Option<u64>> {
        self.pd.get_hint(guid, key)
    }

    /// Initiates `RL_USER_OK` tear-down: workers finish in-flight EDTs,
    /// drain the strand table, then cross the run-level barrier back down
    /// to `Config` and exit.
    pub fn shutdown(self) {
        self.pd.begin_shutdown();
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn two_edts_linked_by_a_sticky_event_run_in_order() {
        let rt = Runtime::start(RuntimeConfig { worker_count: 2, ..Default::default() });
        let sum = Arc::new(AtomicU64::new(0));
        let sum2 = sum.clone();

        let producer_tmpl = rt.edt_template_create("producer", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL)));
        let (producer, producer_out, _) = rt
            .edt_create(producer_tmpl, vec![], vec![], true, false, None)
            .unwrap();
        let _ = producer;

        let consumer_tmpl = rt.edt_template_create(
            "consumer",
            Some(0),
            Some(1),
            Arc::new(move |_p, _d| {
                sum2.fetch_add(1, Ordering::SeqCst);
                Ok(Guid::NULL)
            }),
        );
        let (consumer, _consumer_out, _) = rt
            .edt_create(consumer_tmpl, vec![], vec![AccessMode::Null], false, false, None)
            .unwrap();

        rt.add_dependence(producer_out.unwrap(), consumer, 0).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        rt.shutdown();
        assert_eq!(sum.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finish_scope_latch_decrements_on_child_completion() {
        let rt = Runtime::start(RuntimeConfig { worker_count: 1, ..Default::default() });
        let tmpl = rt.edt_template_create("child", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL)));
        let (_edt, output, _scope) = rt.edt_create(tmpl, vec![], vec![], false, true, None).unwrap();
        assert!(output.is_some());
        std::thread::sleep(std::time::Duration::from_millis(50));
        rt.shutdown();
    }

    /// Spec §8 scenario 3: a finish EDT spawns several children; its output
    /// event must fire only once every child created inside the scope (not
    /// just the finish EDT itself) has completed.
    #[test]
    fn finish_scope_output_event_waits_for_every_child() {
        let rt = Runtime::start(RuntimeConfig { worker_count: 4, ..Default::default() });
        let completed = Arc::new(AtomicU64::new(0));

        let finish_tmpl = rt.edt_template_create("finish", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL)));
        let (_finish_edt, finish_output, finish_scope) =
            rt.edt_create(finish_tmpl, vec![], vec![], true, true, None).unwrap();
        let finish_scope = finish_scope.unwrap();
        let finish_output = finish_output.unwrap();

        let child_tmpl = rt.edt_template_create(
            "child",
            Some(0),
            Some(0),
            Arc::new({
                let completed = completed.clone();
                move |_p, _d| {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(Guid::NULL)
                }
            }),
        );
        for _ in 0..6 {
            rt.edt_create(child_tmpl, vec![], vec![], false, false, Some(finish_scope)).unwrap();
        }

        // A watcher EDT that depends on the finish output event: it only
        // runs once the latch has actually fired, at which point every
        // child must already have incremented `completed`.
        let observed = Arc::new(AtomicU64::new(0));
        let watcher_tmpl = rt.edt_template_create(
            "watcher",
            Some(0),
            Some(1),
            Arc::new({
                let completed = completed.clone();
                let observed = observed.clone();
                move |_p, _d| {
                    observed.store(completed.load(Ordering::SeqCst), Ordering::SeqCst);
                    Ok(Guid::NULL)
                }
            }),
        );
        let (watcher, _watcher_out, _) = rt
            .edt_create(watcher_tmpl, vec![], vec![AccessMode::Null], false, false, None)
            .unwrap();
        rt.add_dependence(finish_output, watcher, 0).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(200));
        rt.shutdown();
        assert_eq!(completed.load(Ordering::SeqCst), 6);
        assert_eq!(observed.load(Ordering::SeqCst), 6);
    }
}
