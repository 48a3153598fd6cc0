//! The policy domain: owns the GUID arena, strand table, scheduler, and
//! run-level barrier, and is the single place messages get dispatched.
//!
//! Grounded on `ce-policy.c` / `policy-domain-tasks.c` (original_source/ocr)
//! for the message-dispatch-and-run-level shape, generalized per
//! SPEC_FULL.md into one in-process `PolicyDomain` (the spec's Non-goals
//! exclude the multi-PD/distributed deployment those files also cover).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::alloc_adapter::{MemoryAllocator, SystemAllocator};
use crate::config::RuntimeConfig;
use crate::datablock::{AccessMode, Datablock};
use crate::edt::{DepSlot, Edt, EdtTemplate};
use crate::error::{AcquireOutcome, OcrError, OcrResult};
use crate::event::{Event, EventKind, RegNode};
use crate::guid::{Guid, GuidKind, GuidProvider, LocationId, ObjectRef};
use crate::hints::HintTable;
use crate::message::PdMessageKind;
use crate::runlevel::RunLevelBarrier;
use crate::scheduler::{Scheduler, WorkStealingScheduler};
use crate::strand::{Action, StrandHandle, StrandTable};

/// Bookkeeping for one open finish scope, keyed by its latch's GUID. The
/// latch only reaches zero once every child's Decr and the finish EDT's own
/// Decr have all landed (spec §4.4), at which point `output_event` should
/// fire with whatever the finish EDT itself returned — not whenever the
/// finish EDT happens to reap, which is usually well before its children do.
struct FinishScopeState {
    output_event: Guid,
    payload: Mutex<Option<Guid>>,
}

/// The in-process runtime instance: one `PolicyDomain` per
/// `RuntimeConfig::worker_count` set of workers.
pub struct PolicyDomain {
    pub config: RuntimeConfig,
    pub guids: GuidProvider,
    pub strands: StrandTable,
    pub scheduler: Arc<dyn Scheduler>,
    pub run_level: RunLevelBarrier,
    finish_latches: Mutex<HashMap<u64, FinishScopeState>>,
    hints: HintTable,
    shutting_down: AtomicBool,
    allocator: Arc<dyn MemoryAllocator>,
    /// EDTs currently parked on a `Busy` datablock acquire, keyed by the
    /// waiting EDT's GUID. The datablock's own waiter queue still decides
    /// grant order; this is what lets the release side drive the
    /// continuation through the strand table's needs-process bitscan
    /// (spec §2/§4.4's "async acquire completions routed through strand
    /// table") instead of calling back into `drive_acquire` synchronously
    /// and bypassing the micro-scheduler entirely.
    pending_acquire_strands: Mutex<HashMap<u64, StrandHandle>>,
}

impl PolicyDomain {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_allocator(config, Arc::new(SystemAllocator))
    }

    /// Like [`PolicyDomain::new`], but lets a deployment swap in its own
    /// datablock-backing allocator (an arena, a pool, ...) instead of the
    /// global heap, the same seam the original routes every datablock's
    /// memory through a policy-domain-selected `ocrAllocator_t` for.
    pub fn with_allocator(config: RuntimeConfig, allocator: Arc<dyn MemoryAllocator>) -> Arc<Self> {
        let worker_count = config.worker_count.max(1) as u32;
        let pd = Arc::new(Self {
            guids: GuidProvider::new(LocationId(0)),
            strands: StrandTable::new(config.strand_table_fanout, config.pd_process_max_count),
            scheduler: Arc::new(WorkStealingScheduler::new(worker_count as usize)),
            run_level: RunLevelBarrier::new(worker_count),
            finish_latches: Mutex::new(HashMap::new()),
            hints: HintTable::new(),
            shutting_down: AtomicBool::new(false),
            allocator,
            pending_acquire_strands: Mutex::new(HashMap::new()),
            config,
        });
        // Weak so the table (owned by `pd` itself) doesn't keep `pd` alive
        // forever through its own dispatcher closure.
        let weak = Arc::downgrade(&pd);
        pd.strands.set_dispatcher(Arc::new(move |msg| {
            if let Some(pd) = weak.upgrade() {
                let _ = pd.dispatch_message(msg);
            }
        }));
        pd
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // ---- Datablocks ----------------------------------------------------

    pub fn create_datablock(&self, size: usize, lockable: bool) -> OcrResult<Guid> {
        let guid = self.guids.mint(GuidKind::Db);
        let db = if lockable {
            Arc::new(Datablock::new_lockable(guid, size, self.allocator.as_ref())?)
        } else {
            Arc::new(Datablock::new_regular(guid, size, self.allocator.as_ref())?)
        };
        self.guids.register(guid, ObjectRef::Datablock(db));
        Ok(guid)
    }

    pub fn destroy_datablock(&self, guid: Guid) -> OcrResult<()> {
        let obj = self.guids.resolve(guid).ok_or(OcrError::Einval)?;
        let db = obj.as_datablock().ok_or(OcrError::Einval)?;
        if db.request_free()? {
            self.guids.release(guid);
        }
        Ok(())
    }

    // ---- Events ----------------------------------------------------

    pub fn create_event(&self, kind: EventKind, latch_initial: i64, counted_nb_deps: u32, channel_capacity: usize) -> Guid {
        let guid = self.guids.mint(match kind {
            EventKind::Once => GuidKind::EventOnce,
            EventKind::Latch => GuidKind::EventLatch,
            EventKind::Sticky => GuidKind::EventSticky,
            EventKind::Idem => GuidKind::EventIdem,
            EventKind::Counted => GuidKind::EventCounted,
            EventKind::Channel => GuidKind::EventChannel,
        });
        let event = Arc::new(Event::new(guid, kind, latch_initial, counted_nb_deps, channel_capacity));
        self.guids.register(guid, ObjectRef::Event(event));
        guid
    }

    /// Satisfies an event and dispatches the resulting waiter notifications
    /// straight into each waiter's EDT (the only kind of waiter this
    /// runtime has — no cross-event chaining beyond `add_dependence`).
    pub fn satisfy_event(self: &Arc<Self>, event_guid: Guid, payload: Guid, slot: u32) -> OcrResult<()> {
        let obj = self.guids.resolve(event_guid).ok_or(OcrError::Einval)?;
        let event = obj.as_event().ok_or(OcrError::Einval)?.clone();
        let drained = event.satisfy(payload, slot)?;
        for waiter in drained {
            self.notify_waiter(waiter, payload)?;
        }
        self.maybe_destroy_event(event_guid, &event);
        Ok(())
    }

    /// Self-destructs a non-persistent/self-terminating event once it has
    /// fired: `Once` unconditionally (spec §3: "destroyed immediately after
    /// propagation"), `Latch`/`Counted` once their terminal count is reached
    /// ("destroyed on fire" / "self-destructs when nbDeps ... served"). A
    /// latch backing an open finish scope is the one exception — its own
    /// teardown is driven by `finish_decrement` once it has finished
    /// consulting the fired latch, not by this generic path, since it still
    /// needs the GUID live a moment longer to look up `finish_latches`.
    fn maybe_destroy_event(&self, guid: Guid, event: &Event) {
        let terminal = match event.kind {
            EventKind::Once => true,
            EventKind::Counted => event.is_satisfied(),
            EventKind::Latch => event.is_satisfied() && !self.finish_latches.lock().contains_key(&guid.raw()),
            EventKind::Sticky | EventKind::Idem | EventKind::Channel => false,
        };
        if terminal {
            let _ = event.finish_satisfy_transition();
            self.guids.release(guid);
        }
    }

    pub fn add_dependence(self: &Arc<Self>, src_guid: Guid, waiter: RegNode) -> OcrResult<()> {
        if src_guid.is_null() {
            return self.notify_waiter(waiter, Guid::NULL);
        }
        let obj = self.guids.resolve(src_guid).ok_or(OcrError::Einval)?;
        let event = obj.as_event().ok_or(OcrError::Einval)?;
        if let Some(payload) = event.add_dependence(waiter)? {
            self.notify_waiter(waiter, payload)?;
        }
        Ok(())
    }

    fn notify_waiter(self: &Arc<Self>, waiter: RegNode, payload: Guid) -> OcrResult<()> {
        let obj = match self.guids.resolve(waiter.guid) {
            Some(o) => o,
            None => return Ok(()),
        };
        let edt = obj.as_edt().ok_or(OcrError::Einval)?.clone();
        if edt.satisfy_slot(waiter.slot, payload)? {
            self.begin_acquiring(edt);
        }
        Ok(())
    }

    // ---- EDTs ----------------------------------------------------

    pub fn create_edt_template(&self, name: impl Into<String>, paramc: Option<u32>, depc: Option<u32>, func: crate::edt::EdtFn) -> Guid {
        let guid = self.guids.mint(GuidKind::EdtTemplate);
        let tmpl = Arc::new(EdtTemplate::new(guid, name, paramc, depc, func));
        self.guids.register(guid, ObjectRef::EdtTemplate(tmpl));
        guid
    }

    /// Creates an EDT instance. `parent_finish` is the enclosing finish
    /// scope's latch, if any; `is_finish` starts a new nested scope. Returns
    /// `(edt, output_event, finish_scope)` — `finish_scope` is this EDT's
    /// own newly-created finish latch (`Some` iff `is_finish`), which a
    /// caller threads down as `parent_finish` to every EDT it creates
    /// within the scope so they check in/out of the right latch (spec
    /// §4.4's "every child EDT created inside the finish scope checks in").
    pub fn create_edt(
        self: &Arc<Self>,
        template_guid: Guid,
        paramv: Vec<u64>,
        dep_modes: Vec<AccessMode>,
        want_output_event: bool,
        is_finish: bool,
        parent_finish: Option<Guid>,
    ) -> OcrResult<(Guid, Option<Guid>, Option<Guid>)> {
        let obj = self.guids.resolve(template_guid).ok_or(OcrError::Einval)?;
        let tmpl = obj.as_edt_template().ok_or(OcrError::Einval)?.clone();
        let guid = self.guids.mint(GuidKind::Edt);

        let output_event = if want_output_event || is_finish {
            Some(self.create_event(EventKind::Sticky, 0, 0, 0))
        } else {
            None
        };

        let finish_latch = if is_finish {
            let latch_guid = self.create_event(EventKind::Latch, 1, 0, 0);
            self.finish_latches.lock().insert(
                latch_guid.raw(),
                FinishScopeState { output_event: output_event.unwrap(), payload: Mutex::new(None) },
            );
            Some(latch_guid)
        } else {
            None
        };

        if let Some(parent) = parent_finish {
            // Check in with the enclosing scope: one more Incr, released by
            // a Decr once this EDT (and everything it transitively spawns
            // under the same scope) finishes.
            self.satisfy_event(parent, Guid::NULL, 1)?;
        }

        let depv: Vec<DepSlot> = dep_modes.into_iter().map(|mode| DepSlot { mode, guid: None }).collect();
        let edt = Arc::new(Edt::new(guid, tmpl, paramv, depv, output_event, finish_latch, parent_finish));
        self.guids.register(guid, ObjectRef::Edt(edt.clone()));

        if edt.depc == 0 {
            self.begin_acquiring(edt);
        }
        Ok((guid, output_event, finish_latch))
    }

    fn begin_acquiring(self: &Arc<Self>, edt: Arc<Edt>) {
        edt.build_frontier();
        self.drive_acquire(edt);
    }

    fn drive_acquire(self: &Arc<Self>, edt: Arc<Edt>) {
        loop {
            let Some((guid, mode)) = edt.next_to_acquire() else {
                self.scheduler.give(edt.guid, 0);
                return;
            };
            if guid.is_null() {
                edt.mark_acquired(None);
                continue;
            }
            let obj = match self.guids.resolve(guid) {
                Some(o) => o,
                None => {
                    edt.mark_acquired(None);
                    continue;
                }
            };
            let Some(db) = obj.as_datablock() else {
                edt.mark_acquired(None);
                continue;
            };
            match db.acquire(edt.guid, 0, mode) {
                Ok(AcquireOutcome::Acquired(_)) => {
                    let done = edt.mark_acquired(Some(db.clone()));
                    if done {
                        self.scheduler.give(edt.guid, 0);
                        return;
                    }
                }
                Ok(AcquireOutcome::Busy) => {
                    // Park a strand on this EDT so the eventual grant (spec
                    // §2/§4.4) gets driven back through the strand table
                    // instead of a bare direct call once the datablock's
                    // waiter queue says it's our turn. The datablock still
                    // decides grant order; only how the grant gets executed
                    // changes.
                    if let Ok(handle) = self.strands.get_new_strand(edt.guid) {
                        self.pending_acquire_strands.lock().insert(edt.guid.raw(), handle);
                    }
                    return;
                }
                Err(_) => return,
            }
        }
    }

    /// Resumes an EDT that was granted a datablock it had previously found
    /// `Busy`. If it parked a strand when it hit `Busy` (the common case),
    /// queue its continuation on that strand and drive the table's
    /// needs-process bitscan to run it; otherwise (e.g. an EDT that was
    /// never blocked before becoming the grant target) fall back to
    /// driving the acquire directly.
    fn resume_parked_acquire(self: &Arc<Self>, edt: Arc<Edt>) {
        let handle = self.pending_acquire_strands.lock().remove(&edt.guid.raw());
        let Some(handle) = handle else {
            self.drive_acquire(edt);
            return;
        };
        let pd = self.clone();
        let edt_for_cb = edt.clone();
        let cb_handle = handle;
        let enqueued = self.strands.enqueue_action(
            handle,
            Action::Callback(Arc::new(move |_event| {
                pd.drive_acquire(edt_for_cb.clone());
                let _ = pd.strands.free_strand(cb_handle);
            })),
        );
        if enqueued.is_ok() {
            self.strands.process_strands();
        } else {
            // Strand vanished somehow; still need to drive the acquire.
            self.drive_acquire(edt);
        }
    }

    /// Runs an EDT to completion on the calling thread and performs its
    /// output-event/finish-scope bookkeeping. The worker loop calls this
    /// once it has pulled a runnable GUID off the scheduler.
    pub fn run_edt(self: &Arc<Self>, edt_guid: Guid) -> OcrResult<()> {
        let obj = self.guids.resolve(edt_guid).ok_or(OcrError::Einval)?;
        let edt = obj.as_edt().ok_or(OcrError::Einval)?.clone();
        let deps = edt.resolved_deps();
        let result = (edt.template.func)(&edt.paramv, &deps);

        for (i, dep) in deps.iter().enumerate() {
            if dep.db.is_some() && edt.should_release(i) {
                if let Some(o) = self.guids.resolve(dep.guid) {
                    if let Some(db) = o.as_datablock() {
                        if let Ok((granted, should_destroy)) = db.release(edt_guid) {
                            for (waiter_edt, slot, _mode) in granted {
                                if let Some(o) = self.guids.resolve(waiter_edt) {
                                    if let Some(waiter) = o.as_edt() {
                                        self.resume_parked_acquire(waiter.clone());
                                        let _ = slot;
                                    }
                                }
                            }
                            if should_destroy {
                                self.guids.release(dep.guid);
                            }
                        }
                    }
                }
            }
        }

        let payload = result.unwrap_or(Guid::NULL);
        match edt.finish_latch {
            None => {
                // A plain EDT's output event (if any) fires as soon as it
                // reaps — nothing else gates it.
                if let Some(out) = edt.output_event {
                    self.satisfy_event(out, payload, 0)?;
                }
            }
            Some(latch) => {
                // A finish EDT's output event is gated on its own latch
                // draining to zero (spec §8 property 4), not on this reap —
                // stash the payload now, hand it to the output event once
                // `finish_decrement` below observes the latch actually fire.
                if let Some(state) = self.finish_latches.lock().get(&latch.raw()) {
                    *state.payload.lock() = Some(payload);
                }
            }
        }
        if let Some(latch) = edt.finish_latch {
            self.finish_decrement(latch)?;
        }
        if let Some(parent) = edt.parent_finish {
            // Check out of the enclosing finish scope we checked into at
            // creation (slot 1, Incr); this is the Decr that lets it reach
            // zero once every transitively-created child has completed.
            self.finish_decrement(parent)?;
        }
        self.guids.release(edt_guid);
        Ok(())
    }

    /// Decrements a finish scope's latch (slot 0) and, if that decrement is
    /// the one that drains it to zero, satisfies the scope's output event
    /// with the finish EDT's stashed return payload. Shared by both the
    /// finish EDT's own reap (its one guaranteed Decr) and every child's
    /// check-out, since either can be the last one in.
    fn finish_decrement(self: &Arc<Self>, latch: Guid) -> OcrResult<()> {
        self.satisfy_event(latch, Guid::NULL, 0)?;
        let obj = self.guids.resolve(latch).ok_or(OcrError::Einval)?;
        let event = obj.as_event().ok_or(OcrError::Einval)?.clone();
        if event.is_satisfied() {
            if let Some(state) = self.finish_latches.lock().remove(&latch.raw()) {
                let payload = state.payload.lock().take().unwrap_or(Guid::NULL);
                self.satisfy_event(state.output_event, payload, 0)?;
            }
            // Now that `finish_latches` no longer references it, tear the
            // latch itself down the same way `maybe_destroy_event` would
            // have for a plain (non-scope) latch.
            let _ = event.finish_satisfy_transition();
            self.guids.release(latch);
        }
        Ok(())
    }

    pub fn set_hint(&self, guid: Guid, key: &str, value: u64) -> OcrResult<()> {
        self.hints.set(&self.guids, guid, key, value)
    }

    pub fn get_hint(&self, guid: Guid, key: &str) -> OcrResult<Option<u64>> {
        self.hints.get(&self.guids, guid, key)
    }

    pub fn enqueue_message(&self, strand: crate::strand::StrandHandle, msg: PdMessageKind) -> OcrResult<()> {
        self.strands.enqueue_action(strand, Action::Dispatch(msg))
    }

    pub fn process_messages(&self) -> u32 {
        self.strands.process_strands()
    }

    /// Applies one dispatched PD message and returns the response (spec §6's
    /// messages are always answered, even if only with an echo).
    ///
    /// Implements spec §4.7's shutdown overlay: once this PD has begun
    /// tearing down, every message that isn't itself part of the run-level
    /// protocol (`RunLevelTransition`/`Shutdown`) is answered with a
    /// synthetic `RunLevelTransition` naming the current level instead of
    /// being acted on — so dependence-satisfy/acquire-complete/runnable
    /// traffic still in flight when shutdown begins can't resurrect work
    /// after the barrier has started moving back down.
    pub fn dispatch_message(self: &Arc<Self>, msg: PdMessageKind) -> PdMessageKind {
        let administrative = matches!(msg, PdMessageKind::RunLevelTransition { .. } | PdMessageKind::Shutdown);
        if self.is_shutting_down() && !administrative {
            return PdMessageKind::RunLevelTransition { to: self.run_level.current() };
        }
        match msg {
            PdMessageKind::DepSatisfied { edt, .. } => {
                if let Some(edt) = self.guids.resolve(edt).and_then(|o| o.as_edt().cloned()) {
                    self.drive_acquire(edt);
                }
            }
            PdMessageKind::DbAcquireComplete { edt, db, .. } => {
                let edt = self.guids.resolve(edt).and_then(|o| o.as_edt().cloned());
                let db = self.guids.resolve(db).and_then(|o| o.as_datablock().cloned());
                if let Some(edt) = edt {
                    if edt.mark_acquired(db) {
                        self.scheduler.give(edt.guid, 0);
                    } else {
                        self.drive_acquire(edt);
                    }
                }
            }
            PdMessageKind::EdtRunnable { edt } => {
                self.scheduler.give(edt, 0);
            }
            PdMessageKind::EdtFinished { .. } => {
                // Output-event/finish-scope bookkeeping already runs inline
                // at the end of `run_edt` on the thread that ran it; this
                // variant exists for a remote-notification path a
                // single-PD deployment never takes.
            }
            PdMessageKind::RunLevelTransition { .. } | PdMessageKind::Shutdown => {}
        }
        msg
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.run_level.begin_teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pd() -> Arc<PolicyDomain> {
        PolicyDomain::new(RuntimeConfig { worker_count: 1, ..Default::default() })
    }

    #[test]
    fn shutdown_overlay_answers_non_administrative_messages_with_run_level_notify() {
        let pd = new_pd();
        pd.begin_shutdown();
        let resp = pd.dispatch_message(PdMessageKind::EdtRunnable { edt: Guid::NULL });
        match resp {
            PdMessageKind::RunLevelTransition { to } => assert_eq!(to, pd.run_level.current()),
            other => panic!("expected a synthetic RunLevelTransition, got {other:?}"),
        }
    }

    #[test]
    fn shutdown_overlay_leaves_administrative_messages_alone() {
        let pd = new_pd();
        pd.begin_shutdown();
        let resp = pd.dispatch_message(PdMessageKind::Shutdown);
        assert!(matches!(resp, PdMessageKind::Shutdown));
    }

    #[test]
    fn non_administrative_messages_are_acted_on_before_shutdown() {
        let pd = new_pd();
        let tmpl = pd.create_edt_template("noop", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL)));
        let (edt, _, _) = pd.create_edt(tmpl, vec![], vec![], false, false, None).unwrap();
        // Not shutting down: EdtRunnable should actually schedule it, not
        // just echo a synthetic response.
        let resp = pd.dispatch_message(PdMessageKind::EdtRunnable { edt });
        assert!(matches!(resp, PdMessageKind::EdtRunnable { .. }));
        assert_eq!(pd.scheduler.take(0), Some(edt));
    }

    /// Spec §2/§4.4: async acquire completions should be routed through the
    /// strand table, not a bare synchronous `drive_acquire` call. A second
    /// EDT that hits a `Busy` exclusive acquire should get parked, and
    /// releasing the first holder should drive the second through via
    /// `resume_parked_acquire` rather than leaving it stuck.
    #[test]
    fn busy_acquire_parks_a_strand_and_release_resumes_it() {
        let pd = new_pd();
        let db = pd.create_datablock(64, true).unwrap();
        let db_event = pd.create_event(EventKind::Sticky, 0, 0, 0);
        pd.satisfy_event(db_event, db, 0).unwrap();

        let tmpl = pd.create_edt_template("holder", Some(0), Some(1), Arc::new(|_p, _d| Ok(Guid::NULL)));
        let (first, _, _) = pd.create_edt(tmpl.clone(), vec![], vec![AccessMode::Ew], false, false, None).unwrap();
        pd.add_dependence(db_event, RegNode { guid: first, slot: 0 }).unwrap();
        // `first` acquired immediately (db was free) and is now runnable.
        assert_eq!(pd.scheduler.take(0), Some(first));

        let (second, _, _) = pd.create_edt(tmpl, vec![], vec![AccessMode::Ew], false, false, None).unwrap();
        pd.add_dependence(db_event, RegNode { guid: second, slot: 0 }).unwrap();
        // `second` must have hit Busy (first still holds Ew) and parked.
        assert!(pd.pending_acquire_strands.lock().contains_key(&second.raw()));
        assert_eq!(pd.scheduler.take(0), None);

        pd.run_edt(first).unwrap();

        // Releasing `first` should have driven `second` through the parked
        // strand's continuation rather than leaving it stuck forever.
        assert!(!pd.pending_acquire_strands.lock().contains_key(&second.raw()));
        assert_eq!(pd.scheduler.take(0), Some(second));
    }
}
