//! Event-driven tasks: templates, instances, and their dependence frontier.
//!
//! Grounded on `hc-task.c` (original_source/ocr). An EDT doesn't acquire all
//! its datablocks the moment every input event has satisfied it — it walks
//! a *frontier*: its signalers (one `RegNode` per dependence slot, resolved
//! to a DB guid once that slot's event fires) sorted by GUID, acquiring one
//! at a time. Sorting by GUID serializes DB acquisition in a global order
//! shared by every EDT, which is what avoids lock-order deadlocks between
//! EDTs that both depend on the same two datablocks in opposite slot order;
//! it also makes duplicate dependences on the same DB trivially detectable
//! as adjacent equal entries, tracked in `do_not_release` so only the first
//! acquirer of a repeated GUID ever calls release on it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::bitmap::AtomicBitVec;
use crate::datablock::{AccessMode, Datablock};
use crate::error::{OcrError, OcrResult};
use crate::guid::Guid;

/// A resolved (or not-yet-resolved) input dependence.
#[derive(Clone)]
pub struct DepSlot {
    pub mode: AccessMode,
    /// Filled in once the corresponding event satisfies this slot.
    pub guid: Option<Guid>,
}

/// One input made available to a running EDT: its GUID, the mode it was
/// acquired under, and the datablock itself once acquired (events/Null
/// deps carry no datablock).
pub struct EdtDep {
    pub guid: Guid,
    pub mode: AccessMode,
    pub db: Option<Arc<Datablock>>,
}

/// The user function body an EDT template wraps. Returns the GUID to
/// satisfy the EDT's output event with (or `Guid::NULL` for no payload).
pub type EdtFn = Arc<dyn Fn(&[u64], &[EdtDep]) -> OcrResult<Guid> + Send + Sync>;

/// A reusable EDT function plus its declared arity, registered once and
/// instantiated by many `ocrEdtCreate`-equivalent calls.
pub struct EdtTemplate {
    pub guid: Guid,
    pub name: String,
    /// `None` means variable (`EDT_PARAM_UNK`), checked only at instance
    /// creation rather than template registration.
    pub paramc: Option<u32>,
    pub depc: Option<u32>,
    pub func: EdtFn,
}

impl EdtTemplate {
    pub fn new(guid: Guid, name: impl Into<String>, paramc: Option<u32>, depc: Option<u32>, func: EdtFn) -> Self {
        Self { guid, name: name.into(), paramc, depc, func }
    }
}

#[derive(Clone)]
struct RegNode {
    guid: Guid,
    slot: u32,
}

struct Frontier {
    built: bool,
    signalers: Vec<RegNode>,
    frontier_slot: usize,
    do_not_release: AtomicBitVec,
    resolved_db: Vec<Option<Arc<Datablock>>>,
}

/// An EDT instance: its template, bound parameters, and dependence state.
pub struct Edt {
    pub guid: Guid,
    pub template: Arc<EdtTemplate>,
    pub paramv: Vec<u64>,
    pub depc: u32,
    pub output_event: Option<Guid>,
    pub finish_latch: Option<Guid>,
    /// The enclosing finish scope's latch, if this EDT was created inside
    /// one. Checked in (`Incr`) at creation; must be checked out (`Decr`)
    /// on completion so the enclosing scope's latch can ever reach zero —
    /// independent of `finish_latch`, which is this EDT's *own* new scope.
    pub parent_finish: Option<Guid>,
    depv: Mutex<Vec<DepSlot>>,
    slot_satisfied_count: AtomicU32,
    frontier: Mutex<Frontier>,
}

impl Edt {
    pub fn new(
        guid: Guid,
        template: Arc<EdtTemplate>,
        paramv: Vec<u64>,
        depv: Vec<DepSlot>,
        output_event: Option<Guid>,
        finish_latch: Option<Guid>,
        parent_finish: Option<Guid>,
    ) -> Self {
        let depc = depv.len() as u32;
        Self {
            guid,
            template,
            paramv,
            depc,
            output_event,
            finish_latch,
            parent_finish,
            depv: Mutex::new(depv),
            slot_satisfied_count: AtomicU32::new(0),
            frontier: Mutex::new(Frontier {
                built: false,
                signalers: Vec::new(),
                frontier_slot: 0,
                do_not_release: AtomicBitVec::new(1),
                resolved_db: Vec::new(),
            }),
        }
    }

    /// Binds slot `slot`'s signaler to `guid`. Returns `true` once every
    /// slot has been satisfied (the EDT's frontier can now be built and
    /// acquisition can begin).
    pub fn satisfy_slot(&self, slot: u32, guid: Guid) -> OcrResult<bool> {
        let mut depv = self.depv.lock();
        let entry = depv.get_mut(slot as usize).ok_or(OcrError::Einval)?;
        if entry.guid.is_some() {
            return Err(OcrError::Eperm);
        }
        entry.guid = Some(guid);
        let n = self.slot_satisfied_count.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(n == self.depc)
    }

    /// Builds the sorted signaler list once all slots are satisfied.
    /// Idempotent; safe to call more than once.
    pub fn build_frontier(&self) {
        let mut f = self.frontier.lock();
        if f.built {
            return;
        }
        let depv = self.depv.lock();
        let mut signalers: Vec<RegNode> = depv
            .iter()
            .enumerate()
            .map(|(i, d)| RegNode { guid: d.guid.unwrap_or(Guid::NULL), slot: i as u32 })
            .collect();
        signalers.sort_by_key(|r| r.guid.raw());
        f.do_not_release = AtomicBitVec::new(signalers.len().max(1));
        f.resolved_db = vec![None; depv.len()];
        f.signalers = signalers;
        f.frontier_slot = 0;
        f.built = true;
    }

    /// Returns the next (guid, mode) the caller should attempt to acquire,
    /// or `None` if the frontier has been fully walked (the EDT is ready to
    /// run). Automatically skips and coalesces duplicate adjacent GUIDs by
    /// copying the previous resolution forward.
    pub fn next_to_acquire(&self) -> Option<(Guid, AccessMode)> {
        let mut f = self.frontier.lock();
        let depv = self.depv.lock();
        loop {
            if f.frontier_slot >= f.signalers.len() {
                return None;
            }
            let idx = f.frontier_slot;
            let cur = f.signalers[idx].clone();
            if idx > 0 && f.signalers[idx - 1].guid == cur.guid && !cur.guid.is_null() {
                let prev_db = f.resolved_db[f.signalers[idx - 1].slot as usize].clone();
                f.resolved_db[cur.slot as usize] = prev_db;
                // Keyed by `cur.slot`, not the sorted frontier index `idx`:
                // `should_release` is queried by `run_edt` in slot order
                // (`resolved_deps()`'s order), and the GUID sort backing the
                // frontier permutes slots whenever dependences aren't already
                // in sorted order, so the two index spaces are not the same.
                f.do_not_release.set(cur.slot as usize, std::sync::atomic::Ordering::Release);
                f.frontier_slot += 1;
                continue;
            }
            let mode = depv[cur.slot as usize].mode;
            return Some((cur.guid, mode));
        }
    }

    /// Records that the current frontier slot's acquire completed, advances
    /// past it, and returns `true` if the EDT's full frontier is now
    /// resolved (ready to dispatch to a worker).
    pub fn mark_acquired(&self, db: Option<Arc<Datablock>>) -> bool {
        let mut f = self.frontier.lock();
        let idx = f.frontier_slot;
        let slot = f.signalers[idx].slot;
        f.resolved_db[slot as usize] = db;
        f.frontier_slot += 1;
        f.frontier_slot >= f.signalers.len()
    }

    /// Whether a duplicate-guid coalesced slot should skip `release` when
    /// the EDT finishes (only the first acquirer of a repeated GUID owns
    /// the release). `slot` is the dependence-slot index (`resolved_deps()`
    /// order), matching how `do_not_release` is now keyed in
    /// `next_to_acquire`.
    pub fn should_release(&self, slot: usize) -> bool {
        !self.frontier.lock().do_not_release.test(slot, Ordering::Acquire)
    }

    /// Assembles the `EdtDep` slice the template function runs against, in
    /// slot order (not frontier/sorted order).
    pub fn resolved_deps(&self) -> Vec<EdtDep> {
        let f = self.frontier.lock();
        let depv = self.depv.lock();
        (0..depv.len())
            .map(|slot| EdtDep {
                guid: depv[slot].guid.unwrap_or(Guid::NULL),
                mode: depv[slot].mode,
                db: f.resolved_db.get(slot).cloned().flatten(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{GuidKind, GuidProvider, LocationId};

    fn guid(p: &GuidProvider, kind: GuidKind) -> Guid {
        p.mint(kind)
    }

    fn noop_template(guid: Guid) -> Arc<EdtTemplate> {
        Arc::new(EdtTemplate::new(guid, "noop", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL))))
    }

    #[test]
    fn all_slots_satisfied_signals_ready() {
        let p = GuidProvider::new(LocationId(0));
        let e_guid = guid(&p, GuidKind::Edt);
        let tmpl = noop_template(guid(&p, GuidKind::EdtTemplate));
        let depv = vec![
            DepSlot { mode: AccessMode::Ro, guid: None },
            DepSlot { mode: AccessMode::Ew, guid: None },
        ];
        let edt = Edt::new(e_guid, tmpl, vec![], depv, None, None, None);
        assert_eq!(edt.satisfy_slot(0, guid(&p, GuidKind::Db)).unwrap(), false);
        assert_eq!(edt.satisfy_slot(1, guid(&p, GuidKind::Db)).unwrap(), true);
    }

    /// Regression for the `do_not_release` index-space mismatch: dependence
    /// slots `[dup, dup, unique]` whose GUIDs sort to
    /// `[unique(idx0), dup(idx1), dup(idx2)]` — the unique GUID sorts first,
    /// so the frontier-sorted index and the slot index disagree for every
    /// entry. Only the *slot* that actually performed the coalesced
    /// acquire's duplicate (slot 1, coalescing onto slot 0's acquire) should
    /// be skipped at release; slots 0 and 2 both did a real acquire.
    #[test]
    fn duplicate_coalescing_is_keyed_by_slot_not_sorted_index() {
        let p = GuidProvider::new(LocationId(0));
        let e_guid = guid(&p, GuidKind::Edt);
        let tmpl = noop_template(guid(&p, GuidKind::EdtTemplate));
        // Minted in increasing-counter order, same kind, so `unique < dup`.
        let unique = guid(&p, GuidKind::Db);
        let dup = guid(&p, GuidKind::Db);
        assert!(unique.raw() < dup.raw());

        let depv = vec![
            DepSlot { mode: AccessMode::Ro, guid: None }, // slot 0: dup
            DepSlot { mode: AccessMode::Ro, guid: None }, // slot 1: dup
            DepSlot { mode: AccessMode::Ro, guid: None }, // slot 2: unique
        ];
        let edt = Edt::new(e_guid, tmpl, vec![], depv, None, None, None);
        edt.satisfy_slot(0, dup).unwrap();
        edt.satisfy_slot(1, dup).unwrap();
        assert!(edt.satisfy_slot(2, unique).unwrap());
        edt.build_frontier();

        // Frontier order is sorted by guid: unique(slot2), dup(slot0), dup(slot1).
        let (g0, _) = edt.next_to_acquire().unwrap();
        assert_eq!(g0, unique);
        assert!(!edt.mark_acquired(None));
        let (g1, _) = edt.next_to_acquire().unwrap();
        assert_eq!(g1, dup);
        assert!(!edt.mark_acquired(None));
        // The third frontier entry (dup again, slot 1) coalesces onto the
        // one just acquired without the driver ever calling `mark_acquired`
        // for it — the frontier is fully resolved as soon as this call
        // returns `None`.
        assert!(edt.next_to_acquire().is_none());

        // The duplicate coalesced onto slot 0's acquire, so slot 1 (not
        // slot 0, and not the sorted index 2) is the one that must be
        // skipped at release.
        assert!(edt.should_release(0));
        assert!(!edt.should_release(1));
        assert!(edt.should_release(2));
    }

    #[test]
    fn duplicate_guid_dependences_coalesce() {
        let p = GuidProvider::new(LocationId(0));
        let e_guid = guid(&p, GuidKind::Edt);
        let tmpl = noop_template(guid(&p, GuidKind::EdtTemplate));
        let db = guid(&p, GuidKind::Db);
        let depv = vec![
            DepSlot { mode: AccessMode::Ro, guid: None },
            DepSlot { mode: AccessMode::Ro, guid: None },
        ];
        let edt = Edt::new(e_guid, tmpl, vec![], depv, None, None, None);
        edt.satisfy_slot(0, db).unwrap();
        edt.satisfy_slot(1, db).unwrap();
        edt.build_frontier();
        let first = edt.next_to_acquire();
        assert!(first.is_some());
        let done = edt.mark_acquired(None);
        assert!(!done || edt.next_to_acquire().is_none());
    }
}
