//! Datablocks: the shared-memory side of the dependence graph.
//!
//! Grounded on `lockable-datablock.c` (original_source/ocr) for the general
//! case — an acquire/release state machine with a mode lock
//! (`None`/`Itw`/`Ew`) and a FIFO waiter queue per mode — and on
//! `regular-datablock.c` for the fast path: a datablock nobody but its
//! creating EDT (or EDTs chained by `RW`/ITW) ever contends for, where the
//! lockable machine's waiter bookkeeping is pure overhead.
//!
//! `DbKind::Regular` skips the waiter queue and mode-lock transitions
//! entirely: it only supports a single outstanding acquirer at a time and
//! fails fast (`Eacces`) rather than queuing a second one, trading
//! generality for the no-waiter-list cost the original's regular variant is
//! built around.

use std::cell::UnsafeCell;
use std::collections::VecDeque;

use spin::Mutex;

use crate::alloc_adapter::MemoryAllocator;
use crate::error::{AcquireOutcome, OcrError, OcrResult};
use crate::guid::Guid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only; any number of concurrent `Ro`/`Const` acquirers.
    Ro,
    /// Read-only, additionally asserting no `Rw`/`Ew` acquirer is live.
    Const,
    /// Read-write via in-task/location write coalescing: multiple `Rw`
    /// acquirers may hold the DB at once as long as none is `Ew`.
    Rw,
    /// Exclusive write: no other acquirer, of any mode, may be live.
    Ew,
    /// No data access requested (hint/placement-only dependence).
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeLock {
    None,
    Itw,
    Ew,
}

struct Waiter {
    edt: Guid,
    slot: u32,
    mode: AccessMode,
}

struct LockableAttrs {
    mode_lock: ModeLock,
    num_users: u32,
    free_requested: bool,
    waiters: VecDeque<Waiter>,
}

enum DbState {
    Lockable(Mutex<LockableAttrs>),
    /// Regular: at most one acquirer, no waiter queue.
    Regular(Mutex<Option<Guid>>),
}

/// A datablock: a GUID-addressed byte buffer plus an acquire/release
/// protocol governing concurrent access to it.
///
/// Safety: `data` is an `UnsafeCell` because the access modes above permit
/// more than one acquirer to hold a live reference at once (`Rw`/ITW
/// coalescing, multiple `Ro` readers); soundness rests on every caller
/// respecting the mode it was actually granted by `acquire`, exactly as the
/// original relies on EDTs only touching the buffer within their granted
/// mode.
pub struct Datablock {
    pub guid: Guid,
    size: usize,
    data: UnsafeCell<Vec<u8>>,
    state: DbState,
}

unsafe impl Sync for Datablock {}
unsafe impl Send for Datablock {}

/// A granted acquisition: the mode it was granted in plus raw access to the
/// backing buffer for the lifetime of the guard. Dropping it does not
/// release the datablock — the caller must call [`Datablock::release`]
/// (mirroring the original, where acquire and release are independent
/// policy-domain messages, not a guard destructor).
pub struct DbAccess<'a> {
    pub mode: AccessMode,
    db: &'a Datablock,
}

impl<'a> DbAccess<'a> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { &*self.db.data.get() }
    }

    /// # Safety-by-protocol
    /// Sound only when `mode` is `Rw` or `Ew` — callers holding `Ro`/`Const`
    /// must not call this; the datablock does not itself check the mode
    /// here, matching the original's bare-pointer handout.
    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { &mut *self.db.data.get() }
    }
}

impl Datablock {
    pub fn new_lockable(guid: Guid, size: usize, allocator: &dyn MemoryAllocator) -> OcrResult<Self> {
        Ok(Self {
            guid,
            size,
            data: UnsafeCell::new(allocator.allocate(size)?),
            state: DbState::Lockable(Mutex::new(LockableAttrs {
                mode_lock: ModeLock::None,
                num_users: 0,
                free_requested: false,
                waiters: VecDeque::new(),
            })),
        })
    }

    pub fn new_regular(guid: Guid, size: usize, allocator: &dyn MemoryAllocator) -> OcrResult<Self> {
        Ok(Self {
            guid,
            size,
            data: UnsafeCell::new(allocator.allocate(size)?),
            state: DbState::Regular(Mutex::new(None)),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Attempts to acquire the datablock in `mode` for `edt`. If granted,
    /// returns the access guard immediately; if the request must wait, the
    /// caller is responsible for enqueuing `(edt, slot)` as a waiter via the
    /// `Busy` branch having already been recorded internally.
    pub fn acquire(&self, edt: Guid, slot: u32, mode: AccessMode) -> OcrResult<AcquireOutcome<DbAccess<'_>>> {
        match &self.state {
            DbState::Regular(held) => {
                let mut held = held.lock();
                if held.is_some() {
                    return Ok(AcquireOutcome::Busy);
                }
                *held = Some(edt);
                Ok(AcquireOutcome::Acquired(DbAccess { mode, db: self }))
            }
            DbState::Lockable(attrs) => {
                let mut a = attrs.lock();
                if a.free_requested {
                    return Err(OcrError::Eacces);
                }
                match mode {
                    AccessMode::Null | AccessMode::Ro => {}
                    AccessMode::Const => {
                        if a.mode_lock != ModeLock::None {
                            a.waiters.push_back(Waiter { edt, slot, mode });
                            return Ok(AcquireOutcome::Busy);
                        }
                    }
                    AccessMode::Ew => {
                        if a.mode_lock != ModeLock::None || a.num_users != 0 {
                            a.waiters.push_back(Waiter { edt, slot, mode });
                            return Ok(AcquireOutcome::Busy);
                        }
                        a.mode_lock = ModeLock::Ew;
                    }
                    AccessMode::Rw => {
                        let must_queue = a.mode_lock == ModeLock::Ew
                            || (a.num_users != 0 && a.mode_lock == ModeLock::None);
                        if must_queue {
                            a.waiters.push_back(Waiter { edt, slot, mode });
                            return Ok(AcquireOutcome::Busy);
                        }
                        if a.mode_lock == ModeLock::None {
                            a.mode_lock = ModeLock::Itw;
                        }
                    }
                }
                a.num_users += 1;
                Ok(AcquireOutcome::Acquired(DbAccess { mode, db: self }))
            }
        }
    }

    /// Releases a previously granted acquisition, waking the next batch of
    /// waiters as the mode lock's state machine allows. Returns the waiters
    /// now granted, for the caller to notify, and whether this release was
    /// the one that drained `num_users` to zero with `free_requested` set
    /// and nobody left to wake — i.e. the DB may now be destroyed (spec §3
    /// invariant: `freeRequested ∧ numUsers = 0 ∧ internalUsers = 0 ⇒` may
    /// destroy; this engine has no separate `internalUsers` class of
    /// acquirer, so the waiter-queue check stands in for it).
    pub fn release(&self, edt: Guid) -> OcrResult<(Vec<(Guid, u32, AccessMode)>, bool)> {
        match &self.state {
            DbState::Regular(held) => {
                let mut held = held.lock();
                if *held != Some(edt) {
                    return Err(OcrError::Eperm);
                }
                *held = None;
                Ok((Vec::new(), false))
            }
            DbState::Lockable(attrs) => {
                let mut a = attrs.lock();
                if a.num_users == 0 {
                    return Err(OcrError::Eperm);
                }
                a.num_users -= 1;
                if a.num_users != 0 {
                    return Ok((Vec::new(), false));
                }
                // Last user gone: drop the mode lock and see what's next.
                a.mode_lock = ModeLock::None;
                let mut granted = Vec::new();
                if let Some(front) = a.waiters.front() {
                    match front.mode {
                        AccessMode::Rw => {
                            a.mode_lock = ModeLock::Itw;
                            while matches!(a.waiters.front(), Some(w) if w.mode == AccessMode::Rw) {
                                let w = a.waiters.pop_front().unwrap();
                                a.num_users += 1;
                                granted.push((w.edt, w.slot, w.mode));
                            }
                        }
                        AccessMode::Ew => {
                            let w = a.waiters.pop_front().unwrap();
                            a.mode_lock = ModeLock::Ew;
                            a.num_users += 1;
                            granted.push((w.edt, w.slot, w.mode));
                        }
                        AccessMode::Const | AccessMode::Ro | AccessMode::Null => {
                            while matches!(
                                a.waiters.front(),
                                Some(w) if w.mode == AccessMode::Const || w.mode == AccessMode::Ro || w.mode == AccessMode::Null
                            ) {
                                let w = a.waiters.pop_front().unwrap();
                                a.num_users += 1;
                                granted.push((w.edt, w.slot, w.mode));
                            }
                        }
                    }
                }
                let should_destroy = granted.is_empty() && a.free_requested;
                Ok((granted, should_destroy))
            }
        }
    }

    /// Requests destruction; succeeds immediately if idle, otherwise marks
    /// `free_requested` so the last `release` tears it down (the caller
    /// checks `Ok(true)` to know destruction happened now).
    pub fn request_free(&self) -> OcrResult<bool> {
        match &self.state {
            DbState::Regular(held) => Ok(held.lock().is_none()),
            DbState::Lockable(attrs) => {
                let mut a = attrs.lock();
                if a.num_users == 0 {
                    Ok(true)
                } else {
                    a.free_requested = true;
                    Ok(false)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_adapter::SystemAllocator;
    use crate::guid::{GuidKind, GuidProvider, LocationId};

    fn guid() -> Guid {
        GuidProvider::new(LocationId(0)).mint(GuidKind::Db)
    }

    #[test]
    fn regular_db_rejects_second_concurrent_acquirer() {
        let db = Datablock::new_regular(guid(), 16, &SystemAllocator).unwrap();
        let e1 = guid();
        let e2 = guid();
        assert!(matches!(db.acquire(e1, 0, AccessMode::Ew).unwrap(), AcquireOutcome::Acquired(_)));
        assert!(matches!(db.acquire(e2, 0, AccessMode::Ew).unwrap(), AcquireOutcome::Busy));
        db.release(e1).unwrap();
        assert!(matches!(db.acquire(e2, 0, AccessMode::Ew).unwrap(), AcquireOutcome::Acquired(_)));
    }

    #[test]
    fn lockable_ew_excludes_everyone_else() {
        let db = Datablock::new_lockable(guid(), 16, &SystemAllocator).unwrap();
        let e1 = guid();
        let e2 = guid();
        assert!(matches!(db.acquire(e1, 0, AccessMode::Ew).unwrap(), AcquireOutcome::Acquired(_)));
        assert!(matches!(db.acquire(e2, 0, AccessMode::Ro).unwrap(), AcquireOutcome::Busy));
        let (granted, destroy) = db.release(e1).unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, e2);
        assert!(!destroy);
    }

    #[test]
    fn lockable_rw_coalesces_multiple_itw_holders() {
        let db = Datablock::new_lockable(guid(), 16, &SystemAllocator).unwrap();
        let e1 = guid();
        let e2 = guid();
        assert!(matches!(db.acquire(e1, 0, AccessMode::Rw).unwrap(), AcquireOutcome::Acquired(_)));
        assert!(matches!(db.acquire(e2, 0, AccessMode::Rw).unwrap(), AcquireOutcome::Acquired(_)));
    }

    #[test]
    fn free_request_defers_until_idle() {
        let db = Datablock::new_lockable(guid(), 16, &SystemAllocator).unwrap();
        let e1 = guid();
        db.acquire(e1, 0, AccessMode::Ew).unwrap();
        assert_eq!(db.request_free().unwrap(), false);
        let (granted, destroy) = db.release(e1).unwrap();
        assert!(granted.is_empty());
        assert!(destroy);
    }
}
