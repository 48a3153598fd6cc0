//! A single strand: a parked event plus its pending continuations.
//!
//! The strand's lock is not a `spin::Mutex` — spec §9 is explicit that the
//! strand-properties state machine must stay on raw CAS, the same way the
//! persistent-event three-state machine does, because correctness here
//! depends on the lock bit and the readiness flags living in the one word
//! that the table's bitvector propagation reads lock-free. So `properties`
//! is an `AtomicU32` acting as both a spinlock (the `LOCK` bit) and the
//! strand's visible state (`FREE`/`WAIT_EVT`/`WAIT_ACT`/`UHOLD`/`RHOLD`),
//! and the data it guards (`cur_event`, `actions`) sits behind an
//! `UnsafeCell` only ever touched while `LOCK` is held by the caller.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::guid::Guid;
use crate::strand::action::Action;

bitflags::bitflags! {
    /// Strand property bits, per spec §3/§4.1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StrandProperties: u32 {
        /// Slot is unallocated.
        const FREE     = 0b0000_0001;
        /// Strand is locked for mutation (the spinlock bit).
        const LOCK     = 0b0000_0010;
        /// Waiting on its event to become ready.
        const WAIT_EVT = 0b0000_0100;
        /// Waiting on an action to complete (re-entered `WAIT_EVT`).
        const WAIT_ACT = 0b0000_1000;
        /// A user hold keeps the strand (and its event) alive.
        const UHOLD    = 0b0001_0000;
        /// A runtime hold keeps the strand alive.
        const RHOLD    = 0b0010_0000;
    }
}

struct StrandInner {
    cur_event: Option<Guid>,
    actions: VecDeque<Action>,
}

/// A suspended execution parked in a strand table.
pub struct Strand {
    properties: AtomicU32,
    inner: UnsafeCell<StrandInner>,
}

// Safety: all access to `inner` happens while the caller holds the `LOCK`
// bit in `properties`, established by `StrandGuard`.
unsafe impl Sync for Strand {}
unsafe impl Send for Strand {}

impl Strand {
    pub fn new_free() -> Self {
        Self {
            properties: AtomicU32::new(StrandProperties::FREE.bits()),
            inner: UnsafeCell::new(StrandInner {
                cur_event: None,
                actions: VecDeque::new(),
            }),
        }
    }

    /// Raw snapshot of the property word, for bitvector propagation without
    /// taking the lock.
    pub fn properties(&self) -> StrandProperties {
        StrandProperties::from_bits_truncate(self.properties.load(Ordering::Acquire))
    }

    /// A strand is ready iff neither `WAIT_EVT` nor `WAIT_ACT` is set.
    pub fn is_ready(&self) -> bool {
        !self
            .properties()
            .intersects(StrandProperties::WAIT_EVT | StrandProperties::WAIT_ACT)
    }

    pub fn is_free(&self) -> bool {
        self.properties().contains(StrandProperties::FREE)
    }

    /// Acquires the strand's lock bit, spinning until successful.
    pub fn lock(&self) -> StrandGuard<'_> {
        loop {
            let cur = self.properties.load(Ordering::Acquire);
            if cur & StrandProperties::LOCK.bits() == 0 {
                if self
                    .properties
                    .compare_exchange_weak(
                        cur,
                        cur | StrandProperties::LOCK.bits(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return StrandGuard { strand: self };
                }
            }
            std::hint::spin_loop();
        }
    }
}

/// RAII guard for a locked strand; derefs to the strand's mutable state.
pub struct StrandGuard<'a> {
    strand: &'a Strand,
}

impl<'a> StrandGuard<'a> {
    pub fn cur_event(&self) -> Option<Guid> {
        unsafe { (*self.strand.inner.get()).cur_event }
    }

    pub fn set_cur_event(&mut self, event: Option<Guid>) {
        unsafe {
            (*self.strand.inner.get()).cur_event = event;
        }
    }

    pub fn push_action(&mut self, action: Action) {
        unsafe {
            (*self.strand.inner.get()).actions.push_back(action);
        }
    }

    pub fn pop_action(&mut self) -> Option<Action> {
        unsafe { (*self.strand.inner.get()).actions.pop_front() }
    }

    pub fn has_actions(&self) -> bool {
        unsafe { !(*self.strand.inner.get()).actions.is_empty() }
    }

    /// Reads and replaces the property flags in one step while holding the
    /// lock. `f` receives the current flags (with `LOCK` still set) and
    /// returns the new flags (the caller must preserve or explicitly drop
    /// `LOCK`; dropping the guard clears it regardless).
    pub fn set_flags(&mut self, flags: StrandProperties) {
        // Preserve LOCK (we still hold it) and drop FREE implicitly unless
        // requested — callers pass the full desired flag set minus LOCK.
        self.strand
            .properties
            .store((flags | StrandProperties::LOCK).bits(), Ordering::Release);
    }

    pub fn flags(&self) -> StrandProperties {
        StrandProperties::from_bits_truncate(self.strand.properties.load(Ordering::Relaxed))
    }

    /// Resets the strand to `FREE` and clears its data — used when
    /// recycling a strand back to the table's free list.
    pub fn reset_to_free(&mut self) {
        unsafe {
            let inner = &mut *self.strand.inner.get();
            inner.cur_event = None;
            inner.actions.clear();
        }
        self.strand
            .properties
            .store((StrandProperties::FREE | StrandProperties::LOCK).bits(), Ordering::Release);
    }
}

impl Drop for StrandGuard<'_> {
    fn drop(&mut self) {
        self.strand.properties.fetch_and(!StrandProperties::LOCK.bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_strand_is_free_and_not_ready_by_default() {
        let s = Strand::new_free();
        assert!(s.is_free());
    }

    #[test]
    fn lock_guard_mutates_and_releases() {
        let s = Strand::new_free();
        {
            let mut g = s.lock();
            g.set_flags(StrandProperties::WAIT_EVT);
            g.set_cur_event(Some(Guid::UNINITIALIZED));
        }
        assert!(!s.is_ready());
        {
            let mut g = s.lock();
            g.set_flags(StrandProperties::empty());
        }
        assert!(s.is_ready());
    }
}
