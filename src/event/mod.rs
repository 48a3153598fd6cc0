//! Events: the six dependence-satisfaction primitives.
//!
//! Grounded on `hc-event.c` (original_source/ocr): every event kind shares
//! one waiter-list shape (`RegNode`: a waiting GUID plus the slot on that
//! waiter it should satisfy) and the same "drain waiters, hand the drained
//! list back to the caller to dispatch" contract (`commonSatisfyWaiters`).
//! The one state machine worth keeping on raw atomics per spec §9 is the
//! persistent-event checked-in/checked-out/destroy-seen dance
//! (`STATE_CHECKED_IN`/`STATE_CHECKED_OUT`/`STATE_DESTROY_SEEN` in the
//! original): it exists purely to let `destroy` and `satisfy` race safely
//! without a mutex, so it stays a CAS loop here rather than moving behind
//! `inner`'s spinlock.
//!
//! The original's static/dynamic waiter-array split (a fixed inline array
//! that spills to a separately-allocated overflow block past
//! `HCEVT_WAITER_STATIC_COUNT` entries) is a C allocation-avoidance trick
//! with no equivalent benefit over a `Vec`, so waiters are just a `Vec`
//! here; `RuntimeConfig::event_waiter_static_count` is kept only as the
//! threshold past which a warning-level log fires, matching the spirit of
//! "this event fanned out wide" without the manual spill mechanics.

use std::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{OcrError, OcrResult};
use crate::guid::Guid;

/// A registered waiter: some other object's GUID, and which of its input
/// slots this event's satisfaction should fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegNode {
    pub guid: Guid,
    pub slot: u32,
}

/// Which of an EDT's dependence slots a latch satisfaction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchOp {
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Once,
    Latch,
    Sticky,
    Idem,
    Counted,
    Channel,
}

const STATE_CHECKED_IN: u32 = u32::MAX;
const STATE_CHECKED_OUT: u32 = u32::MAX - 1;
const STATE_DESTROY_SEEN: u32 = u32::MAX - 2;

struct EventInner {
    waiters: Vec<RegNode>,
    /// Sticky/Idem/Counted's retained payload once satisfied.
    payload: Option<Guid>,
    /// Latch's running count (starts at the creation param, `Incr` adds,
    /// `Decr` subtracts; reaching zero satisfies with `Guid::NULL`).
    latch_count: i64,
    /// Counted's remaining expected satisfactions.
    counted_remaining: u32,
    /// Channel's queued values not yet claimed by a waiter, and waiters
    /// not yet matched to a value.
    channel_queue: std::collections::VecDeque<Guid>,
    channel_waiters: std::collections::VecDeque<RegNode>,
    channel_capacity: usize,
}

/// An event object. `life` tracks the checked-in/out/destroy-seen dance for
/// persistent kinds (Sticky/Idem/Counted/Latch); `Once` and `Channel` don't
/// have a single satisfied/unsatisfied lifecycle so `life` is unused for
/// them (left at `STATE_CHECKED_IN`, i.e. "still active").
pub struct Event {
    pub guid: Guid,
    pub kind: EventKind,
    life: AtomicU32,
    inner: Mutex<EventInner>,
}

impl Event {
    pub fn new(guid: Guid, kind: EventKind, latch_initial: i64, counted_nb_deps: u32, channel_capacity: usize) -> Self {
        Self {
            guid,
            kind,
            life: AtomicU32::new(STATE_CHECKED_IN),
            inner: Mutex::new(EventInner {
                waiters: Vec::new(),
                payload: None,
                latch_count: latch_initial,
                counted_remaining: counted_nb_deps,
                channel_queue: std::collections::VecDeque::new(),
                channel_waiters: std::collections::VecDeque::new(),
                channel_capacity,
            }),
        }
    }

    /// Registers a waiter. Returns `Some(payload)` if the event was already
    /// satisfied and the waiter should be notified immediately (the caller
    /// dispatches that notification itself, same as a drained `satisfy`
    /// waiter), or `None` if the waiter was queued.
    pub fn add_dependence(&self, waiter: RegNode) -> OcrResult<Option<Guid>> {
        match self.kind {
            EventKind::Once => {
                let mut inner = self.inner.lock();
                inner.waiters.push(waiter);
                Ok(None)
            }
            EventKind::Sticky | EventKind::Idem | EventKind::Counted => {
                let mut inner = self.inner.lock();
                if let Some(payload) = inner.payload {
                    Ok(Some(payload))
                } else {
                    inner.waiters.push(waiter);
                    Ok(None)
                }
            }
            EventKind::Latch => {
                let mut inner = self.inner.lock();
                if inner.latch_count <= 0 && inner.payload.is_some() {
                    Ok(Some(Guid::NULL))
                } else {
                    inner.waiters.push(waiter);
                    Ok(None)
                }
            }
            EventKind::Channel => {
                let mut inner = self.inner.lock();
                if let Some(v) = inner.channel_queue.pop_front() {
                    Ok(Some(v))
                } else {
                    inner.channel_waiters.push_back(waiter);
                    Ok(None)
                }
            }
        }
    }

    /// Satisfies the event on the given slot with `payload`. Returns the
    /// list of waiters to notify (the caller, typically the owning policy
    /// domain, dispatches a notification to each).
    pub fn satisfy(&self, payload: Guid, slot: u32) -> OcrResult<Vec<RegNode>> {
        match self.kind {
            EventKind::Once => {
                let mut inner = self.inner.lock();
                let waiters = std::mem::take(&mut inner.waiters);
                Ok(waiters.into_iter().map(|mut w| { w.slot = slot_or(w.slot, slot); w }).collect())
            }
            EventKind::Sticky => {
                let mut inner = self.inner.lock();
                if inner.payload.is_some() {
                    return Err(OcrError::Einval);
                }
                inner.payload = Some(payload);
                Ok(std::mem::take(&mut inner.waiters))
            }
            EventKind::Idem => {
                let mut inner = self.inner.lock();
                if inner.payload.is_some() {
                    // Legal to ignore a repeat satisfy of an idempotent event.
                    return Ok(Vec::new());
                }
                inner.payload = Some(payload);
                Ok(std::mem::take(&mut inner.waiters))
            }
            EventKind::Counted => {
                let mut inner = self.inner.lock();
                if inner.counted_remaining == 0 {
                    return Err(OcrError::Einval);
                }
                inner.counted_remaining -= 1;
                if inner.counted_remaining == 0 {
                    inner.payload = Some(payload);
                    Ok(std::mem::take(&mut inner.waiters))
                } else {
                    Ok(Vec::new())
                }
            }
            EventKind::Latch => {
                let mut inner = self.inner.lock();
                if inner.payload.is_some() {
                    return Err(OcrError::Einval);
                }
                match latch_op_for_slot(slot) {
                    LatchOp::Incr => inner.latch_count += 1,
                    LatchOp::Decr => inner.latch_count -= 1,
                }
                if inner.latch_count <= 0 {
                    inner.payload = Some(Guid::NULL);
                    Ok(std::mem::take(&mut inner.waiters))
                } else {
                    Ok(Vec::new())
                }
            }
            EventKind::Channel => {
                let mut inner = self.inner.lock();
                if let Some(w) = inner.channel_waiters.pop_front() {
                    Ok(vec![RegNode { guid: w.guid, slot: w.slot }])
                } else if inner.channel_queue.len() < inner.channel_capacity {
                    inner.channel_queue.push_back(payload);
                    Ok(Vec::new())
                } else {
                    Err(OcrError::Ebusy)
                }
            }
        }
    }

    /// Attempts to transition the event into destruction, racing correctly
    /// against a concurrent `satisfy` that hasn't yet flipped
    /// `STATE_CHECKED_IN -> STATE_CHECKED_OUT`. Returns `true` if the
    /// caller won the race and should actually free the event now; `false`
    /// means the in-flight satisfy will see `STATE_DESTROY_SEEN` and must
    /// perform the teardown itself once it finishes draining waiters.
    pub fn begin_destroy(&self) -> bool {
        loop {
            let cur = self.life.load(Ordering::Acquire);
            if cur == STATE_DESTROY_SEEN {
                return false;
            }
            if cur == STATE_CHECKED_OUT {
                return true;
            }
            debug_assert_eq!(cur, STATE_CHECKED_IN);
            match self.life.compare_exchange(
                cur,
                STATE_DESTROY_SEEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(actual) if actual == STATE_CHECKED_OUT => return true,
                Err(_) => continue,
            }
        }
    }

    /// Whether this event has fired (for the persistent kinds, whose
    /// `payload` doubles as the fired-or-not flag). Used by the finish-scope
    /// latch to detect the exact call whose decrement brought the count to
    /// zero, so the scope's output event can be satisfied then rather than
    /// whenever the finish EDT itself happens to reap (spec §4.4/§8
    /// property 4: the output event fires only after every child has too).
    pub fn is_satisfied(&self) -> bool {
        self.inner.lock().payload.is_some()
    }

    /// Called by the satisfy path after it has drained waiters, to flip
    /// itself out of `CHECKED_IN`. Returns `true` if a racing `begin_destroy`
    /// had already marked `DESTROY_SEEN`, meaning this caller now owns
    /// tearing the event down.
    pub fn finish_satisfy_transition(&self) -> bool {
        match self.life.compare_exchange(
            STATE_CHECKED_IN,
            STATE_CHECKED_OUT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(actual) => {
                debug_assert_eq!(actual, STATE_DESTROY_SEEN);
                true
            }
        }
    }
}

fn slot_or(a: u32, b: u32) -> u32 {
    if a != 0 {
        a
    } else {
        b
    }
}

fn latch_op_for_slot(slot: u32) -> LatchOp {
    if slot == 0 {
        LatchOp::Decr
    } else {
        LatchOp::Incr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::LocationId;

    fn guid_for(n: u64) -> Guid {
        let p = crate::guid::GuidProvider::new(LocationId(0));
        let _ = n;
        p.mint(crate::guid::GuidKind::Db)
    }

    #[test]
    fn sticky_fans_out_to_registered_waiters() {
        let e = Event::new(guid_for(1), EventKind::Sticky, 0, 0, 0);
        let w1 = RegNode { guid: guid_for(2), slot: 0 };
        assert_eq!(e.add_dependence(w1).unwrap(), None);
        let payload = guid_for(3);
        let drained = e.satisfy(payload, 0).unwrap();
        assert_eq!(drained, vec![w1]);
        // A late registration gets the cached payload immediately.
        let w2 = RegNode { guid: guid_for(4), slot: 1 };
        assert_eq!(e.add_dependence(w2).unwrap(), Some(payload));
    }

    #[test]
    fn sticky_double_satisfy_is_an_error() {
        let e = Event::new(guid_for(1), EventKind::Sticky, 0, 0, 0);
        e.satisfy(guid_for(2), 0).unwrap();
        assert!(e.satisfy(guid_for(3), 0).is_err());
    }

    #[test]
    fn idem_double_satisfy_is_ignored() {
        let e = Event::new(guid_for(1), EventKind::Idem, 0, 0, 0);
        e.satisfy(guid_for(2), 0).unwrap();
        assert_eq!(e.satisfy(guid_for(3), 0).unwrap(), Vec::new());
    }

    #[test]
    fn counted_fires_once_all_deps_arrive() {
        let e = Event::new(guid_for(1), EventKind::Counted, 0, 3, 0);
        let w = RegNode { guid: guid_for(2), slot: 0 };
        e.add_dependence(w).unwrap();
        assert!(e.satisfy(guid_for(3), 0).unwrap().is_empty());
        assert!(e.satisfy(guid_for(3), 0).unwrap().is_empty());
        assert_eq!(e.satisfy(guid_for(3), 0).unwrap(), vec![w]);
    }

    #[test]
    fn latch_reaches_zero_and_fires() {
        let e = Event::new(guid_for(1), EventKind::Latch, 2, 0, 0);
        let w = RegNode { guid: guid_for(2), slot: 0 };
        e.add_dependence(w).unwrap();
        assert!(e.satisfy(Guid::NULL, 0).unwrap().is_empty());
        assert_eq!(e.satisfy(Guid::NULL, 0).unwrap(), vec![w]);
    }

    #[test]
    fn channel_matches_producer_and_consumer_or_queues() {
        let e = Event::new(guid_for(1), EventKind::Channel, 0, 0, 1);
        let v = guid_for(2);
        assert!(e.satisfy(v, 0).unwrap().is_empty());
        assert!(e.satisfy(guid_for(3), 0).is_err());
        let w = RegNode { guid: guid_for(4), slot: 0 };
        assert_eq!(e.add_dependence(w).unwrap(), Some(v));
    }

    #[test]
    fn destroy_race_is_resolved_by_cas() {
        let e = Event::new(guid_for(1), EventKind::Sticky, 0, 0, 0);
        assert!(!e.begin_destroy());
    }
}
