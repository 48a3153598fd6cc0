//! Global identifiers and the GUID provider.
//!
//! A [`Guid`] is the opaque handle every first-class OCR object (datablock,
//! event, EDT, EDT template) is known by. It carries a kind tag and a home
//! location, exactly as spec'd, but — per the redesign note on cyclic
//! metadata graphs — it never carries a raw pointer. Resolving a `Guid` to
//! its metadata always goes through [`GuidProvider::resolve`], which hands
//! back a cheap `Arc` clone out of the provider's arena. The arena owns the
//! object; the `Guid` is a weak, `Copy`, thread-safe reference to it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::datablock::Datablock;
use crate::edt::{Edt, EdtTemplate};
use crate::event::Event;

/// Which kind of object a [`Guid`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GuidKind {
    None = 0,
    Db = 1,
    EventOnce = 2,
    EventLatch = 3,
    EventSticky = 4,
    EventIdem = 5,
    EventCounted = 6,
    EventChannel = 7,
    Edt = 8,
    EdtTemplate = 9,
    Policy = 10,
}

impl GuidKind {
    pub fn is_event(self) -> bool {
        matches!(
            self,
            GuidKind::EventOnce
                | GuidKind::EventLatch
                | GuidKind::EventSticky
                | GuidKind::EventIdem
                | GuidKind::EventCounted
                | GuidKind::EventChannel
        )
    }
}

/// A PD's location in the machine tree; opaque outside the run-level and
/// datablock ITW-location logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(pub u32);

impl LocationId {
    pub const INVALID: LocationId = LocationId(u32::MAX);
}

/// Opaque 64-bit global identifier.
///
/// Layout (not contractual, never inspected by user code): bits 56..64 are
/// the [`GuidKind`] tag, bits 32..56 are the home [`LocationId`], bits 0..32
/// are a per-(kind, location) monotonic counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Guid(u64);

const KIND_SHIFT: u32 = 56;
const LOCATION_SHIFT: u32 = 32;
const LOCATION_MASK: u64 = 0x00FF_FFFF;
const COUNTER_MASK: u64 = 0xFFFF_FFFF;

impl Guid {
    /// Unset GUID slot — no object, no pending allocation.
    pub const NULL: Guid = Guid(0);
    /// Allocated slot pending fill (e.g. `ocrGuidReserve`-style paramv/depv
    /// entries before `add-dependence` has run).
    pub const UNINITIALIZED: Guid = Guid(u64::MAX);

    fn new(kind: GuidKind, location: LocationId, counter: u64) -> Self {
        let bits = ((kind as u64) << KIND_SHIFT)
            | ((location.0 as u64 & LOCATION_MASK) << LOCATION_SHIFT)
            | (counter & COUNTER_MASK);
        Guid(bits)
    }

    pub fn is_null(self) -> bool {
        self == Guid::NULL
    }

    pub fn is_uninitialized(self) -> bool {
        self == Guid::UNINITIALIZED
    }

    pub fn kind(self) -> GuidKind {
        match (self.0 >> KIND_SHIFT) & 0xFF {
            0 => GuidKind::None,
            1 => GuidKind::Db,
            2 => GuidKind::EventOnce,
            3 => GuidKind::EventLatch,
            4 => GuidKind::EventSticky,
            5 => GuidKind::EventIdem,
            6 => GuidKind::EventCounted,
            7 => GuidKind::EventChannel,
            8 => GuidKind::Edt,
            9 => GuidKind::EdtTemplate,
            _ => GuidKind::Policy,
        }
    }

    pub fn location(self) -> LocationId {
        LocationId(((self.0 >> LOCATION_SHIFT) & LOCATION_MASK) as u32)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Reconstructs a `Guid` from its raw bit pattern, e.g. after
    /// unmarshalling one off the wire (spec §6). Not a mint: the kind and
    /// location tags are taken verbatim from the bits, not freshly assigned.
    pub fn from_raw(bits: u64) -> Self {
        Guid(bits)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Guid(NULL)")
        } else if self.is_uninitialized() {
            write!(f, "Guid(UNINITIALIZED)")
        } else {
            write!(f, "Guid({:?}@{}:{:#x})", self.kind(), self.location().0, self.0 & COUNTER_MASK)
        }
    }
}

/// The cached, locally-resolved payload a [`FatGuid`] carries alongside its
/// [`Guid`]. The `Guid` stays authoritative; this is purely a dereference
/// shortcut, refreshed by calling [`GuidProvider::resolve`] again.
#[derive(Clone)]
pub enum ObjectRef {
    Datablock(Arc<Datablock>),
    Event(Arc<Event>),
    Edt(Arc<Edt>),
    EdtTemplate(Arc<EdtTemplate>),
}

impl ObjectRef {
    pub fn as_datablock(&self) -> Option<&Arc<Datablock>> {
        match self {
            ObjectRef::Datablock(d) => Some(d),
            _ => None,
        }
    }
    pub fn as_event(&self) -> Option<&Arc<Event>> {
        match self {
            ObjectRef::Event(e) => Some(e),
            _ => None,
        }
    }
    pub fn as_edt(&self) -> Option<&Arc<Edt>> {
        match self {
            ObjectRef::Edt(t) => Some(t),
            _ => None,
        }
    }
    pub fn as_edt_template(&self) -> Option<&Arc<EdtTemplate>> {
        match self {
            ObjectRef::EdtTemplate(t) => Some(t),
            _ => None,
        }
    }
}

/// A GUID paired with an optional cached dereference, per spec §3.
#[derive(Clone)]
pub struct FatGuid {
    pub guid: Guid,
    pub cached: Option<ObjectRef>,
}

impl FatGuid {
    pub fn new(guid: Guid) -> Self {
        Self { guid, cached: None }
    }

    pub fn with_cache(guid: Guid, obj: ObjectRef) -> Self {
        Self { guid, cached: Some(obj) }
    }
}

/// Mints GUIDs and owns the arena mapping them to their metadata.
///
/// Stands in for the external GUID provider named (but not designed) by
/// spec §1/§6 — only its interface (mint / register / resolve / release) is
/// consumed by the rest of the engine.
pub struct GuidProvider {
    location: LocationId,
    counters: [AtomicU64; 11],
    table: spin::RwLock<HashMap<u64, ObjectRef>>,
}

impl GuidProvider {
    pub fn new(location: LocationId) -> Self {
        Self {
            location,
            counters: Default::default(),
            table: spin::RwLock::new(HashMap::new()),
        }
    }

    pub fn location(&self) -> LocationId {
        self.location
    }

    /// Mints a fresh GUID of the given kind but does not register any
    /// metadata for it yet — callers fill in the object, then call
    /// [`GuidProvider::register`].
    pub fn mint(&self, kind: GuidKind) -> Guid {
        let counter = self.counters[kind as usize].fetch_add(1, Ordering::Relaxed) + 1;
        Guid::new(kind, self.location, counter)
    }

    pub fn register(&self, guid: Guid, obj: ObjectRef) {
        self.table.write().insert(guid.raw(), obj);
    }

    pub fn resolve(&self, guid: Guid) -> Option<ObjectRef> {
        if guid.is_null() || guid.is_uninitialized() {
            return None;
        }
        self.table.read().get(&guid.raw()).cloned()
    }

    /// Releases a GUID's arena slot. Called once an object's refcount and
    /// lifecycle rules (spec §3 per-kind invariants) say it is safe to
    /// reclaim; does not itself enforce those rules.
    pub fn release(&self, guid: Guid) {
        self.table.write().remove(&guid.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_round_trips_kind_and_location() {
        let p = GuidProvider::new(LocationId(3));
        let g = p.mint(GuidKind::Edt);
        assert_eq!(g.kind(), GuidKind::Edt);
        assert_eq!(g.location(), LocationId(3));
        assert!(!g.is_null());
    }

    #[test]
    fn null_and_uninitialized_are_distinct_sentinels() {
        assert!(Guid::NULL.is_null());
        assert!(Guid::UNINITIALIZED.is_uninitialized());
        assert_ne!(Guid::NULL, Guid::UNINITIALIZED);
    }
}
