//! Runtime hints: opaque key/value scheduling and placement advice attached
//! to a GUID, per spec §6 (`ocrSetHint`/`ocrGetHint`). The original packs a
//! fixed per-object-kind bitset of known hint properties directly into the
//! object's metadata block (see `ocrHintPropEventHc` in `hc-event.c`); this
//! runtime keeps the same "it's just an associated property bag" spirit but
//! without committing to the fixed hint-property enumeration the spec
//! leaves unspecified, storing hints in a side table keyed by GUID instead.
//!
//! The table is owned by the [`HintTable`] a `PolicyDomain` holds, not a
//! process-global static: `GuidProvider` counters start fresh per instance,
//! so two independent runtimes can mint identical `Guid` bit patterns for
//! their first EDT, first event, and so on. A global table keyed only on
//! those bits would let one runtime instance read or clobber another's
//! hints; scoping the table to the owning `PolicyDomain` closes that.

use std::collections::HashMap;

use spin::RwLock;

use crate::error::{OcrError, OcrResult};
use crate::guid::{Guid, GuidProvider};

/// Per-policy-domain hint storage.
#[derive(Default)]
pub struct HintTable {
    table: RwLock<HashMap<u64, HashMap<String, u64>>>,
}

impl HintTable {
    pub fn new() -> Self {
        Self { table: RwLock::new(HashMap::new()) }
    }

    pub fn set(&self, guids: &GuidProvider, guid: Guid, key: &str, value: u64) -> OcrResult<()> {
        if guids.resolve(guid).is_none() {
            return Err(OcrError::Einval);
        }
        self.table.write().entry(guid.raw()).or_default().insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, guids: &GuidProvider, guid: Guid, key: &str) -> OcrResult<Option<u64>> {
        if guids.resolve(guid).is_none() {
            return Err(OcrError::Einval);
        }
        Ok(self.table.read().get(&guid.raw()).and_then(|m| m.get(key).copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::{GuidKind, LocationId, ObjectRef};
    use std::sync::Arc;

    #[test]
    fn hint_round_trips_for_a_registered_guid() {
        let p = GuidProvider::new(LocationId(0));
        let g = p.mint(GuidKind::Edt);
        // Any registered object will do for this test.
        p.register(g, ObjectRef::EdtTemplate(Arc::new(crate::edt::EdtTemplate::new(
            g, "t", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL)),
        ))));
        let hints = HintTable::new();
        hints.set(&p, g, "affinity", 7).unwrap();
        assert_eq!(hints.get(&p, g, "affinity").unwrap(), Some(7));
        assert_eq!(hints.get(&p, g, "missing").unwrap(), None);
    }

    #[test]
    fn two_hint_tables_do_not_see_each_other() {
        let p = GuidProvider::new(LocationId(0));
        let g = p.mint(GuidKind::Edt);
        p.register(g, ObjectRef::EdtTemplate(Arc::new(crate::edt::EdtTemplate::new(
            g, "t", Some(0), Some(0), Arc::new(|_p, _d| Ok(Guid::NULL)),
        ))));
        let a = HintTable::new();
        let b = HintTable::new();
        a.set(&p, g, "affinity", 1).unwrap();
        assert_eq!(b.get(&p, g, "affinity").unwrap(), None);
    }
}
