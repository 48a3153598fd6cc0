//! Memory allocator abstraction.
//!
//! Spec §0/§9 calls out that the original's `ocrDbMalloc`/`ocrDbFree` family
//! (allocating raw memory from inside a running EDT, independent of any
//! datablock) falls outside this crate's scope — see SPEC_FULL.md's Open
//! Questions. What stays in scope is the allocator seam itself: datablock
//! backing storage is requested through a `MemoryAllocator` trait rather
//! than calling `Vec::with_capacity` directly, mirroring how the original
//! routes every datablock's backing memory through a policy-domain-selected
//! `ocrAllocator_t`, so a deployment can swap in an arena or a pool without
//! touching `Datablock`.

use crate::error::{OcrError, OcrResult};

/// A source of datablock backing memory.
pub trait MemoryAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> OcrResult<Vec<u8>>;
}

/// The default allocator: the global heap, zero-initialized.
pub struct SystemAllocator;

impl MemoryAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> OcrResult<Vec<u8>> {
        if size == 0 {
            return Err(OcrError::Einval);
        }
        Ok(vec![0u8; size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocator_zero_fills() {
        let a = SystemAllocator;
        let buf = a.allocate(8).unwrap();
        assert_eq!(buf, vec![0u8; 8]);
        assert!(a.allocate(0).is_err());
    }
}
