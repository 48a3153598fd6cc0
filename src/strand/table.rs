//! The strand table: a bit-indexed tree of strand slots.
//!
//! Grounded on the NT kernel's `ob` object-header bitmap directories plus
//! spec §4.1's description of `nodeFree`/`nodeReady`/`nodeNeedsProcess`.
//! Leaves hold `fanout` strands directly; interior nodes hold `fanout`
//! children (leaves, or further interiors) and summarize them in three
//! bitvectors so a scan for runnable work never has to walk more than one
//! level past where the answer lives.
//!
//! Lock discipline (spec §4.1): upward propagation (freeing a strand, or a
//! child transitioning to/from fully-occupied) locks the child, mutates it,
//! then locks the parent before releasing the child — child before parent.
//! Downward descent (claiming a path to insert) never holds two node locks
//! at once: the parent's lock is released before the child's is taken. The
//! two directions never block each other because neither ever holds both
//! locks simultaneously in the same order the other forbids.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::bitmap::AtomicBitmap64;
use crate::error::{OcrError, OcrResult};
use crate::guid::Guid;
use crate::message::PdMessageKind;
use crate::strand::action::Action;
use crate::strand::strand::Strand;

struct ParentLink {
    node: Weak<StrandTableNode>,
    slot: u32,
}

struct LeafNode {
    strands: Vec<Arc<Strand>>,
    free: AtomicBitmap64,
    ready: AtomicBitmap64,
    needs_process: AtomicBitmap64,
    parent: Mutex<Option<ParentLink>>,
}

struct InteriorNode {
    /// `level - 1` is the level of this node's children; `level == 1` means
    /// children are leaves.
    level: u32,
    children: Mutex<Vec<Option<Arc<StrandTableNode>>>>,
    free: AtomicBitmap64,
    ready: AtomicBitmap64,
    needs_process: AtomicBitmap64,
    parent: Mutex<Option<ParentLink>>,
    fanout: u32,
}

enum StrandTableNode {
    Leaf(LeafNode),
    Interior(InteriorNode),
}

impl StrandTableNode {
    fn new_leaf(fanout: u32) -> Arc<Self> {
        let mut strands = Vec::with_capacity(fanout as usize);
        strands.resize_with(fanout as usize, || Arc::new(Strand::new_free()));
        let all_free = if fanout >= 64 { u64::MAX } else { (1u64 << fanout) - 1 };
        Arc::new(StrandTableNode::Leaf(LeafNode {
            strands,
            free: AtomicBitmap64::new(all_free),
            ready: AtomicBitmap64::new(0),
            needs_process: AtomicBitmap64::new(0),
            parent: Mutex::new(None),
        }))
    }

    fn new_interior(fanout: u32, level: u32) -> Arc<Self> {
        let mut children = Vec::with_capacity(fanout as usize);
        children.resize_with(fanout as usize, || None);
        let all_free = if fanout >= 64 { u64::MAX } else { (1u64 << fanout) - 1 };
        Arc::new(StrandTableNode::Interior(InteriorNode {
            level,
            children: Mutex::new(children),
            free: AtomicBitmap64::new(all_free),
            ready: AtomicBitmap64::new(0),
            needs_process: AtomicBitmap64::new(0),
            parent: Mutex::new(None),
        }))
    }

    fn free_bits(&self) -> &AtomicBitmap64 {
        match self {
            StrandTableNode::Leaf(l) => &l.free,
            StrandTableNode::Interior(i) => &i.free,
        }
    }

    fn ready_bits(&self) -> &AtomicBitmap64 {
        match self {
            StrandTableNode::Leaf(l) => &l.ready,
            StrandTableNode::Interior(i) => &i.ready,
        }
    }

    fn needs_process_bits(&self) -> &AtomicBitmap64 {
        match self {
            StrandTableNode::Leaf(l) => &l.needs_process,
            StrandTableNode::Interior(i) => &i.needs_process,
        }
    }

    fn parent(&self) -> &Mutex<Option<ParentLink>> {
        match self {
            StrandTableNode::Leaf(l) => &l.parent,
            StrandTableNode::Interior(i) => &i.parent,
        }
    }

    fn set_parent(&self, node: &Arc<StrandTableNode>, slot: u32) {
        *self.parent().lock() = Some(ParentLink { node: Arc::downgrade(node), slot });
    }
}

/// Propagates a bitvector bit change up the tree, stopping as soon as an
/// ancestor's summary bit does not itself need to change.
fn propagate_up(
    mut node: Arc<StrandTableNode>,
    bits: fn(&StrandTableNode) -> &AtomicBitmap64,
    new_value: bool,
) {
    loop {
        let parent_link = node.parent().lock().take();
        let Some(link) = parent_link else { break };
        let Some(parent) = link.node.upgrade() else { break };
        // Restore the link we just took (we're only inspecting, not severing it).
        *node.parent().lock() = Some(ParentLink { node: Arc::downgrade(&parent), slot: link.slot });
        let parent_bits = bits(&parent);
        let was_set = if new_value {
            parent_bits.set(link.slot, Ordering::AcqRel)
        } else {
            parent_bits.clear(link.slot, Ordering::AcqRel)
        };
        if was_set == new_value {
            // Parent's summary bit already matched; nothing further changes.
            break;
        }
        node = parent;
    }
}

/// A handle identifying a live strand inside the table, stable for the
/// strand's lifetime (until [`StrandTable::free_strand`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StrandHandle(u64);

/// Owns the strand-table tree and dispatches work against it.
pub struct StrandTable {
    head: Mutex<Option<Arc<StrandTableNode>>>,
    fanout: u32,
    process_max_count: u32,
    index: spin::RwLock<std::collections::HashMap<u64, StrandSlot>>,
    next_index: std::sync::atomic::AtomicU64,
    /// The owning policy domain's message handler, invoked for every
    /// `Action::Dispatch` a strand carries. Set once, after construction,
    /// by whoever owns this table (the table itself has no PD reference,
    /// to keep it usable standalone in tests).
    dispatcher: Mutex<Option<Arc<dyn Fn(PdMessageKind) + Send + Sync>>>,
}

/// A live strand plus the leaf/index it was claimed from, so `free_strand`
/// can return its bit to the tree instead of leaking tree capacity forever
/// while still freeing the flat index entry (spec §4.1's "freeing a strand
/// ... sets the nodeFree bit of its leaf").
struct StrandSlot {
    strand: Arc<Strand>,
    leaf: Weak<StrandTableNode>,
    slot: u32,
}

impl StrandTable {
    pub fn new(fanout: u32, process_max_count: u32) -> Self {
        Self {
            head: Mutex::new(None),
            fanout,
            process_max_count,
            index: spin::RwLock::new(std::collections::HashMap::new()),
            next_index: std::sync::atomic::AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        }
    }

    /// Registers the handler `process_strands` invokes for every queued
    /// `Action::Dispatch`. The policy domain calls this once, right after
    /// constructing itself, with a weak-upgrading closure so the table
    /// doesn't keep it alive forever.
    pub fn set_dispatcher(&self, f: Arc<dyn Fn(PdMessageKind) + Send + Sync>) {
        *self.dispatcher.lock() = Some(f);
    }

    /// Allocates a strand parked on `event`, returning a stable handle.
    pub fn get_new_strand(&self, event: Guid) -> OcrResult<StrandHandle> {
        loop {
            let root = {
                let mut head = self.head.lock();
                if head.is_none() {
                    *head = Some(StrandTableNode::new_leaf(self.fanout));
                }
                head.as_ref().unwrap().clone()
            };
            if root.free_bits().is_zero(Ordering::Acquire) {
                self.grow_head(&root);
                continue;
            }
            return self.insert_into(root, event);
        }
    }

    /// Wraps the current head in a new interior node, making it child 0.
    fn grow_head(&self, observed_root: &Arc<StrandTableNode>) {
        let mut head = self.head.lock();
        let Some(cur) = head.clone() else { return };
        if !Arc::ptr_eq(&cur, observed_root) {
            // Someone else already grew it.
            return;
        }
        let child_level = match &*cur {
            StrandTableNode::Leaf(_) => 0,
            StrandTableNode::Interior(i) => i.level,
        };
        let new_root = StrandTableNode::new_interior(self.fanout, child_level + 1);
        if let StrandTableNode::Interior(i) = &*new_root {
            i.children.lock()[0] = Some(cur.clone());
            // The wrapped subtree is fully present, so its single occupied
            // slot keeps the new root's free bit set everywhere else; clear
            // only if the old root was already fully non-free.
            if cur.free_bits().is_zero(Ordering::Acquire) {
                i.free.clear(0, Ordering::AcqRel);
            }
        }
        cur.set_parent(&new_root, 0);
        *head = Some(new_root);
    }

    fn insert_into(&self, node: Arc<StrandTableNode>, event: Guid) -> OcrResult<StrandHandle> {
        match &*node {
            StrandTableNode::Leaf(leaf) => {
                let idx = leaf.free.try_claim_first_set().ok_or(OcrError::Enomem)?;
                let strand = leaf.strands[idx as usize].clone();
                {
                    let mut guard = strand.lock();
                    guard.set_cur_event(Some(event));
                    guard.set_flags(crate::strand::strand::StrandProperties::WAIT_EVT);
                }
                if leaf.free.is_zero(Ordering::Acquire) {
                    propagate_up(node.clone(), StrandTableNode::free_bits, false);
                }
                let handle = self.next_index.fetch_add(1, Ordering::Relaxed);
                self.index.write().insert(
                    handle,
                    StrandSlot { strand, leaf: Arc::downgrade(&node), slot: idx },
                );
                Ok(StrandHandle(handle))
            }
            StrandTableNode::Interior(interior) => {
                let child_idx = {
                    let children = interior.children.lock();
                    let Some(idx) = interior.free.first_set(Ordering::Acquire) else {
                        return Err(OcrError::Enomem);
                    };
                    if children[idx as usize].is_none() {
                        drop(children);
                        let child = if interior.level == 1 {
                            StrandTableNode::new_leaf(self.fanout)
                        } else {
                            StrandTableNode::new_interior(self.fanout, interior.level - 1)
                        };
                        child.set_parent(&node, idx);
                        interior.children.lock()[idx as usize] = Some(child);
                    }
                    idx
                };
                let child = interior.children.lock()[child_idx as usize].clone().unwrap();
                // Parent lock already released by scope end above; recurse.
                let result = self.insert_into(child.clone(), event)?;
                if child.free_bits().is_zero(Ordering::Acquire) {
                    interior.free.clear(child_idx, Ordering::AcqRel);
                    if interior.free.is_zero(Ordering::Acquire) {
                        propagate_up(node.clone(), StrandTableNode::free_bits, false);
                    }
                }
                Ok(result)
            }
        }
    }

    fn strand_for(&self, handle: StrandHandle) -> Option<Arc<Strand>> {
        self.index.read().get(&handle.0).map(|s| s.strand.clone())
    }

    /// Appends an action to a strand's queue and marks its leaf (and every
    /// ancestor up to the root) as needing processing, so `process_strands`'s
    /// bitscan actually finds it instead of relying on a linear index scan.
    pub fn enqueue_action(&self, handle: StrandHandle, action: Action) -> OcrResult<()> {
        let slot = {
            let index = self.index.read();
            let s = index.get(&handle.0).ok_or(OcrError::Einval)?;
            (s.strand.clone(), s.leaf.clone(), s.slot)
        };
        let (strand, leaf, idx) = slot;
        {
            let mut guard = strand.lock();
            guard.push_action(action);
        }
        if let Some(leaf) = leaf.upgrade() {
            let was_set = leaf.needs_process_bits().set(idx, Ordering::AcqRel);
            if !was_set {
                propagate_up(leaf, StrandTableNode::needs_process_bits, true);
            }
        }
        Ok(())
    }

    /// Runs up to `process_max_count` pending actions across strands whose
    /// leaf has its `nodeNeedsProcess` bit set, descending the tree via
    /// bitscan (spec §4.1) rather than a linear scan over every live strand.
    pub fn process_strands(&self) -> u32 {
        let mut processed = 0u32;
        let root = self.head.lock().clone();
        if let Some(root) = root {
            self.process_node(&root, &mut processed);
        }
        processed
    }

    fn process_node(&self, node: &Arc<StrandTableNode>, processed: &mut u32) {
        match &**node {
            StrandTableNode::Leaf(leaf) => {
                while *processed < self.process_max_count {
                    let Some(slot) = leaf.needs_process.first_set(Ordering::Acquire) else { break };
                    let strand = leaf.strands[slot as usize].clone();
                    let mut drained = false;
                    while *processed < self.process_max_count {
                        let action = {
                            let mut guard = strand.lock();
                            guard.pop_action()
                        };
                        match action {
                            Some(Action::Callback(f)) => {
                                let event = strand.lock().cur_event().unwrap_or(Guid::NULL);
                                f(event);
                                *processed += 1;
                            }
                            Some(Action::Dispatch(kind)) => {
                                let dispatcher = self.dispatcher.lock().clone();
                                if let Some(d) = dispatcher {
                                    d(kind);
                                }
                                *processed += 1;
                            }
                            None => {
                                drained = true;
                                break;
                            }
                        }
                    }
                    if drained {
                        let was_set = leaf.needs_process.clear(slot, Ordering::AcqRel);
                        if was_set {
                            propagate_up(node.clone(), StrandTableNode::needs_process_bits, false);
                        }
                    } else {
                        // Hit process_max_count mid-strand; bit stays set so
                        // the next call picks this strand back up.
                        break;
                    }
                }
            }
            StrandTableNode::Interior(interior) => {
                while *processed < self.process_max_count {
                    let Some(idx) = interior.needs_process.first_set(Ordering::Acquire) else { break };
                    let child = interior.children.lock()[idx as usize].clone();
                    match child {
                        Some(child) => self.process_node(&child, processed),
                        None => {
                            interior.needs_process.clear(idx, Ordering::AcqRel);
                        }
                    }
                }
            }
        }
    }

    /// Marks a strand ready or not-ready, propagating the summary bit up its
    /// leaf's ancestor chain the same way `free_strand` propagates `free`.
    pub fn set_ready(&self, handle: StrandHandle, ready: bool) -> OcrResult<()> {
        let (leaf, idx) = {
            let index = self.index.read();
            let s = index.get(&handle.0).ok_or(OcrError::Einval)?;
            (s.leaf.clone(), s.slot)
        };
        let Some(leaf) = leaf.upgrade() else { return Ok(()) };
        let was_set = if ready {
            leaf.ready_bits().set(idx, Ordering::AcqRel)
        } else {
            leaf.ready_bits().clear(idx, Ordering::AcqRel)
        };
        if was_set != ready {
            propagate_up(leaf, StrandTableNode::ready_bits, ready);
        }
        Ok(())
    }

    /// Returns a strand to the table's free pool: clears its data, then sets
    /// its leaf's `nodeFree` bit (and clears `nodeReady`, since a free strand
    /// is never ready) and propagates both changes up the tree (spec §4.1).
    pub fn free_strand(&self, handle: StrandHandle) -> OcrResult<()> {
        let slot = self.index.write().remove(&handle.0).ok_or(OcrError::Einval)?;
        {
            let mut guard = slot.strand.lock();
            guard.reset_to_free();
        }
        if let Some(leaf) = slot.leaf.upgrade() {
            let was_ready = leaf.ready_bits().clear(slot.slot, Ordering::AcqRel);
            if was_ready {
                propagate_up(leaf.clone(), StrandTableNode::ready_bits, false);
            }
            let was_free = leaf.free_bits().set(slot.slot, Ordering::AcqRel);
            if !was_free {
                propagate_up(leaf, StrandTableNode::free_bits, true);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_round_trip() {
        let table = StrandTable::new(4, 16);
        let h = table.get_new_strand(Guid::UNINITIALIZED).unwrap();
        assert!(table.strand_for(h).is_some());
        table.free_strand(h).unwrap();
        assert!(table.strand_for(h).is_none());
    }

    #[test]
    fn freeing_a_strand_reclaims_its_leaf_slot() {
        // A table sized for exactly `fanout` live strands must still be able
        // to service `fanout` more allocations after freeing all of the
        // first batch — otherwise freed capacity silently leaks forever.
        let table = StrandTable::new(4, 16);
        let first_batch: Vec<_> = (0..4).map(|_| table.get_new_strand(Guid::NULL).unwrap()).collect();
        for h in first_batch {
            table.free_strand(h).unwrap();
        }
        for _ in 0..4 {
            table.get_new_strand(Guid::NULL).unwrap();
        }
    }

    #[test]
    fn allocation_grows_past_single_leaf() {
        let table = StrandTable::new(2, 16);
        let mut handles = Vec::new();
        for _ in 0..10 {
            handles.push(table.get_new_strand(Guid::UNINITIALIZED).unwrap());
        }
        assert_eq!(handles.len(), 10);
        for h in handles {
            assert!(table.strand_for(h).is_some());
        }
    }

    #[test]
    fn enqueue_and_process_runs_callbacks() {
        let table = StrandTable::new(4, 16);
        let h = table.get_new_strand(Guid::NULL).unwrap();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        table
            .enqueue_action(h, Action::Callback(Arc::new(move |_g| {
                ran2.store(true, Ordering::SeqCst);
            })))
            .unwrap();
        let n = table.process_strands();
        assert_eq!(n, 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn process_strands_skips_strands_with_no_queued_work() {
        // Only the strand that actually had `enqueue_action` called on it
        // should run anything; a bitscan over `needs_process` must not
        // degrade into touching every live strand.
        let table = StrandTable::new(4, 16);
        let idle = table.get_new_strand(Guid::NULL).unwrap();
        let busy = table.get_new_strand(Guid::NULL).unwrap();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        table
            .enqueue_action(busy, Action::Callback(Arc::new(move |_g| {
                ran2.store(true, Ordering::SeqCst);
            })))
            .unwrap();
        let n = table.process_strands();
        assert_eq!(n, 1);
        assert!(ran.load(Ordering::SeqCst));
        // A second pass finds nothing left to do.
        assert_eq!(table.process_strands(), 0);
        let _ = idle;
    }

    #[test]
    fn enqueue_sets_needs_process_and_draining_clears_it() {
        let table = StrandTable::new(4, 16);
        let h = table.get_new_strand(Guid::NULL).unwrap();
        table.enqueue_action(h, Action::Callback(Arc::new(|_g| {}))).unwrap();
        let leaf = table.head.lock().clone().unwrap();
        let needs_process = leaf.needs_process_bits();
        assert!(!needs_process.is_zero(Ordering::SeqCst));
        table.process_strands();
        assert!(needs_process.is_zero(Ordering::SeqCst));
    }

    #[test]
    fn set_ready_propagates_the_ready_bit() {
        let table = StrandTable::new(4, 16);
        let h = table.get_new_strand(Guid::NULL).unwrap();
        let leaf = table.head.lock().clone().unwrap();
        table.set_ready(h, true).unwrap();
        assert!(!leaf.ready_bits().is_zero(Ordering::SeqCst));
        table.set_ready(h, false).unwrap();
        assert!(leaf.ready_bits().is_zero(Ordering::SeqCst));
    }

    #[test]
    fn dispatch_actions_invoke_the_registered_dispatcher() {
        let table = StrandTable::new(4, 16);
        let h = table.get_new_strand(Guid::NULL).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        table.set_dispatcher(Arc::new(move |kind| {
            *seen2.lock() = Some(kind);
        }));
        table.enqueue_action(h, Action::Dispatch(PdMessageKind::Shutdown)).unwrap();
        let n = table.process_strands();
        assert_eq!(n, 1);
        assert!(matches!(*seen.lock(), Some(PdMessageKind::Shutdown)));
    }
}
