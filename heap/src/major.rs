//! Major collection: mark the whole heap, slide-compact mature space,
//! empty the nursery into it, and sweep the large-object space.
//!
//! Marking uses the vtable mark bit plus each space's bitmap. Compaction
//! overwrites old locations, so forwarding is kept in a side table. The
//! table is not idempotent (a new address may equal another object's old
//! one), so every slot is fixed exactly once.
//!
//! Referents are processed between marking and compaction; soft referents
//! that were not reached are cleared here and nowhere else.

use std::ptr;

use object::{ObjRef, ReferenceKind, object_size, ref_slots, referent_slot};

use crate::collector::{Collector, owns, run_parallel};
use crate::fixup::{self, FixupPlan, FixupTask, slot_fix};
use crate::references::{self, FinalizerQueue, Liveness, ReferenceOutcome};
use crate::remset::tag_referent;
use crate::{BlockSpace, HeapInner, RootSlot, SweepResult, TableForwarding};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MajorOutcome {
    /// Bytes moved from the nursery into mature space.
    pub promoted_bytes: usize,
    pub mature_live_bytes: usize,
    pub nursery_live_bytes: usize,
    pub large_objects: SweepResult,
    pub references: ReferenceOutcome,
}

// ── Marking ───────────────────────────────────────────────────────────

/// # Safety
///
/// `value` must be null or a reference read from a live slot.
unsafe fn mark(heap: &HeapInner, collector: &mut Collector, value: ObjRef) {
    if value.is_null() {
        return;
    }
    let Some(space) = heap.space_of(value.addr()) else {
        log::error!("major collection reached {value:?} outside the heap");
        panic!("reference {value:?} outside the heap");
    };
    // SAFETY: references into the heap point at objects
    let header = unsafe { value.header() };
    debug_assert!(!header.is_moved(), "forwarded object {value:?} reachable");
    if header.mark_in_vt() {
        heap.bitmap(space).set(value.addr());
        collector.mark_stack.push(value);
    }
}

/// Marks everything reachable from the collector's mark stack. Referent
/// slots are collected instead of followed.
fn trace(heap: &HeapInner, collector: &mut Collector) {
    while let Some(obj) = collector.mark_stack.pop() {
        // SAFETY: only marked objects are pushed
        for slot in unsafe { ref_slots(obj) } {
            // SAFETY: slots of a live object
            unsafe { mark(heap, collector, *slot) };
        }
        // SAFETY: see above
        if let Some(slot) = unsafe { referent_slot(obj) } {
            // SAFETY: see above
            let kind = unsafe { obj.header() }.type_info().reference_kind();
            debug_assert_ne!(kind, ReferenceKind::Strong);
            collector.discovered.push(tag_referent(slot as usize, kind));
        }
    }
}

fn mark_heap(heap: &HeapInner, collectors: &mut [Collector], roots: &[RootSlot]) {
    run_parallel(collectors, |collector, n| {
        for (i, root) in roots.iter().enumerate() {
            if owns(i, collector.id, n) {
                // SAFETY: mutators are parked for the whole cycle
                unsafe { mark(heap, collector, root.get()) };
            }
        }
        trace(heap, collector);
    });
}

/// Reachability by mark bit; objects kept alive for finalization are
/// marked on one worker.
struct Marked<'a> {
    heap: &'a HeapInner,
    collector: &'a mut Collector,
}

impl Liveness for Marked<'_> {
    fn is_reached(&self, obj: ObjRef) -> bool {
        // SAFETY: referents and registered objects are heap objects
        unsafe { obj.header() }.is_marked_in_vt()
    }

    fn keep_alive(&mut self, obj: ObjRef, discovered: &mut Vec<usize>) {
        // SAFETY: `obj` is a registered object that has not been freed
        unsafe { mark(self.heap, self.collector, obj) };
        trace(self.heap, self.collector);
        discovered.append(&mut self.collector.discovered);
    }
}

// ── Compaction planning ───────────────────────────────────────────────

/// Assigns destinations block by block in address order. An object never
/// straddles a block boundary; the tail of a block that cannot hold the
/// next object is left unused.
struct SlideCursor<'a> {
    space: &'a BlockSpace,
    block: usize,
    top: usize,
}

impl<'a> SlideCursor<'a> {
    fn new(space: &'a BlockSpace) -> Self {
        Self {
            space,
            block: 0,
            top: space.start(),
        }
    }

    fn block_end(&self) -> usize {
        self.space.block_base(self.block) + self.space.block_size()
    }

    /// Destination for `size` bytes, or `None` once the space is full.
    fn place(&mut self, size: usize) -> Option<usize> {
        if self.top + size > self.block_end() {
            let next = self.block + 1;
            if next >= self.space.num_blocks() {
                return None;
            }
            self.space.set_frontier(self.block, self.top);
            self.block = next;
            self.top = self.space.block_base(next);
        }
        // blocks past the old allocation cursor may be decommitted
        if !self.space.commit_block(self.block) {
            return None;
        }
        let addr = self.top;
        self.top += size;
        Some(addr)
    }

    /// Publishes the last frontier and returns the number of blocks in use.
    fn finish(self) -> usize {
        self.space.set_frontier(self.block, self.top);
        if self.top == self.space.block_base(self.block) {
            self.block
        } else {
            self.block + 1
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Move {
    from: usize,
    to: usize,
    size: usize,
}

fn marked_in(space: &BlockSpace) -> Vec<usize> {
    let mut marked = Vec::new();
    space
        .bitmap
        .for_each_in(space.start()..space.end(), |addr| marked.push(addr));
    marked
}

struct Plan {
    moves: Vec<Move>,
    forwarding: TableForwarding,
    mature_blocks: usize,
    nursery_blocks: usize,
    outcome: MajorOutcome,
}

/// Assigns every marked object its final address.
///
/// Mature objects slide towards the start of mature space. Nursery
/// objects follow them into the mature tail while it lasts; the rest
/// slide within the nursery. Moves are listed in the order they must run:
/// each destination lies at or below its source, and no move overwrites
/// an object that has not been moved yet.
fn plan_compaction(heap: &HeapInner) -> Plan {
    let mut forwarding = TableForwarding::new();
    let mut moves = Vec::new();
    let mut outcome = MajorOutcome::default();

    let mut place = |obj: ObjRef, to: usize, size: usize| {
        if to == obj.addr() {
            // SAFETY: marked addresses are object starts
            unsafe { obj.header() }.clear_gc_bits();
        } else {
            forwarding.insert(obj, ObjRef::from_addr(to));
            moves.push(Move {
                from: obj.addr(),
                to,
                size,
            });
        }
    };

    let mut mature = SlideCursor::new(&heap.mature);
    for addr in marked_in(&heap.mature) {
        let obj = ObjRef::from_addr(addr);
        // SAFETY: marked addresses are object starts
        let size = unsafe { object_size(obj) };
        let Some(to) = mature.place(size) else {
            log::error!("compaction overran mature space at {obj:?}");
            panic!("mature compaction overran its own space");
        };
        outcome.mature_live_bytes += size;
        place(obj, to, size);
    }

    let mut nursery = SlideCursor::new(&heap.nursery);
    let mut spilled = false;
    for addr in marked_in(&heap.nursery) {
        let obj = ObjRef::from_addr(addr);
        // SAFETY: marked addresses are object starts
        let size = unsafe { object_size(obj) };
        outcome.nursery_live_bytes += size;

        if !spilled {
            if let Some(to) = mature.place(size) {
                outcome.promoted_bytes += size;
                place(obj, to, size);
                continue;
            }
            spilled = true;
        }
        let Some(to) = nursery.place(size) else {
            log::error!("compaction overran the nursery at {obj:?}");
            panic!("nursery compaction overran its own space");
        };
        place(obj, to, size);
    }

    Plan {
        moves,
        forwarding,
        mature_blocks: mature.finish(),
        nursery_blocks: nursery.finish(),
        outcome,
    }
}

/// # Safety
///
/// `moves` must come from [`plan_compaction`] in order, with all mutators
/// parked.
unsafe fn execute_moves(moves: &[Move]) {
    for m in moves {
        // SAFETY: source and destination lie in committed blocks; overlap
        // is allowed since the destination is never above the source
        unsafe { ptr::copy(m.from as *const u8, m.to as *mut u8, m.size) };
        // SAFETY: the destination holds the moved object now
        unsafe { ObjRef::from_addr(m.to).header() }.clear_gc_bits();
    }
}

// ── Cycle ─────────────────────────────────────────────────────────────

pub(crate) fn collect(
    heap: &HeapInner,
    collectors: &mut [Collector],
    roots: &[RootSlot],
    finalizers: &mut FinalizerQueue,
) -> MajorOutcome {
    mark_heap(heap, collectors, roots);

    let mut discovered = Vec::new();
    for collector in collectors.iter_mut() {
        discovered.append(&mut collector.discovered);
    }
    let mut marked = Marked {
        heap,
        collector: &mut collectors[0],
    };
    // SAFETY: discovered slots belong to marked objects, which stay in
    // place until compaction
    let references = unsafe { references::process(&mut marked, discovered, finalizers, true) };
    log::trace!(
        "major: marked {} mature, {} nursery, {} large objects",
        heap.mature.bitmap.count(),
        heap.nursery.bitmap.count(),
        heap.los.bitmap.count()
    );

    let mut plan = plan_compaction(heap);
    plan.outcome.references = references;
    // SAFETY: the plan is fresh and mutators are parked
    unsafe { execute_moves(&plan.moves) };
    heap.mature.truncate(plan.mature_blocks, true);
    heap.nursery.truncate(plan.nursery_blocks, false);
    log::trace!(
        "major: moved {} objects, mature {} blocks, nursery {} blocks",
        plan.moves.len(),
        plan.mature_blocks,
        plan.nursery_blocks
    );

    let los = &heap.los;
    let nursery = &heap.nursery;
    let mut tasks = FixupTask::blocks(&heap.mature, 0..plan.mature_blocks);
    tasks.extend(FixupTask::blocks(nursery, 0..plan.nursery_blocks));
    tasks.extend(FixupTask::marked(
        &los.bitmap,
        los.start()..los.end(),
        heap.marked_chunk(),
        true,
    ));
    let fixup_plan = FixupPlan {
        roots,
        slots: &[],
        tasks,
        young: heap
            .settings
            .generational
            .then(|| nursery.start()..nursery.end()),
    };
    // SAFETY: every live object sits at its final address
    unsafe { fixup::run(collectors, &fixup_plan, &plan.forwarding) };
    finalizers.for_each_entry(|slot| {
        // SAFETY: every entry is a marked object and is fixed once
        unsafe { slot_fix(&plan.forwarding, slot) };
    });

    plan.outcome.large_objects = los.sweep();
    heap.clear_bitmaps();
    plan.outcome
}
