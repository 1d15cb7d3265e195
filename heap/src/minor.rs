//! Minor collection: evacuate live nursery objects into mature space.
//!
//! Every collector traces its share of the roots and remembered slots and
//! copies the nursery objects it reaches into its own promotion block. A
//! copy is made first and then claimed by installing the forwarding
//! pointer with a compare-exchange; a worker that loses the race gives
//! its copy back and leaves the object to the winner, so each object is
//! promoted once. Grey objects move between workers through a
//! [`WorkPool`].
//!
//! An object that cannot be promoted because mature space ran out is
//! marked in place instead and the cycle reports a fallback, which the
//! caller escalates. Slots are rewritten afterwards by the parallel fixup
//! pass, reading forwarding state from headers.

use std::ops::AddAssign;
use std::ptr;

use object::{
    Header, InfoTag, MarkParity, ObjRef, ReferenceKind, object_size, ref_slots, referent_slot,
};
use parking_lot::Mutex;

use crate::collector::{Collector, SHARE_INTERVAL, WorkPool, owns, run_parallel};
use crate::fixup::{self, FixupPlan, FixupTask, slot_fix};
use crate::references::{self, FinalizerQueue, Liveness, ReferenceOutcome};
use crate::remset::{tag_referent, untag};
use crate::{HeaderForwarding, HeapInner, RootSlot, Space};

/// Result of a minor cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MinorOutcome {
    pub promoted_bytes: usize,
    /// Objects kept in the nursery because promotion failed.
    pub fallback: usize,
    pub fallback_bytes: usize,
    pub references: ReferenceOutcome,
}

impl AddAssign for MinorOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.promoted_bytes += rhs.promoted_bytes;
        self.fallback += rhs.fallback;
        self.fallback_bytes += rhs.fallback_bytes;
        self.references += rhs.references;
    }
}

// ── Evacuator ─────────────────────────────────────────────────────────

struct Evacuator<'a> {
    heap: &'a HeapInner,
    collector: &'a mut Collector,
    pool: &'a WorkPool,
    parity: MarkParity,
    generational: bool,
    pushes: usize,
    outcome: MinorOutcome,
}

impl<'a> Evacuator<'a> {
    fn new(heap: &'a HeapInner, collector: &'a mut Collector, pool: &'a WorkPool) -> Self {
        Self {
            heap,
            collector,
            pool,
            parity: heap.parity(),
            generational: heap.settings.generational,
            pushes: 0,
            outcome: MinorOutcome::default(),
        }
    }

    #[inline(always)]
    fn push(&mut self, obj: ObjRef) {
        self.collector.mark_stack.push(obj);
        self.pushes += 1;
        if self.pushes.is_multiple_of(SHARE_INTERVAL) {
            self.pool.share(&mut self.collector.mark_stack);
        }
    }

    /// # Safety
    ///
    /// `slot` must be a root or a reference slot of a live object.
    unsafe fn visit(&mut self, slot: *mut ObjRef) {
        // SAFETY: forwarded from caller
        let value = unsafe { *slot };
        if value.is_null() {
            return;
        }
        match self.heap.space_of(value.addr()) {
            // SAFETY: references into the heap point at objects
            Some(Space::Nursery) => unsafe { self.evacuate(value) },
            Some(space) if !self.generational => {
                // SAFETY: see above
                let header = unsafe { value.header() };
                if header.mark_in_info(self.parity) {
                    self.heap.bitmap(space).set(value.addr());
                    self.push(value);
                }
            }
            Some(_) => {}
            None => {
                log::error!("minor collection reached {value:?} outside the heap");
                panic!("reference {value:?} outside the heap");
            }
        }
    }

    /// Remembered referent slots of weak and phantom references are only
    /// discovered; soft referents survive every minor cycle.
    ///
    /// # Safety
    ///
    /// `entry` must come from the remembered set of this cycle.
    unsafe fn visit_remembered(&mut self, entry: usize) {
        let (slot, kind) = untag(entry);
        match kind {
            // SAFETY: remembered slots lie in mature or large objects,
            // neither of which moves outside a major cycle
            ReferenceKind::Strong | ReferenceKind::Soft => unsafe {
                self.visit(slot as *mut ObjRef)
            },
            ReferenceKind::Weak | ReferenceKind::Phantom => self.collector.discovered.push(entry),
        }
    }

    /// Copies `obj` into mature space unless another worker already
    /// claimed it.
    ///
    /// # Safety
    ///
    /// `obj` must be a nursery object.
    unsafe fn evacuate(&mut self, obj: ObjRef) {
        // SAFETY: forwarded from caller
        let header = unsafe { obj.header() };
        let mut raw = header.info_raw();
        if InfoTag::of(raw, self.parity) != InfoTag::Unmarked {
            return;
        }
        // SAFETY: the vtable word is never rewritten during a minor cycle
        let size = unsafe { object_size(obj) };

        loop {
            let claimed = match self.collector.promote_alloc(&self.heap.mature, size) {
                Some(addr) => {
                    // SAFETY: addr is a fresh mature allocation of `size`
                    // bytes; object bodies are not written while tracing
                    unsafe {
                        ptr::copy_nonoverlapping(
                            obj.as_ptr().add(Header::SIZE),
                            (addr + Header::SIZE) as *mut u8,
                            size - Header::SIZE,
                        );
                        header.copy_to(addr as *mut Header, raw);
                    }
                    let dest = ObjRef::from_addr(addr);
                    match header.try_forward(raw, dest) {
                        Ok(()) => {
                            self.outcome.promoted_bytes += size;
                            self.push(dest);
                            Ok(())
                        }
                        Err(actual) => {
                            self.collector.undo_promote(addr, size);
                            Err(actual)
                        }
                    }
                }
                None => match header.try_mark_in_info(raw, self.parity) {
                    Ok(()) => {
                        self.heap.nursery.bitmap.set(obj.addr());
                        self.outcome.fallback += 1;
                        self.outcome.fallback_bytes += size;
                        self.push(obj);
                        Ok(())
                    }
                    Err(actual) => Err(actual),
                },
            };
            match claimed {
                Ok(()) => return,
                Err(actual) if InfoTag::of(actual, self.parity) != InfoTag::Unmarked => return,
                Err(actual) => raw = actual,
            }
        }
    }

    /// # Safety
    ///
    /// `obj` must be a promoted copy or an object marked this cycle.
    unsafe fn scan(&mut self, obj: ObjRef) {
        // SAFETY: forwarded from caller
        for slot in unsafe { ref_slots(obj) } {
            // SAFETY: slots of a live object
            unsafe { self.visit(slot) };
        }
        // SAFETY: see above
        if let Some(slot) = unsafe { referent_slot(obj) } {
            // SAFETY: see above
            match unsafe { obj.header() }.type_info().reference_kind() {
                // SAFETY: the referent slot of a live object
                ReferenceKind::Soft => unsafe { self.visit(slot) },
                kind => self
                    .collector
                    .discovered
                    .push(tag_referent(slot as usize, kind)),
            }
        }
    }

    fn drain(&mut self) {
        loop {
            while let Some(obj) = self.collector.mark_stack.pop() {
                // SAFETY: only promoted copies and marked objects are pushed
                unsafe { self.scan(obj) };
            }
            if !self.pool.steal(&mut self.collector.mark_stack) {
                break;
            }
        }
    }
}

// ── Reference processing ──────────────────────────────────────────────

/// Answers reachability for the nursery and evacuates objects kept alive
/// for finalization on a single worker.
struct Survivors<'a> {
    heap: &'a HeapInner,
    collector: &'a mut Collector,
    parity: MarkParity,
    outcome: MinorOutcome,
}

impl Liveness for Survivors<'_> {
    fn is_reached(&self, obj: ObjRef) -> bool {
        if !self.heap.nursery.contains(obj.addr()) {
            return true;
        }
        // SAFETY: nursery references point at objects
        unsafe { obj.header() }.tag(self.parity) != InfoTag::Unmarked
    }

    fn keep_alive(&mut self, obj: ObjRef, discovered: &mut Vec<usize>) {
        let pool = WorkPool::new(1);
        let mut evac = Evacuator::new(self.heap, self.collector, &pool);
        let mut root = obj;
        // SAFETY: `root` is a local slot holding a registered object
        unsafe { evac.visit(&mut root) };
        evac.drain();
        self.outcome += evac.outcome;
        discovered.append(&mut evac.collector.discovered);
    }
}

// ── Cycle ─────────────────────────────────────────────────────────────

/// Runs a minor cycle and flips the mark parity.
///
/// Without a fallback the nursery is empty afterwards. With one, the
/// nursery keeps the objects marked in place alongside the stale copies
/// of promoted objects, and only a major cycle may reclaim it.
pub(crate) fn collect(
    heap: &HeapInner,
    collectors: &mut [Collector],
    roots: &[RootSlot],
    remembered: &[usize],
    finalizers: &mut FinalizerQueue,
) -> MinorOutcome {
    let generational = heap.settings.generational;
    let pool = WorkPool::new(collectors.len());
    let traced = Mutex::new(MinorOutcome::default());

    run_parallel(collectors, |collector, n| {
        let id = collector.id;
        let mut evac = Evacuator::new(heap, collector, &pool);
        for (i, root) in roots.iter().enumerate() {
            if owns(i, id, n) {
                // SAFETY: mutators are parked for the whole cycle
                unsafe { evac.visit(root.as_ptr()) };
            }
        }
        for (i, &entry) in remembered.iter().enumerate() {
            if owns(i, id, n) {
                // SAFETY: entries come from this cycle's remembered set
                unsafe { evac.visit_remembered(entry) };
            }
        }
        evac.drain();
        *traced.lock() += evac.outcome;
    });
    let mut outcome = traced.into_inner();

    let mut discovered = Vec::new();
    for collector in collectors.iter_mut() {
        discovered.append(&mut collector.discovered);
    }
    let mut survivors = Survivors {
        heap,
        collector: &mut collectors[0],
        parity: heap.parity(),
        outcome: MinorOutcome::default(),
    };
    // SAFETY: discovered slots belong to promoted copies, objects marked
    // in place, or remembered holders outside the nursery
    outcome.references =
        unsafe { references::process(&mut survivors, discovered, finalizers, false) };
    outcome += survivors.outcome;
    for collector in collectors.iter_mut() {
        collector.finish_promotion(&heap.mature);
    }

    let promoted: Vec<usize> = collectors
        .iter()
        .flat_map(|c| c.promoted_blocks().iter().copied())
        .collect();
    log::trace!(
        "minor: {} roots, {} remembered slots, {} bytes promoted into {} blocks by {} workers",
        roots.len(),
        remembered.len(),
        outcome.promoted_bytes,
        promoted.len(),
        collectors.len()
    );

    let slots: Vec<usize> = remembered.iter().map(|&entry| untag(entry).0).collect();
    let chunk = heap.marked_chunk();
    let mut plan = FixupPlan {
        roots,
        slots: &slots,
        tasks: FixupTask::blocks(&heap.mature, promoted),
        young: None,
    };
    if outcome.fallback > 0 {
        let nursery = &heap.nursery;
        let range = nursery.start()..nursery.end();
        plan.tasks
            .extend(FixupTask::marked(&nursery.bitmap, range, chunk, false));
    }
    if !generational {
        let mature = &heap.mature;
        let los = &heap.los;
        plan.tasks.extend(FixupTask::marked(
            &mature.bitmap,
            mature.start()..mature.end(),
            chunk,
            false,
        ));
        plan.tasks
            .extend(FixupTask::marked(&los.bitmap, los.start()..los.end(), chunk, false));
    }
    // SAFETY: mutators are parked and every promoted copy is complete
    unsafe { fixup::run(collectors, &plan, &HeaderForwarding) };
    finalizers.for_each_entry(|slot| {
        // SAFETY: finalizable objects are registered at allocation and
        // either survived or were kept alive above
        unsafe { slot_fix(&HeaderForwarding, slot) };
    });

    if outcome.fallback == 0 {
        heap.nursery.reset();
    }
    heap.clear_bitmaps();
    heap.flip_parity();
    outcome
}
