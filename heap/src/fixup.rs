//! Reference fixup: after objects have been relocated, rewrite every slot
//! that still holds an old address.
//!
//! Slots are found three ways: by walking a block from its base to its
//! frontier, by walking the start addresses flagged in a mark bitmap, and
//! from explicit slot lists (roots and remembered slots). All of it is
//! generic over where forwarding addresses are kept.

use std::ops::Range;

use object::{ObjRef, ReferenceKind, ref_slots, referent_slot};

use crate::collector::{Collector, owns, run_parallel};
use crate::remset::tag_referent;
use crate::{BlockSpace, Forwarding, MarkBitmap, RootSlot};

/// Rewrites `*slot` if it refers to a moved object and returns the value
/// the slot holds afterwards.
///
/// With header forwarding this is idempotent: a slot that already holds a
/// new address reads as not moved.
///
/// # Safety
///
/// `slot` must be a valid reference slot whose value, if non-null, is an
/// object address the forwarding scheme can answer for.
#[inline(always)]
pub unsafe fn slot_fix<F: Forwarding + ?Sized>(fwd: &F, slot: *mut ObjRef) -> ObjRef {
    // SAFETY: caller guarantees a valid slot
    let value = unsafe { *slot };
    if value.is_null() {
        return value;
    }
    // SAFETY: non-null value of a live slot
    match unsafe { fwd.resolve(value) } {
        Some(to) => {
            // SAFETY: see above
            unsafe { *slot = to };
            to
        }
        None => value,
    }
}

/// Applies [`slot_fix`] to every reference slot of `obj`.
///
/// # Safety
///
/// `obj` must be an initialized object at its final location.
pub unsafe fn object_fix_ref_slots<F: Forwarding + ?Sized>(fwd: &F, obj: ObjRef) {
    // SAFETY: forwarded from caller
    unsafe { SlotFixer::new(fwd).fix_object(obj) };
}

// ── SlotFixer ─────────────────────────────────────────────────────────

/// Fixes slots and, when asked to, records heap slots outside the nursery
/// that end up pointing into it.
pub struct SlotFixer<'a, F: ?Sized> {
    fwd: &'a F,
    young: Option<(Range<usize>, &'a mut Vec<usize>)>,
}

impl<'a, F: Forwarding + ?Sized> SlotFixer<'a, F> {
    pub fn new(fwd: &'a F) -> Self {
        Self { fwd, young: None }
    }

    /// Records old-to-young slots into `remset`.
    pub fn remembering(fwd: &'a F, nursery: Range<usize>, remset: &'a mut Vec<usize>) -> Self {
        Self {
            fwd,
            young: Some((nursery, remset)),
        }
    }

    /// # Safety
    ///
    /// `slot` must be a reference slot inside a live heap object.
    #[inline(always)]
    pub unsafe fn fix_slot(&mut self, slot: *mut ObjRef) {
        // SAFETY: forwarded from caller
        unsafe { self.fix_slot_of(slot, ReferenceKind::Strong) };
    }

    /// Fixes a slot whose remembered entry, if any, is tagged with `kind`.
    ///
    /// # Safety
    ///
    /// See [`SlotFixer::fix_slot`].
    #[inline(always)]
    unsafe fn fix_slot_of(&mut self, slot: *mut ObjRef, kind: ReferenceKind) {
        // SAFETY: forwarded from caller
        let value = unsafe { slot_fix(self.fwd, slot) };
        if let Some((nursery, remset)) = &mut self.young
            && !value.is_null()
            && nursery.contains(&value.addr())
            && !nursery.contains(&(slot as usize))
        {
            remset.push(tag_referent(slot as usize, kind));
        }
    }

    /// Fixes the reference slots of `obj` and its referent slot, if it is a
    /// reference object.
    ///
    /// # Safety
    ///
    /// `obj` must be an initialized object at its final location.
    #[inline]
    pub unsafe fn fix_object(&mut self, obj: ObjRef) {
        // SAFETY: forwarded from caller
        for slot in unsafe { ref_slots(obj) } {
            // SAFETY: slots of a live object
            unsafe { self.fix_slot(slot) };
        }
        // SAFETY: see above
        if let Some(slot) = unsafe { referent_slot(obj) } {
            // SAFETY: see above
            let kind = unsafe { obj.header() }.type_info().reference_kind();
            // SAFETY: the referent slot of a live object
            unsafe { self.fix_slot_of(slot, kind) };
        }
    }

    /// Roots live outside the heap and are never remembered.
    ///
    /// # Safety
    ///
    /// The mutator owning `root` must be parked.
    #[inline]
    pub unsafe fn fix_root(&mut self, root: RootSlot) {
        // SAFETY: forwarded from caller
        unsafe { slot_fix(self.fwd, root.as_ptr()) };
    }
}

// ── Traversals ────────────────────────────────────────────────────────

/// Fixes every object of block `block`, base to frontier.
///
/// # Safety
///
/// The block must hold a dense run of initialized objects.
pub unsafe fn fix_block<F: Forwarding + ?Sized>(
    space: &BlockSpace,
    block: usize,
    fixer: &mut SlotFixer<'_, F>,
) {
    // SAFETY: forwarded from caller
    unsafe { space.walk_block(block, |obj| fixer.fix_object(obj)) };
}

/// Fixes every object whose start is flagged in `bitmap` within `range`,
/// ascending. With `unmark`, GC bits are cleared from each header first.
///
/// # Safety
///
/// Every flagged address must be an initialized object.
pub unsafe fn fix_marked_objects<F: Forwarding + ?Sized>(
    bitmap: &MarkBitmap,
    range: Range<usize>,
    unmark: bool,
    fixer: &mut SlotFixer<'_, F>,
) {
    bitmap.for_each_in(range, |addr| {
        let obj = ObjRef::from_addr(addr);
        if unmark {
            // SAFETY: flagged addresses are object starts
            unsafe { obj.header() }.clear_gc_bits();
        }
        // SAFETY: see above
        unsafe { fixer.fix_object(obj) };
    });
}

// ── Parallel plan ─────────────────────────────────────────────────────

/// One unit of parallel fixup work.
#[derive(Debug)]
pub enum FixupTask<'a> {
    Block {
        space: &'a BlockSpace,
        block: usize,
    },
    Marked {
        bitmap: &'a MarkBitmap,
        range: Range<usize>,
        unmark: bool,
    },
}

impl<'a> FixupTask<'a> {
    pub fn blocks(space: &'a BlockSpace, blocks: impl IntoIterator<Item = usize>) -> Vec<Self> {
        blocks
            .into_iter()
            .map(|block| FixupTask::Block { space, block })
            .collect()
    }

    /// Splits `range` of `bitmap` into chunks of `chunk` bytes.
    pub fn marked(
        bitmap: &'a MarkBitmap,
        range: Range<usize>,
        chunk: usize,
        unmark: bool,
    ) -> Vec<Self> {
        debug_assert!(chunk > 0);
        (range.start..range.end)
            .step_by(chunk)
            .map(|start| FixupTask::Marked {
                bitmap,
                range: start..(start + chunk).min(range.end),
                unmark,
            })
            .collect()
    }

    /// # Safety
    ///
    /// See [`fix_block`] and [`fix_marked_objects`].
    unsafe fn run<F: Forwarding + ?Sized>(&self, fixer: &mut SlotFixer<'_, F>) {
        match self {
            // SAFETY: forwarded from caller
            FixupTask::Block { space, block } => unsafe { fix_block(space, *block, fixer) },
            FixupTask::Marked {
                bitmap,
                range,
                unmark,
            } => unsafe { fix_marked_objects(bitmap, range.clone(), *unmark, fixer) },
        }
    }
}

/// Everything one fixup pass must visit.
#[derive(Debug, Default)]
pub struct FixupPlan<'a> {
    pub roots: &'a [RootSlot],
    /// Remembered heap slots.
    pub slots: &'a [usize],
    pub tasks: Vec<FixupTask<'a>>,
    /// When set, old-to-young slots found while fixing are recorded into
    /// each worker's `this_cycle` remembered set.
    pub young: Option<Range<usize>>,
}

/// Runs `plan` on every collector in parallel. Tasks, roots, and slots are
/// dealt out by index, so no slot is written by two workers.
///
/// # Safety
///
/// All mutators must be parked, and every object reached through the plan
/// must be initialized at its final location.
pub unsafe fn run<F: Forwarding + ?Sized>(collectors: &mut [Collector], plan: &FixupPlan<'_>, fwd: &F) {
    log::trace!(
        "fixup: {} tasks, {} roots, {} remembered slots",
        plan.tasks.len(),
        plan.roots.len(),
        plan.slots.len()
    );

    run_parallel(collectors, |collector, n| {
        let id = collector.id;
        let mut fixer = match &plan.young {
            Some(nursery) => {
                SlotFixer::remembering(fwd, nursery.clone(), collector.remset.this_cycle_mut())
            }
            None => SlotFixer::new(fwd),
        };

        for (i, task) in plan.tasks.iter().enumerate() {
            if owns(i, id, n) {
                // SAFETY: forwarded from caller
                unsafe { task.run(&mut fixer) };
            }
        }
        for (i, &root) in plan.roots.iter().enumerate() {
            if owns(i, id, n) {
                // SAFETY: mutators are parked
                unsafe { fixer.fix_root(root) };
            }
        }
        for (i, &slot) in plan.slots.iter().enumerate() {
            if owns(i, id, n) {
                // SAFETY: remembered slots lie inside live heap objects
                unsafe { fixer.fix_slot(slot as *mut ObjRef) };
            }
        }
    });
}
