//! Heap verification: trace the reachable graph and check every object
//! against the invariants that hold between cycles.
//!
//! Mismatches are reported, never corrected.

use object::{CONST_MARK_BIT, Header, OBJECT_ALIGNMENT, ObjRef, object_size, ref_slots};
use rustc_hash::FxHashSet;

use crate::{BlockSpace, HeapInner, RootSlot, Space};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub live_objects: usize,
    pub live_bytes: usize,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: String) {
        log::error!("heap verification: {msg}");
        self.errors.push(msg);
    }
}

/// End of the allocated run containing `addr`, if `addr` lies in one.
fn block_limit(space: &BlockSpace, addr: usize) -> Option<usize> {
    if !space.is_allocated(addr, Header::SIZE) {
        return None;
    }
    let frontier = space.frontier(space.block_of(addr));
    (addr + Header::SIZE <= frontier).then_some(frontier)
}

/// Checks one object. Returns its size if it is sound enough to trace.
///
/// Nothing is read from the object until its address is known to be
/// inside allocated memory.
fn check_object(heap: &HeapInner, obj: ObjRef, report: &mut VerifyReport) -> Option<usize> {
    let addr = obj.addr();
    if !addr.is_multiple_of(OBJECT_ALIGNMENT) {
        report.error(format!("{obj:?} is misaligned"));
        return None;
    }
    let Some(space) = heap.space_of(addr) else {
        report.error(format!("{obj:?} is outside the heap"));
        return None;
    };
    let limit = match space {
        Space::Nursery => block_limit(&heap.nursery, addr),
        Space::Mature => block_limit(&heap.mature, addr),
        Space::LargeObject => heap.los.is_allocated(addr, 0).then_some(usize::MAX),
    };
    let Some(limit) = limit else {
        report.error(format!("{obj:?} is not in an allocated region of {space:?} space"));
        return None;
    };

    // SAFETY: the header lies inside allocated, committed memory
    let header = unsafe { obj.header() };
    if header.vt_raw() & !CONST_MARK_BIT == 0 {
        report.error(format!("{obj:?} has no type information"));
        return None;
    }
    if header.is_moved() {
        report.error(format!("{obj:?} is forwarded outside a collection"));
        return None;
    }
    if header.is_marked_in_vt() {
        report.error(format!("{obj:?} carries a mark bit outside a collection"));
    }

    // SAFETY: the header is intact
    let size = unsafe { object_size(obj) };
    let fits = match space {
        Space::LargeObject => heap.los.is_allocated(addr, size),
        _ => addr + size <= limit,
    };
    if !fits {
        report.error(format!("{obj:?} of {size} bytes overruns its {space:?} region"));
        return None;
    }
    Some(size)
}

/// Verifies everything reachable from `roots`.
pub fn verify_heap(heap: &HeapInner, roots: &[RootSlot]) -> VerifyReport {
    let mut report = VerifyReport::default();
    let mut visited = FxHashSet::default();
    let mut stack: Vec<ObjRef> = Vec::new();

    for root in roots {
        // SAFETY: roots are only verified while their mutators are parked
        let obj = unsafe { root.get() };
        if !obj.is_null() {
            stack.push(obj);
        }
    }

    while let Some(obj) = stack.pop() {
        if !visited.insert(obj) {
            continue;
        }
        let Some(size) = check_object(heap, obj, &mut report) else {
            continue;
        };
        report.live_objects += 1;
        report.live_bytes += size;

        // SAFETY: the object passed the checks above
        for slot in unsafe { ref_slots(obj) } {
            // SAFETY: slots of a checked object
            let child = unsafe { *slot };
            if !child.is_null() && !visited.contains(&child) {
                stack.push(child);
            }
        }
    }

    log::trace!(
        "heap verification: {} live objects, {} bytes, {} errors",
        report.live_objects,
        report.live_bytes,
        report.errors.len()
    );
    report
}
