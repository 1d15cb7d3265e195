use object::ObjRef;

/// Consumers implement this to provide GC roots.
///
/// Called at safepoints to discover live roots from VM state (stacks,
/// registers, thread-local handles, globals). The visitor receives
/// `&mut ObjRef` so the collector can repoint roots whose object moved.
/// Enumeration must not allocate.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut ObjRef));
}

impl RootProvider for Vec<ObjRef> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for root in self.iter_mut() {
            visitor(root);
        }
    }
}

/// Address of a root slot owned by a stopped mutator.
///
/// Only valid while that mutator is blocked in the rendezvous, which is
/// for the whole cycle the slot was submitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RootSlot(*mut ObjRef);

// SAFETY: a RootSlot is only dereferenced by collector threads while the
// owning mutator is parked, so accesses never overlap.
unsafe impl Send for RootSlot {}
// SAFETY: see above
unsafe impl Sync for RootSlot {}

impl RootSlot {
    /// Root slot held by the heap itself rather than a mutator.
    pub(crate) fn new(slot: *mut ObjRef) -> Self {
        Self(slot)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut ObjRef {
        self.0
    }

    /// # Safety
    ///
    /// The owning mutator must still be parked.
    #[inline(always)]
    pub unsafe fn get(self) -> ObjRef {
        // SAFETY: caller guarantees the slot is alive
        unsafe { *self.0 }
    }
}

/// What one mutator hands to the coordinator when it stops.
#[derive(Debug, Default)]
pub struct RootSubmission {
    pub mutator: usize,
    pub slots: Vec<RootSlot>,
}

impl RootSubmission {
    /// Submission of a mutator that holds no roots, e.g. one that is
    /// shutting down.
    pub fn empty(mutator: usize) -> Self {
        Self {
            mutator,
            slots: Vec::new(),
        }
    }
}

/// Snapshots the slot addresses `roots` exposes.
pub fn enumerate(roots: &mut dyn RootProvider) -> Vec<RootSlot> {
    let mut slots = Vec::new();
    roots.visit_roots(&mut |slot| slots.push(RootSlot(slot as *mut ObjRef)));
    slots
}

/// The root set of the running cycle, assembled from every submission.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Vec<RootSlot>,
}

impl RootSet {
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Merges the submissions. A slot submitted twice appears once, so
    /// parallel fixup never writes one slot from two workers.
    pub fn assemble(&mut self, submissions: Vec<RootSubmission>) {
        for submission in submissions {
            self.slots.extend(submission.slots);
        }
        self.slots.sort_unstable();
        self.slots.dedup();
    }

    #[inline(always)]
    pub fn slots(&self) -> &[RootSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_yields_slot_addresses() {
        let mut roots = vec![ObjRef::from_addr(0x1000), ObjRef::NULL];
        let slots = enumerate(&mut roots);
        assert_eq!(slots.len(), 2);

        unsafe { *slots[1].as_ptr() = ObjRef::from_addr(0x2000) };
        assert_eq!(roots[1].addr(), 0x2000, "slots alias the provider's storage");
        assert_eq!(slots[0].as_ptr() as *const ObjRef, roots.as_ptr());
    }

    #[test]
    fn assemble_merges_and_dedups() {
        let mut a = vec![ObjRef::NULL; 3];
        let shared = enumerate(&mut a);

        let mut set = RootSet::default();
        set.assemble(vec![
            RootSubmission { mutator: 0, slots: shared.clone() },
            RootSubmission { mutator: 1, slots: shared[..1].to_vec() },
            RootSubmission::empty(2),
        ]);
        assert_eq!(set.len(), 3);

        set.clear();
        assert!(set.is_empty());
    }
}
