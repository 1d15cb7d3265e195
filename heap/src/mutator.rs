//! Mutator-side allocation, write barrier, and safepoints.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use object::{ArrayHeader, ObjRef, TypeInfo, init_array, init_object};
use parking_lot::Mutex;

use crate::remset::tag_referent;
use crate::roots::enumerate as enumerate_roots;
use crate::{
    GcCause, GcRequest, Heap, HeapError, HeapResult, RootProvider, RootSubmission,
    Space, Tlab, VerifyReport, verify_heap,
};

/// Remembered slots are handed to the mutator record in chunks this big.
const REMSET_CHUNK: usize = 256;

// ── MutatorRecord ─────────────────────────────────────────────────────

/// The part of a mutator the collector can see.
///
/// Lives in the heap's mutator list from creation of the [`Mutator`] until
/// it is dropped.
#[derive(Debug)]
pub struct MutatorRecord {
    pub id: usize,
    /// Flushed write-barrier chunks, drained at the start of every cycle.
    remslot: Mutex<Vec<Vec<usize>>>,
    allocated: AtomicUsize,
    context_reset: AtomicBool,
}

impl MutatorRecord {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            remslot: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            context_reset: AtomicBool::new(false),
        }
    }

    fn push_remset(&self, chunk: Vec<usize>) {
        self.remslot.lock().push(chunk);
    }

    pub(crate) fn take_remset(&self) -> Vec<Vec<usize>> {
        mem::take(&mut *self.remslot.lock())
    }

    pub(crate) fn remset_is_empty(&self) -> bool {
        self.remslot.lock().is_empty()
    }

    /// Bytes allocated by this mutator so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn request_context_reset(&self) {
        self.context_reset.store(true, Ordering::Release);
    }

    fn take_context_reset(&self) -> bool {
        self.context_reset.swap(false, Ordering::Acquire)
    }
}

// ── Mutator ───────────────────────────────────────────────────────────

/// A thread's handle on the heap.
///
/// Owns the thread-local allocation contexts and the write-barrier buffer.
/// Every live mutator takes part in every collection: it must call
/// [`Mutator::safepoint`] (or allocate) regularly, and references it holds
/// across a safepoint must be exposed through the [`RootProvider`] passed
/// in, since objects may move.
#[derive(Debug)]
pub struct Mutator {
    heap: Heap,
    record: Arc<MutatorRecord>,
    nursery: Tlab,
    mature: Tlab,
    pending: Vec<usize>,
}

impl Mutator {
    pub(crate) fn new(heap: Heap) -> Self {
        heap.sync.state.register_thread();
        let record = heap.register_mutator();
        log::trace!("mutator {} registered", record.id);
        Self {
            heap,
            record,
            nursery: Tlab::default(),
            mature: Tlab::default(),
            pending: Vec::with_capacity(REMSET_CHUNK),
        }
    }

    pub fn id(&self) -> usize {
        self.record.id
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn allocated(&self) -> usize {
        self.record.allocated()
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a zeroed instance of `ty` in the nursery, or in the
    /// large-object space if it is at least the large-object threshold.
    pub fn allocate(
        &mut self,
        ty: &'static TypeInfo,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<ObjRef> {
        self.allocate_in(Space::Nursery, ty, roots)
    }

    pub fn allocate_array(
        &mut self,
        ty: &'static TypeInfo,
        len: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<ObjRef> {
        self.allocate_array_in(Space::Nursery, ty, len, roots)
    }

    /// Allocates an instance of `ty` directly in `space`. Large objects
    /// always go to the large-object space.
    pub fn allocate_in(
        &mut self,
        space: Space,
        ty: &'static TypeInfo,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<ObjRef> {
        if ty.is_array() {
            return Err(HeapError::InvalidType("array type passed to object allocation"));
        }
        let size = ty.instance_size();
        let addr = self.allocate_raw(space, size, roots)?;
        // SAFETY: addr is a fresh allocation of `size` bytes, 8-byte aligned
        let obj = unsafe { init_object(addr as *mut u8, ty, size) };
        if ty.has_finalizer() {
            self.heap.register_finalizer(obj);
        }
        Ok(obj)
    }

    pub fn allocate_array_in(
        &mut self,
        space: Space,
        ty: &'static TypeInfo,
        len: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<ObjRef> {
        if !ty.is_array() {
            return Err(HeapError::InvalidType("non-array type passed to array allocation"));
        }
        if len > u32::MAX as usize {
            return Err(HeapError::InvalidType("array length exceeds u32::MAX"));
        }
        let addr = self.allocate_raw(space, ty.array_size(len), roots)?;
        // SAFETY: addr is a fresh allocation of array_size(len) bytes
        let array = unsafe { init_array(addr as *mut u8, ty, len) };
        if ty.has_finalizer() {
            self.heap.register_finalizer(array);
        }
        Ok(array)
    }

    /// Fast path, then collect, then force a major cycle, then give up.
    fn allocate_raw(
        &mut self,
        space: Space,
        size: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<usize> {
        let space = if size >= self.heap.settings.large_object_threshold {
            Space::LargeObject
        } else {
            space
        };

        if let Some(addr) = self.try_allocate(space, size, roots) {
            return Ok(addr);
        }

        let cause = match space {
            Space::LargeObject => GcCause::LargeObjectSpaceFull,
            Space::Nursery | Space::Mature => GcCause::HeapExhausted,
        };
        self.collect(GcRequest::new(cause), roots);
        if let Some(addr) = self.try_allocate(space, size, roots) {
            return Ok(addr);
        }

        self.collect(GcRequest::major(cause), roots);
        if let Some(addr) = self.try_allocate(space, size, roots) {
            return Ok(addr);
        }

        log::warn!(
            "mutator {}: out of memory allocating {size} bytes in {space:?} space",
            self.record.id
        );
        Err(HeapError::OutOfMemory {
            space,
            requested: size,
        })
    }

    #[inline(always)]
    fn try_allocate(
        &mut self,
        space: Space,
        size: usize,
        roots: &mut dyn RootProvider,
    ) -> Option<usize> {
        let fast = match space {
            Space::Nursery => self.nursery.bump(size),
            Space::Mature => self.mature.bump(size),
            Space::LargeObject => None,
        };
        if let Some(addr) = fast {
            self.record.allocated.fetch_add(size, Ordering::Relaxed);
            return Some(addr);
        }
        self.try_allocate_slow(space, size, roots)
    }

    #[cold]
    #[inline(never)]
    fn try_allocate_slow(
        &mut self,
        space: Space,
        size: usize,
        roots: &mut dyn RootProvider,
    ) -> Option<usize> {
        self.safepoint(roots);

        let addr = match space {
            Space::Nursery => self.heap.nursery.allocate(&mut self.nursery, size),
            Space::Mature => self.heap.mature.allocate(&mut self.mature, size),
            Space::LargeObject => self.heap.los.allocate(size),
        }?;
        self.record.allocated.fetch_add(size, Ordering::Relaxed);
        Some(addr)
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Takes part in a collection if one has been requested.
    #[inline]
    pub fn safepoint(&mut self, roots: &mut dyn RootProvider) {
        if self.heap.sync.state.is_collecting() {
            self.join_collection(false, roots);
        }
    }

    pub fn trigger_collection(&mut self, cause: GcCause, roots: &mut dyn RootProvider) {
        self.collect(GcRequest::new(cause), roots);
    }

    /// Requests a collection and blocks until it has finished. If another
    /// mutator already requested one, joins that instead.
    #[cold]
    pub fn collect(&mut self, request: GcRequest, roots: &mut dyn RootProvider) {
        let (is_coordinator, active, cycle, participants) =
            self.heap.sync.state.try_start_gc(request);
        if is_coordinator {
            log::trace!(
                "mutator {} starts cycle {cycle} ({:?}) with {participants} participants",
                self.record.id,
                active.cause
            );
        }
        self.join_collection(is_coordinator, roots);
    }

    #[cold]
    fn join_collection(&mut self, is_coordinator: bool, roots: &mut dyn RootProvider) {
        self.retire_contexts();
        self.flush_remset();

        let submission = RootSubmission {
            mutator: self.record.id,
            slots: enumerate_roots(roots),
        };
        self.heap.rendezvous(is_coordinator, submission);

        if self.record.take_context_reset() {
            self.nursery = Tlab::default();
            self.mature = Tlab::default();
        }
    }

    fn retire_contexts(&mut self) {
        self.heap.nursery.retire(&mut self.nursery);
        self.heap.mature.retire(&mut self.mature);
    }

    /// Takes the finalizable objects found unreachable so far.
    ///
    /// The heap stops keeping them alive: the caller has to expose them
    /// through its roots for as long as it uses them.
    pub fn take_finalizable(&mut self) -> Vec<ObjRef> {
        self.heap.finalizers.lock().take_ready()
    }

    /// Verifies the heap reachable from `roots`.
    ///
    /// Only meaningful while no other mutator is allocating.
    pub fn verify(&mut self, roots: &mut dyn RootProvider) -> VerifyReport {
        self.retire_contexts();
        let slots = enumerate_roots(roots);
        verify_heap(&self.heap, &slots)
    }

    // ── Write barrier ─────────────────────────────────────────────────

    /// Stores `value` into the reference slot at `offset` of `holder`,
    /// which may also be the referent slot of a reference object.
    ///
    /// # Safety
    ///
    /// `holder` must be a live object with a reference slot at `offset`,
    /// and `value` null or a live object.
    #[inline(always)]
    pub unsafe fn write_ref(&mut self, holder: ObjRef, offset: usize, value: ObjRef) {
        let slot = holder.slot(offset);
        // SAFETY: caller guarantees a reference slot
        unsafe { *slot = value };
        // SAFETY: see above
        unsafe { self.barrier(holder, offset, value) };
    }

    /// # Safety
    ///
    /// `holder` must be a live object with a reference slot at `offset`.
    #[inline(always)]
    pub unsafe fn read_ref(&self, holder: ObjRef, offset: usize) -> ObjRef {
        // SAFETY: caller guarantees a reference slot
        unsafe { *holder.slot(offset) }
    }

    /// # Safety
    ///
    /// `array` must be a live reference array and `value` null or a live
    /// object. Panics if `index` is out of bounds.
    pub unsafe fn write_element(&mut self, array: ObjRef, index: usize, value: ObjRef) {
        // SAFETY: forwarded from caller
        unsafe {
            let offset = element_offset(array, index);
            self.write_ref(array, offset, value);
        }
    }

    /// # Safety
    ///
    /// `array` must be a live reference array. Panics if `index` is out of
    /// bounds.
    pub unsafe fn read_element(&self, array: ObjRef, index: usize) -> ObjRef {
        // SAFETY: forwarded from caller
        unsafe { self.read_ref(array, element_offset(array, index)) }
    }

    /// Remembers heap slots outside the nursery that now point into it.
    ///
    /// # Safety
    ///
    /// `holder` must be a live object.
    #[inline(always)]
    unsafe fn barrier(&mut self, holder: ObjRef, offset: usize, value: ObjRef) {
        if !self.heap.settings.generational || value.is_null() {
            return;
        }
        let nursery = &self.heap.nursery;
        if nursery.contains(value.addr()) && !nursery.contains(holder.addr()) {
            // SAFETY: forwarded from caller
            unsafe { self.remember(holder, offset) };
        }
    }

    /// # Safety
    ///
    /// `holder` must be a live object.
    #[cold]
    unsafe fn remember(&mut self, holder: ObjRef, offset: usize) {
        // SAFETY: forwarded from caller
        let ty = unsafe { holder.header() }.type_info();
        let slot = holder.slot(offset) as usize;
        let entry = match ty.referent_offset() {
            Some(referent) if referent == offset => tag_referent(slot, ty.reference_kind()),
            _ => slot,
        };
        self.pending.push(entry);
        if self.pending.len() >= REMSET_CHUNK {
            self.flush_remset();
        }
    }

    fn flush_remset(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let chunk = mem::replace(&mut self.pending, Vec::with_capacity(REMSET_CHUNK));
        self.record.push_remset(chunk);
    }
}

/// # Safety
///
/// `array` must be a live reference array.
unsafe fn element_offset(array: ObjRef, index: usize) -> usize {
    // SAFETY: forwarded from caller
    let ty = unsafe { array.header() }.type_info();
    debug_assert!(ty.is_ref_array(), "{} is not a reference array", ty.name());
    // SAFETY: see above
    let len = unsafe { ArrayHeader::length_of(array) };
    assert!(index < len, "index {index} out of bounds for array of length {len}");
    ty.first_elem_offset() + index * size_of::<ObjRef>()
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.retire_contexts();
        self.flush_remset();

        // Still counted as a participant while a cycle runs, so join it
        // with no roots before leaving.
        let id = self.record.id;
        while !self.heap.sync.state.try_deregister_thread() {
            self.heap.rendezvous(false, RootSubmission::empty(id));
        }
        self.heap.deregister_mutator(id);
        log::trace!("mutator {id} deregistered");
    }
}
