use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use object::{MarkParity, ObjRef};
use parking_lot::Mutex;

use crate::collector::Collector;
use crate::references::{FinalizerQueue, ReferenceOutcome};
use crate::remset::merge_buffers;
use crate::{
    BlockSpace, CollectionKind, CycleStats, GcRequest, GcState, HeapError, HeapResult,
    HeapSettings, HeapStats, LargeObjectSpace, MarkBitmap, Mutator, MutatorRecord, RootSet,
    PauseBarrier, Phase, RootSlot, RootSubmission, Space, SpaceStats, adapt_nursery_blocks,
    decide_collection_kind, major, minor, system, verify_heap,
};

// ── Sync state ────────────────────────────────────────────────────────

/// Synchronization state for the stop-the-world rendezvous.
#[derive(Debug)]
pub struct SyncState {
    /// Packed `(request, cycle, registered threads)` word.
    pub state: GcState,

    /// Passed by every participant at each phase of a pause.
    pub barrier: PauseBarrier,

    /// Root submissions of the parked mutators.
    pub inputs: Mutex<Vec<RootSubmission>>,
}

impl SyncState {
    fn new() -> Self {
        Self {
            state: GcState::new(),
            barrier: PauseBarrier::new(),
            inputs: Mutex::new(Vec::new()),
        }
    }
}

// ── Layout ────────────────────────────────────────────────────────────

/// Sizes of the three spaces carved from one reservation, in address
/// order `[nursery | mature | large objects]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Address range the nursery may grow into.
    pub nursery: usize,
    /// Nursery size the heap starts with.
    pub initial_nursery: usize,
    pub mature: usize,
    pub large_object: usize,
}

impl Partition {
    /// Nursery starts at a sixteenth of the reservation and may grow to an
    /// eighth, both within the configured bounds. The large-object space
    /// gets a quarter, mature space the rest.
    pub fn new(settings: &HeapSettings, reserved: usize) -> HeapResult<Self> {
        let block = settings.block_size;
        let round_down = |size: usize| size / block * block;
        let bounded =
            |size: usize| round_down(size.clamp(settings.min_nursery_size, settings.max_nursery_size));

        let nursery = bounded(reserved / 8);
        let initial_nursery = bounded(reserved / 16);
        let large_object = round_down(reserved / 4);
        let mature = reserved
            .checked_sub(nursery + large_object)
            .map(round_down)
            .unwrap_or(0);

        if nursery == 0 || large_object == 0 || mature < block {
            return Err(HeapError::InvalidSettings("heap too small to partition"));
        }
        Ok(Self {
            nursery,
            initial_nursery,
            mature,
            large_object,
        })
    }
}

// ── HeapInner ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct HeapInner {
    pub settings: HeapSettings,
    base: NonNull<u8>,
    reserved: usize,

    pub nursery: BlockSpace,
    pub mature: BlockSpace,
    pub los: LargeObjectSpace,

    pub sync: SyncState,
    mutators: Mutex<Vec<Arc<MutatorRecord>>>,
    next_mutator_id: AtomicUsize,
    collectors: Mutex<Vec<Collector>>,
    /// Remembered-slot buffers consumed by the next minor cycle.
    nursery_remset: Mutex<Vec<Vec<usize>>>,
    root_set: Mutex<RootSet>,
    pub(crate) finalizers: Mutex<FinalizerQueue>,
    /// Cycles that flipped the mark parity so far.
    flips: AtomicUsize,
    stats: Mutex<HeapStats>,
}

// SAFETY: `base` is only used to unmap the reservation on drop; all shared
// state is behind atomics or locks.
unsafe impl Send for HeapInner {}
// SAFETY: see above
unsafe impl Sync for HeapInner {}

impl HeapInner {
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        settings.validate()?;
        let settings = settings.rounded();

        let (base, reserved) = system::reserve_degrading(
            settings.max_heap_size,
            settings.min_heap_size,
            settings.reserve_step,
            system::reserve_memory,
        )?;

        let partition = match Partition::new(&settings, reserved) {
            Ok(p) => p,
            Err(e) => {
                system::unmap_memory(base, reserved);
                return Err(e);
            }
        };

        let start = base.as_ptr() as usize;
        let mature_start = start + partition.nursery;
        let los_start = mature_start + partition.mature;

        let block = settings.block_size;
        let collectors = (0..settings.num_collectors).map(Collector::new).collect();
        let nursery = BlockSpace::new(Space::Nursery, start, partition.nursery, block);
        nursery.set_limit(partition.initial_nursery / block);

        log::info!(
            "heap reserved {reserved} bytes at 0x{start:x}: nursery {} KB (up to {} KB), mature {} KB, large objects {} KB, {} collectors",
            partition.initial_nursery / 1024,
            partition.nursery / 1024,
            partition.mature / 1024,
            partition.large_object / 1024,
            settings.num_collectors
        );

        Ok(Self {
            nursery,
            mature: BlockSpace::new(Space::Mature, mature_start, partition.mature, block),
            los: LargeObjectSpace::new(los_start, partition.large_object, block),
            settings,
            base,
            reserved,
            sync: SyncState::new(),
            mutators: Mutex::new(Vec::new()),
            next_mutator_id: AtomicUsize::new(0),
            collectors: Mutex::new(collectors),
            nursery_remset: Mutex::new(Vec::new()),
            root_set: Mutex::new(RootSet::default()),
            finalizers: Mutex::new(FinalizerQueue::default()),
            flips: AtomicUsize::new(0),
            stats: Mutex::new(HeapStats::default()),
        })
    }

    // ── Layout queries ────────────────────────────────────────────────

    #[inline(always)]
    pub fn space_of(&self, addr: usize) -> Option<Space> {
        if self.nursery.contains(addr) {
            Some(Space::Nursery)
        } else if self.mature.contains(addr) {
            Some(Space::Mature)
        } else if self.los.contains(addr) {
            Some(Space::LargeObject)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn bitmap(&self, space: Space) -> &MarkBitmap {
        match space {
            Space::Nursery => &self.nursery.bitmap,
            Space::Mature => &self.mature.bitmap,
            Space::LargeObject => &self.los.bitmap,
        }
    }

    pub(crate) fn clear_bitmaps(&self) {
        self.nursery.bitmap.clear_all();
        self.mature.bitmap.clear_all();
        self.los.bitmap.clear_all();
    }

    /// Bytes of address range per parallel bitmap-walk task.
    pub(crate) fn marked_chunk(&self) -> usize {
        self.settings.block_size * 8
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn parity(&self) -> MarkParity {
        MarkParity::for_cycle(self.flips.load(Ordering::Relaxed))
    }

    pub(crate) fn flip_parity(&self) {
        self.flips.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes still available for allocation across all spaces.
    pub fn free_memory_size(&self) -> usize {
        self.nursery.free_bytes() + self.mature.free_bytes() + self.los.free_bytes()
    }

    /// Bytes committed by all spaces together.
    pub fn total_memory_size(&self) -> usize {
        self.nursery.committed_bytes() + self.mature.committed_bytes() + self.los.committed_bytes()
    }

    /// Current nursery size; it adapts between the configured bounds.
    pub fn nursery_size(&self) -> usize {
        self.nursery.limit() * self.nursery.block_size()
    }

    // ── Statistics ────────────────────────────────────────────────────

    pub fn stats(&self) -> HeapStats {
        self.stats.lock().clone()
    }

    pub fn last_cycle(&self) -> Option<CycleStats> {
        self.stats.lock().last
    }

    pub fn collections(&self) -> usize {
        self.stats.lock().collections
    }

    pub fn space_stats(&self, space: Space) -> SpaceStats {
        *self.stats.lock().space(space)
    }

    /// Remembered slots waiting for the next minor cycle.
    pub fn pending_remembered(&self) -> usize {
        self.nursery_remset.lock().iter().map(Vec::len).sum()
    }

    // ── Finalization ──────────────────────────────────────────────────

    pub(crate) fn register_finalizer(&self, obj: ObjRef) {
        self.finalizers.lock().register(obj);
    }

    /// Finalizable objects not yet found unreachable.
    pub fn finalizers_registered(&self) -> usize {
        self.finalizers.lock().registered()
    }

    /// Unreachable finalizable objects waiting to be taken.
    pub fn finalizers_ready(&self) -> usize {
        self.finalizers.lock().ready()
    }

    // ── Mutators ──────────────────────────────────────────────────────

    pub(crate) fn register_mutator(&self) -> Arc<MutatorRecord> {
        let id = self.next_mutator_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(MutatorRecord::new(id));
        self.mutators.lock().push(record.clone());
        record
    }

    /// Removes the record, handing its unconsumed remembered slots to the
    /// nursery queue.
    pub(crate) fn deregister_mutator(&self, id: usize) {
        let mut mutators = self.mutators.lock();
        let Some(pos) = mutators.iter().position(|r| r.id == id) else {
            return;
        };
        let record = mutators.swap_remove(pos);
        let chunks = record.take_remset();
        if !chunks.is_empty() {
            self.nursery_remset.lock().extend(chunks);
        }
    }

    pub fn num_mutators(&self) -> usize {
        self.mutators.lock().len()
    }

    // ── Rendezvous ────────────────────────────────────────────────────

    /// Stop-the-world handshake.
    ///
    /// Every participant submits its roots and waits; the coordinator then
    /// reclaims the heap while the others sleep, ends the cycle, and all
    /// leave together.
    pub fn rendezvous(&self, is_coordinator: bool, submission: RootSubmission) {
        let (request, cycle, participants, _word) = self.sync.state.load(Ordering::Acquire);
        let Some(request) = request else {
            return;
        };
        let participants = participants as usize;

        self.sync.inputs.lock().push(submission);
        self.sync.barrier.wait(Phase::RootsSubmitted, participants);

        if is_coordinator {
            let submissions = mem::take(&mut *self.sync.inputs.lock());
            self.reclaim_heap(request, submissions, participants, cycle);
        }
        self.sync.barrier.wait(Phase::Collected, participants);

        if is_coordinator {
            self.sync.state.finish_gc();
        }
        self.sync.barrier.wait(Phase::Released, participants);
    }

    /// Runs one collection pause. Only the coordinator calls this, with
    /// every other participant parked.
    fn reclaim_heap(
        &self,
        request: GcRequest,
        submissions: Vec<RootSubmission>,
        participants: usize,
        cycle: u32,
    ) {
        let start = Instant::now();
        if submissions.len() != participants {
            log::error!(
                "cycle {cycle}: {} root submissions for {participants} participants",
                submissions.len()
            );
            panic!("inconsistent root enumeration in cycle {cycle}");
        }

        let mut root_set = self.root_set.lock();
        root_set.clear();
        root_set.assemble(submissions);
        let mut collectors = self.collectors.lock();
        let mut finalizers = self.finalizers.lock();
        let queued_before = finalizers.ready();

        self.preprocess_mutators();
        for collector in collectors.iter() {
            collector.remset.assert_this_cycle_empty(collector.id);
        }

        let nursery_used = self.nursery.used_bytes();
        log::trace!(
            "cycle {cycle}: {} roots, {} remembered slots, nursery {nursery_used} bytes",
            root_set.len(),
            self.pending_remembered()
        );

        let before = self.settings.verify_heap.then(|| {
            verify_heap(self, &cycle_roots(&root_set, &mut finalizers, queued_before))
        });

        let mut kind = if request.force_major {
            CollectionKind::Major
        } else {
            decide_collection_kind(self.mature.free_bytes(), nursery_used, request.cause)
        };

        let mut promoted_bytes = 0;
        let mut fallback = 0;
        let mut freed_los_bytes = 0;
        let mut references = ReferenceOutcome::default();
        // (survived, occupied) of the first phase that collected the nursery
        let mut nursery_survival = None;

        if kind == CollectionKind::Minor {
            let remembered = merge_buffers(mem::take(&mut *self.nursery_remset.lock()));
            let queued = finalizers.ready();
            let roots = cycle_roots(&root_set, &mut finalizers, queued);
            let outcome =
                minor::collect(self, &mut collectors, &roots, &remembered, &mut finalizers);
            finalizers.publish();
            nursery_survival = Some((outcome.promoted_bytes + outcome.fallback_bytes, nursery_used));
            promoted_bytes = outcome.promoted_bytes;
            fallback = outcome.fallback;
            references += outcome.references;
            if fallback > 0 {
                log::warn!(
                    "cycle {cycle}: {fallback} objects could not be promoted, escalating to a major collection"
                );
                kind = CollectionKind::Major;
            }
        }

        if kind == CollectionKind::Major {
            // a full trace finds every old-to-young slot again
            self.nursery_remset.lock().clear();
            let nursery_before = self.nursery.used_bytes();
            let mature_before = self.mature.used_bytes();
            let los_before = self.los.used_bytes();

            let queued = finalizers.ready();
            let roots = cycle_roots(&root_set, &mut finalizers, queued);
            let outcome = major::collect(self, &mut collectors, &roots, &mut finalizers);
            finalizers.publish();

            if nursery_survival.is_none() {
                nursery_survival = Some((outcome.nursery_live_bytes, nursery_before));
            }
            let mut stats = self.stats.lock();
            stats
                .space_mut(Space::Mature)
                .record(outcome.mature_live_bytes, mature_before);
            stats
                .space_mut(Space::LargeObject)
                .record(outcome.large_objects.live_bytes, los_before);
            promoted_bytes += outcome.promoted_bytes;
            freed_los_bytes = outcome.large_objects.freed_bytes;
            references += outcome.references;
        }

        if let Some((survived, occupied)) = nursery_survival {
            self.stats
                .lock()
                .space_mut(Space::Nursery)
                .record(survived, occupied);
        }

        self.postprocess_collectors(&mut collectors);
        self.postprocess_mutators();
        if let Some((survived, occupied)) = nursery_survival {
            self.adapt_nursery(survived, occupied);
        }

        let after = self.settings.verify_heap.then(|| {
            verify_heap(self, &cycle_roots(&root_set, &mut finalizers, queued_before))
        });
        if let (Some(before), Some(after)) = (&before, &after) {
            let consistent = before.is_ok()
                && after.is_ok()
                && before.live_objects == after.live_objects
                && before.live_bytes == after.live_bytes;
            if !consistent {
                log::error!(
                    "cycle {cycle}: verification mismatch: {} live objects ({} bytes) before, {} ({} bytes) after, {} errors",
                    before.live_objects,
                    before.live_bytes,
                    after.live_objects,
                    after.live_bytes,
                    before.errors.len() + after.errors.len()
                );
                self.stats.lock().verification_failures += 1;
            }
        }

        let cycle_stats = CycleStats {
            cycle,
            kind,
            cause: request.cause,
            pause: start.elapsed(),
            nursery_used_before: nursery_used,
            promoted_bytes,
            freed_los_bytes,
            live_bytes_after: self.nursery.used_bytes()
                + self.mature.used_bytes()
                + self.los.used_bytes(),
            fallback,
            cleared_references: references.cleared,
            finalizers_queued: references.finalizers_queued,
        };
        log::debug!(
            "GC cycle {cycle}: {kind:?} ({:?}) in {:?}, promoted {promoted_bytes} bytes, freed {freed_los_bytes} large-object bytes, {} bytes in use",
            request.cause,
            cycle_stats.pause,
            cycle_stats.live_bytes_after
        );
        self.stats.lock().record(cycle_stats);
    }

    /// Resizes the nursery after a pause that collected it, going by the
    /// share of occupied bytes that survived.
    fn adapt_nursery(&self, survived: usize, occupied: usize) {
        if !self.settings.adaptive_nursery || occupied == 0 {
            return;
        }
        let blocks = self.nursery.num_blocks();
        let min = (self.settings.min_nursery_size / self.settings.block_size).clamp(1, blocks);
        let current = self.nursery.limit();
        let next = adapt_nursery_blocks(current, min, blocks, survived as f64 / occupied as f64);
        if next != current {
            log::debug!(
                "nursery {} -> {} KB after {survived} of {occupied} bytes survived",
                current * self.nursery.block_size() / 1024,
                next * self.nursery.block_size() / 1024
            );
            self.nursery.set_limit(next);
        }
    }

    /// Moves every mutator's flushed remembered slots to the nursery queue.
    fn preprocess_mutators(&self) {
        let mutators = self.mutators.lock();
        let mut queue = self.nursery_remset.lock();
        for record in mutators.iter() {
            queue.extend(record.take_remset());
        }
    }

    /// Hands each collector's buffer of this cycle to the nursery queue.
    fn postprocess_collectors(&self, collectors: &mut [Collector]) {
        let mut queue = self.nursery_remset.lock();
        for collector in collectors.iter_mut() {
            collector.remset.rotate(collector.id);
            let buffer = collector.remset.take_last_cycle();
            if !buffer.is_empty() {
                queue.push(buffer);
            }
            collector.reset_cycle();
        }
    }

    fn postprocess_mutators(&self) {
        for record in self.mutators.lock().iter() {
            if !record.remset_is_empty() {
                log::error!("mutator {} recorded slots during a collection", record.id);
                panic!("mutator {} remembered set not empty after collection", record.id);
            }
            record.request_context_reset();
        }
    }
}

/// Mutator roots plus the first `queued` objects awaiting finalization.
fn cycle_roots(root_set: &RootSet, finalizers: &mut FinalizerQueue, queued: usize) -> Vec<RootSlot> {
    root_set
        .slots()
        .iter()
        .copied()
        .chain(finalizers.ready_roots(queued))
        .collect()
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        let stats = self.stats.lock();
        log::info!(
            "heap shutting down after {} collections ({} minor, {} major)",
            stats.collections,
            stats.minor,
            stats.major
        );
        system::unmap_memory(self.base, self.reserved);
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        Ok(Self(Arc::new(HeapInner::new(settings)?)))
    }

    /// Registers the calling thread as a mutator. Waits out a running
    /// collection.
    #[must_use]
    pub fn mutator(&self) -> Mutator {
        Mutator::new(self.clone())
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
