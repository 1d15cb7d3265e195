use object::Header;

use crate::{HeapError, HeapResult, OS_PAGE_SIZE};

/// Configuration of the generational heap.
///
/// All sizes are tuning bounds. They are rounded up to `block_size` at
/// startup; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Smallest reservation the heap accepts before giving up.
    pub min_heap_size: usize,
    /// Reservation requested from the OS at startup.
    pub max_heap_size: usize,
    /// Bounds of the nursery. It starts at a sixteenth of the reservation
    /// and, when adaptive, resizes within `[min, max]` and at most an
    /// eighth of the reservation.
    pub min_nursery_size: usize,
    pub max_nursery_size: usize,
    /// Resize the nursery after each cycle by how much of it survived.
    pub adaptive_nursery: bool,
    /// Allocation and commit granularity of nursery and mature space.
    /// Must be a multiple of the OS page size.
    pub block_size: usize,
    /// Objects of at least this many bytes go to the large-object space.
    /// Must not exceed `block_size`.
    pub large_object_threshold: usize,
    /// Worker threads used by parallel collection phases.
    pub num_collectors: usize,
    /// Enables the write barrier and remembered sets. Without it a minor
    /// cycle traces through the whole heap.
    pub generational: bool,
    /// Verify the reachable heap before and after every cycle.
    pub verify_heap: bool,
    /// Amount the reservation shrinks by after each OS rejection.
    pub reserve_step: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            min_heap_size: 16 * 1024 * 1024,  // 16 MB
            max_heap_size: 256 * 1024 * 1024, // 256 MB
            min_nursery_size: 1024 * 1024,    // 1 MB
            max_nursery_size: 32 * 1024 * 1024,
            adaptive_nursery: true,
            block_size: 32_768,            // 32 KB = 2^15
            large_object_threshold: 8_192, // 8 KB
            num_collectors: std::thread::available_parallelism()
                .map_or(1, |n| n.get().min(4)),
            generational: true,
            verify_heap: false,
            reserve_step: 4 * 1024 * 1024,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> HeapResult<()> {
        let invalid = |msg| Err(HeapError::InvalidSettings(msg));

        if self.min_heap_size == 0
            || self.block_size == 0
            || self.min_nursery_size == 0
            || self.reserve_step == 0
        {
            return invalid("sizes must be > 0");
        }
        if !self.block_size.is_multiple_of(OS_PAGE_SIZE) {
            return invalid("block_size must match OS page alignment");
        }
        if self.min_heap_size > self.max_heap_size {
            return invalid("min_heap_size must not exceed max_heap_size");
        }
        if self.min_nursery_size > self.max_nursery_size {
            return invalid("min_nursery_size must not exceed max_nursery_size");
        }
        if self.large_object_threshold > self.block_size {
            return invalid("large_object_threshold must not exceed block_size");
        }
        if self.large_object_threshold <= Header::SIZE {
            return invalid("large_object_threshold must exceed the header size");
        }
        if self.num_collectors == 0 {
            return invalid("num_collectors must be > 0");
        }
        // nursery + mature + large-object space need a block each at least
        if self.min_heap_size < 4 * self.block_size {
            return invalid("min_heap_size must hold at least four blocks");
        }
        Ok(())
    }

    /// Copy of these settings with every size rounded up to block
    /// granularity.
    pub fn rounded(&self) -> Self {
        let round = |size: usize| size.next_multiple_of(self.block_size);
        Self {
            min_heap_size: round(self.min_heap_size),
            max_heap_size: round(self.max_heap_size),
            min_nursery_size: round(self.min_nursery_size),
            max_nursery_size: round(self.max_nursery_size),
            reserve_step: round(self.reserve_step),
            ..self.clone()
        }
    }
}
