//! Large-object space: a non-moving space managed by a free-area pool and
//! reclaimed by sweeping.
//!
//! Memory is committed in fixed chunks the first time an allocation
//! touches them and stays committed afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::{MarkBitmap, system};

const NUM_BUCKETS: usize = usize::BITS as usize;

/// Size class of a free area: floor(log2(size)).
#[inline(always)]
fn bucket_of(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

// ── Free-area pool ────────────────────────────────────────────────────

/// Free areas bucketed by power-of-two size class and indexed by address
/// for coalescing.
///
/// Allocation is best fit: the smallest sufficient area of the request's
/// class, else the smallest area of the next non-empty class.
#[derive(Debug)]
pub struct FreeAreaPool {
    by_addr: BTreeMap<usize, usize>,
    /// (size, addr) per class, so each set iterates smallest first.
    buckets: Box<[BTreeSet<(usize, usize)>]>,
    free_bytes: usize,
}

impl Default for FreeAreaPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeAreaPool {
    pub fn new() -> Self {
        Self {
            by_addr: BTreeMap::new(),
            buckets: (0..NUM_BUCKETS).map(|_| BTreeSet::new()).collect(),
            free_bytes: 0,
        }
    }

    fn insert(&mut self, addr: usize, size: usize) {
        self.by_addr.insert(addr, size);
        self.buckets[bucket_of(size)].insert((size, addr));
        self.free_bytes += size;
    }

    fn remove(&mut self, addr: usize, size: usize) {
        self.by_addr.remove(&addr);
        self.buckets[bucket_of(size)].remove(&(size, addr));
        self.free_bytes -= size;
    }

    /// Returns `[addr, addr + size)` to the pool, merging it with adjacent
    /// free areas.
    pub fn free(&mut self, addr: usize, size: usize) {
        let mut start = addr;
        let mut len = size;

        if let Some((&prev, &prev_size)) = self.by_addr.range(..addr).next_back() {
            assert!(prev + prev_size <= addr, "free area 0x{addr:x} already free");
            if prev + prev_size == addr {
                self.remove(prev, prev_size);
                start = prev;
                len += prev_size;
            }
        }
        if let Some(&next_size) = self.by_addr.get(&(addr + size)) {
            self.remove(addr + size, next_size);
            len += next_size;
        }

        self.insert(start, len);
    }

    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        let found = self.buckets[bucket_of(size)..]
            .iter()
            .find_map(|bucket| bucket.range((size, 0)..).next().copied());
        let (area_size, addr) = found?;

        self.remove(addr, area_size);
        if area_size > size {
            self.insert(addr + size, area_size - size);
        }
        Some(addr)
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Number of distinct free areas.
    pub fn areas(&self) -> usize {
        self.by_addr.len()
    }

    pub fn largest(&self) -> usize {
        self.buckets
            .iter()
            .rev()
            .find_map(|b| b.last().map(|&(size, _)| size))
            .unwrap_or(0)
    }
}

// ── LargeObjectSpace ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LosInner {
    pool: FreeAreaPool,
    /// Start address -> size of every allocated object.
    allocated: BTreeMap<usize, usize>,
    allocated_bytes: usize,
    /// Per chunk.
    committed: Vec<bool>,
    committed_bytes: usize,
}

#[derive(Debug)]
pub struct LargeObjectSpace {
    start: usize,
    len: usize,
    chunk: usize,
    inner: Mutex<LosInner>,
    pub bitmap: MarkBitmap,
}

/// Outcome of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub live_bytes: usize,
}

impl LargeObjectSpace {
    /// Manages the reserved range `[start, start + len)`, committing it
    /// `chunk` bytes at a time. `start` and `chunk` must be page aligned.
    pub fn new(start: usize, len: usize, chunk: usize) -> Self {
        debug_assert!(chunk > 0);
        let mut inner = LosInner {
            committed: vec![false; len.div_ceil(chunk)],
            ..LosInner::default()
        };
        if len > 0 {
            inner.pool.free(start, len);
        }
        Self {
            start,
            len,
            chunk,
            inner: Mutex::new(inner),
            bitmap: MarkBitmap::new(start, len),
        }
    }

    /// Commits every chunk `[addr, addr + size)` touches.
    fn commit_range(&self, inner: &mut LosInner, addr: usize, size: usize) -> bool {
        let first = (addr - self.start) / self.chunk;
        let last = (addr + size - 1 - self.start) / self.chunk;
        for idx in first..=last {
            if inner.committed[idx] {
                continue;
            }
            let base = self.start + idx * self.chunk;
            let len = self.chunk.min(self.end() - base);
            // SAFETY: chunk bases are inside the heap reservation
            let ptr = unsafe { NonNull::new_unchecked(base as *mut u8) };
            if !system::commit_memory(ptr, len) {
                log::error!("large-object space: failed to commit chunk {idx}");
                return false;
            }
            inner.committed[idx] = true;
            inner.committed_bytes += len;
            log::trace!("large-object space: committed chunk {idx}");
        }
        true
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.start) < self.len
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn allocate(&self, size: usize) -> Option<usize> {
        let mut inner = self.inner.lock();
        let addr = inner.pool.allocate(size)?;
        if !self.commit_range(&mut inner, addr, size) {
            inner.pool.free(addr, size);
            return None;
        }
        inner.allocated.insert(addr, size);
        inner.allocated_bytes += size;
        Some(addr)
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().allocated_bytes
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.lock().pool.free_bytes()
    }

    pub fn committed_bytes(&self) -> usize {
        self.inner.lock().committed_bytes
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().allocated.len()
    }

    /// Number of distinct free areas.
    pub fn free_areas(&self) -> usize {
        self.inner.lock().pool.areas()
    }

    /// Whether an object of `size` bytes was allocated at `addr`.
    pub fn is_allocated(&self, addr: usize, size: usize) -> bool {
        self.inner
            .lock()
            .allocated
            .get(&addr)
            .is_some_and(|&allocated| size <= allocated)
    }

    /// Frees every allocated object whose start is not flagged in the mark
    /// bitmap.
    pub fn sweep(&self) -> SweepResult {
        let mut inner = self.inner.lock();
        let dead: Vec<(usize, usize)> = inner
            .allocated
            .iter()
            .filter(|&(&addr, _)| !self.bitmap.is_set(addr))
            .map(|(&addr, &size)| (addr, size))
            .collect();

        let mut result = SweepResult::default();
        for (addr, size) in dead {
            inner.allocated.remove(&addr);
            inner.pool.free(addr, size);
            result.freed_objects += 1;
            result.freed_bytes += size;
        }
        inner.allocated_bytes -= result.freed_bytes;
        result.live_bytes = inner.allocated_bytes;

        log::trace!(
            "large-object sweep: freed {} objects ({} bytes), {} free areas",
            result.freed_objects,
            result.freed_bytes,
            inner.pool.areas()
        );
        result
    }
}
