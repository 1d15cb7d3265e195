//! Block-structured spaces (nursery and mature).
//!
//! A space is a contiguous range split into fixed-size blocks. Blocks are
//! handed out in address order from an atomic cursor, each one whole to a
//! single allocation context, and committed on first use. Every block
//! records its allocation frontier, so `[base, frontier)` is a dense run
//! of objects that can be walked by size.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use object::{ObjRef, object_size};

use crate::{MarkBitmap, Space, system};

// ── Allocation context ────────────────────────────────────────────────

/// A thread-local bump allocation window over one block.
#[derive(Debug, Default)]
pub struct Tlab {
    block: Option<usize>,
    bump: usize,
    limit: usize,
}

impl Tlab {
    #[inline(always)]
    pub fn bump(&mut self, size: usize) -> Option<usize> {
        let new = self.bump.checked_add(size)?;
        if new > self.limit {
            return None;
        }
        let addr = self.bump;
        self.bump = new;
        Some(addr)
    }

    /// Gives back the most recent `size`-byte allocation at `addr`.
    #[inline(always)]
    pub fn unbump(&mut self, addr: usize, size: usize) {
        debug_assert_eq!(addr + size, self.bump, "not the latest allocation");
        self.bump = addr;
    }

    #[inline(always)]
    pub fn block(&self) -> Option<usize> {
        self.block
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.bump
    }
}

// ── BlockSpace ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BlockSpace {
    space: Space,
    start: usize,
    block_size: usize,
    num_blocks: usize,
    /// Next never-handed-out block.
    cursor: AtomicUsize,
    /// Blocks that may be handed out; at most `num_blocks`.
    limit: AtomicUsize,
    /// Per block: end address of the objects allocated in it.
    frontiers: Box<[AtomicUsize]>,
    committed: Box<[AtomicBool]>,
    committed_bytes: AtomicUsize,
    pub bitmap: MarkBitmap,
}

impl BlockSpace {
    pub fn new(space: Space, start: usize, len: usize, block_size: usize) -> Self {
        debug_assert!(len.is_multiple_of(block_size));
        let num_blocks = len / block_size;
        let frontiers = (0..num_blocks)
            .map(|i| AtomicUsize::new(start + i * block_size))
            .collect();
        let committed = (0..num_blocks).map(|_| AtomicBool::new(false)).collect();

        Self {
            space,
            start,
            block_size,
            num_blocks,
            cursor: AtomicUsize::new(0),
            limit: AtomicUsize::new(num_blocks),
            frontiers,
            committed,
            committed_bytes: AtomicUsize::new(0),
            bitmap: MarkBitmap::new(start, len),
        }
    }

    #[inline(always)]
    pub fn space(&self) -> Space {
        self.space
    }

    #[inline(always)]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.start + self.len()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.num_blocks * self.block_size
    }

    #[inline(always)]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    #[inline(always)]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.start) < self.len()
    }

    #[inline(always)]
    pub fn block_base(&self, idx: usize) -> usize {
        debug_assert!(idx < self.num_blocks, "block {idx} out of range");
        self.start + idx * self.block_size
    }

    #[inline(always)]
    pub fn block_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.start) / self.block_size
    }

    #[inline(always)]
    pub fn frontier(&self, idx: usize) -> usize {
        self.frontiers[idx].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_frontier(&self, idx: usize, frontier: usize) {
        debug_assert!(frontier >= self.block_base(idx));
        debug_assert!(frontier <= self.block_base(idx) + self.block_size);
        self.frontiers[idx].store(frontier, Ordering::Relaxed);
    }

    /// Blocks handed out since the last reset.
    #[inline(always)]
    pub fn used_blocks(&self) -> usize {
        self.cursor.load(Ordering::Acquire).min(self.num_blocks)
    }

    pub fn free_blocks(&self) -> usize {
        self.limit().saturating_sub(self.used_blocks())
    }

    /// Number of blocks allocation contexts may use.
    #[inline(always)]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Caps allocation at `blocks` blocks and returns committed memory
    /// beyond the cap, except blocks still in use. Only called while no
    /// allocation context is active.
    pub fn set_limit(&self, blocks: usize) {
        debug_assert!(blocks > 0 && blocks <= self.num_blocks);
        let old = self.limit.swap(blocks, Ordering::Relaxed);
        let mut released = 0;
        for idx in blocks.max(self.used_blocks())..self.num_blocks {
            if self.committed[idx].swap(false, Ordering::AcqRel) {
                let base = self.block_base(idx) as *mut u8;
                // SAFETY: block bases are inside the heap reservation
                let ptr = unsafe { NonNull::new_unchecked(base) };
                system::decommit_memory(ptr, self.block_size);
                self.committed_bytes
                    .fetch_sub(self.block_size, Ordering::Relaxed);
                released += 1;
            }
        }
        log::debug!(
            "{:?}: limit {old} -> {blocks} blocks, released {released}",
            self.space
        );
    }

    /// Bytes available to allocation contexts (whole free blocks).
    pub fn free_bytes(&self) -> usize {
        self.free_blocks() * self.block_size
    }

    /// Bytes occupied by objects. Exact only while no allocation context
    /// holds an unretired block.
    pub fn used_bytes(&self) -> usize {
        (0..self.used_blocks())
            .map(|i| self.frontier(i) - self.block_base(i))
            .sum()
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes.load(Ordering::Relaxed)
    }

    /// Whether `[addr, addr + size)` lies within a handed-out block.
    pub fn is_allocated(&self, addr: usize, size: usize) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let block = self.block_of(addr);
        block < self.used_blocks() && addr + size <= self.block_base(block) + self.block_size
    }

    // ── Block acquisition ─────────────────────────────────────────────

    /// Commits block `idx` if it is not committed yet.
    pub fn commit_block(&self, idx: usize) -> bool {
        if self.committed[idx].load(Ordering::Acquire) {
            return true;
        }
        let base = self.block_base(idx) as *mut u8;
        // SAFETY: block bases are inside the heap reservation
        let ptr = unsafe { NonNull::new_unchecked(base) };
        if !system::commit_memory(ptr, self.block_size) {
            log::error!("{:?}: failed to commit block {idx}", self.space);
            return false;
        }
        self.committed[idx].store(true, Ordering::Release);
        self.committed_bytes
            .fetch_add(self.block_size, Ordering::Relaxed);
        log::trace!("{:?}: committed block {idx}", self.space);
        true
    }

    /// Hands out the next free block, committing it if necessary.
    pub fn acquire_block(&self) -> Option<usize> {
        let idx = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < self.limit()).then_some(c + 1)
            })
            .ok()?;
        if !self.commit_block(idx) {
            return None;
        }
        self.set_frontier(idx, self.block_base(idx));
        Some(idx)
    }

    /// Retires the context's block and points the context at a fresh one.
    /// Returns the new block index.
    pub fn refill(&self, tlab: &mut Tlab) -> Option<usize> {
        self.retire(tlab);
        let idx = self.acquire_block()?;
        let base = self.block_base(idx);
        *tlab = Tlab {
            block: Some(idx),
            bump: base,
            limit: base + self.block_size,
        };
        Some(idx)
    }

    /// Publishes the context's frontier and empties the context.
    pub fn retire(&self, tlab: &mut Tlab) {
        if let Some(block) = tlab.block.take() {
            self.set_frontier(block, tlab.bump);
        }
        *tlab = Tlab::default();
    }

    /// Bump allocates `size` bytes, refilling the context once if needed.
    #[inline]
    pub fn allocate(&self, tlab: &mut Tlab, size: usize) -> Option<usize> {
        debug_assert!(size <= self.block_size);
        if let Some(addr) = tlab.bump(size) {
            return Some(addr);
        }
        self.refill(tlab)?;
        tlab.bump(size)
    }

    // ── Collection support ────────────────────────────────────────────

    /// Sets the handed-out block count to `used`. Blocks past it become
    /// allocatable again; with `decommit` they are returned to the OS.
    /// Growing is allowed when the new blocks were committed beforehand.
    pub fn truncate(&self, used: usize, decommit: bool) {
        let old = self.used_blocks();
        debug_assert!(used <= self.num_blocks);
        for idx in used..old.max(used) {
            self.set_frontier(idx, self.block_base(idx));
            if decommit && self.committed[idx].swap(false, Ordering::AcqRel) {
                let base = self.block_base(idx) as *mut u8;
                // SAFETY: block bases are inside the heap reservation
                let ptr = unsafe { NonNull::new_unchecked(base) };
                system::decommit_memory(ptr, self.block_size);
                self.committed_bytes
                    .fetch_sub(self.block_size, Ordering::Relaxed);
            }
        }
        if decommit && old > used {
            log::trace!("{:?}: decommitted {} blocks", self.space, old - used);
        }
        self.cursor.store(used, Ordering::Release);
    }

    /// Makes every block allocatable again, keeping them committed.
    pub fn reset(&self) {
        self.truncate(0, false);
    }

    /// Visits the objects of block `idx` from its base to its frontier.
    ///
    /// # Safety
    ///
    /// `[base, frontier)` of the block must hold initialized objects back
    /// to back.
    pub unsafe fn walk_block(&self, idx: usize, mut f: impl FnMut(ObjRef)) {
        let frontier = self.frontier(idx);
        let mut cur = self.block_base(idx);
        while cur < frontier {
            let obj = ObjRef::from_addr(cur);
            // SAFETY: caller guarantees a dense run of objects
            let size = unsafe { object_size(obj) };
            debug_assert!(size > 0 && cur + size <= frontier, "object overruns block frontier");
            f(obj);
            cur += size;
        }
    }
}
